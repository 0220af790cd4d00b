//! Stage lifecycle for a running process.
//!
//! The scheduler tracks turns within the current stage, evaluates completion
//! rules, and drives transitions: dismiss the finished stage's agents, bump
//! the index, spawn the next roster. It never owns sessions or sockets — the
//! hub implements [`SchedulerDelegate`] and stays the single owner of both.
//!
//! Completion counting is aggregate: a stage with a turn budget of N finishes
//! after N completed turns summed across its roster, whatever the discipline.
//! Only sequential stages prompt the next participant; parallel and single
//! stages let their agents run unprompted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use overworld_core::process::{
    turn_key, CompletionRule, ProcessDefinition, ProcessState, StageDefinition, TurnDiscipline,
};

#[derive(Clone, Debug, thiserror::Error)]
#[error("{0}")]
pub struct DelegateError(pub String);

/// Transition notifications the hub turns into wire messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageEvent {
    StageStarted {
        stage_id: String,
        stage_name: String,
        stage_index: usize,
        total_stages: usize,
    },
    StageAdvanced {
        from_stage_id: String,
        from_stage_name: String,
        to_stage_id: Option<String>,
        to_stage_name: Option<String>,
        stage_index: usize,
        total_stages: usize,
    },
    ProcessCompleted {
        process_id: String,
        problem: String,
    },
    Error {
        message: String,
    },
}

/// Callbacks into the hub. The scheduler calls these without holding any
/// internal lock.
#[async_trait]
pub trait SchedulerDelegate: Send + Sync {
    async fn dismiss_stage_agents(&self, stage: &StageDefinition) -> Result<(), DelegateError>;
    async fn spawn_stage_agents(
        &self,
        template: &ProcessDefinition,
        stage_index: usize,
        problem: &str,
    ) -> Result<(), DelegateError>;
    async fn broadcast(&self, event: StageEvent);
    /// Persist an artifact produced during the current stage.
    async fn save_artifact(&self, stage_id: &str, artifact_id: &str, content: &str);
    /// Record the finished stage in the world store (bumps its stage index).
    async fn stage_advanced(&self, completed_stage_id: &str);
    /// Mark the process completed in the world store.
    async fn process_completed(&self, final_stage_id: &str);
    async fn follow_up(&self, agent_id: &str, prompt: &str) -> Result<(), DelegateError>;
}

struct SchedState {
    context: Option<StageContext>,
    stage_turn_counts: HashMap<String, u32>,
    agent_turn_counts: HashMap<String, u32>,
}

struct StageContext {
    problem: String,
    template: ProcessDefinition,
    stage_index: usize,
    stage_started_at: DateTime<Utc>,
}

pub struct StageScheduler {
    state: Mutex<SchedState>,
    /// Turn signals arriving mid-transition are dropped, not queued.
    advancing: AtomicBool,
    delegate: Arc<dyn SchedulerDelegate>,
}

impl StageScheduler {
    pub fn new(delegate: Arc<dyn SchedulerDelegate>) -> Self {
        Self {
            state: Mutex::new(SchedState {
                context: None,
                stage_turn_counts: HashMap::new(),
                agent_turn_counts: HashMap::new(),
            }),
            advancing: AtomicBool::new(false),
            delegate,
        }
    }

    /// Begin a fresh process. Assumes the hub has already spawned stage 0's
    /// agents.
    pub async fn start(&self, problem: &str, template: ProcessDefinition) {
        let first = {
            let mut state = self.state.lock();
            state.stage_turn_counts.clear();
            state.agent_turn_counts.clear();
            let first = template.stages.first().map(|s| StageEvent::StageStarted {
                stage_id: s.id.clone(),
                stage_name: s.name.clone(),
                stage_index: 0,
                total_stages: template.stages.len(),
            });
            state.context = Some(StageContext {
                problem: problem.to_string(),
                template,
                stage_index: 0,
                stage_started_at: Utc::now(),
            });
            first
        };
        self.advancing.store(false, Ordering::SeqCst);
        if let Some(event) = first {
            self.delegate.broadcast(event).await;
        }
    }

    /// Rebuild the scheduler from a persisted [`ProcessState`] without any
    /// broadcasts or delegate calls.
    pub fn restore(delegate: Arc<dyn SchedulerDelegate>, state: &ProcessState, template: ProcessDefinition) -> Self {
        let scheduler = Self::new(delegate);
        {
            let mut guard = scheduler.state.lock();
            guard.stage_turn_counts = state.stage_turn_counts.clone();
            guard.agent_turn_counts = state.agent_turn_counts.clone();
            guard.context = Some(StageContext {
                problem: state.problem.clone(),
                template,
                stage_index: state.current_stage_index,
                stage_started_at: state.stage_started_at.unwrap_or_else(Utc::now),
            });
        }
        scheduler
    }

    /// Merge the scheduler's volatile counters into a persisted state.
    pub fn snapshot_into(&self, base: &mut ProcessState) {
        let state = self.state.lock();
        base.stage_turn_counts = state.stage_turn_counts.clone();
        base.agent_turn_counts = state.agent_turn_counts.clone();
        if let Some(context) = &state.context {
            base.current_stage_index = context.stage_index;
            base.stage_started_at = Some(context.stage_started_at);
        }
    }

    /// Stop tracking, e.g. on realm switch. Sessions are the hub's problem.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.context = None;
        state.stage_turn_counts.clear();
        state.agent_turn_counts.clear();
        self.advancing.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().context.is_some()
    }

    pub fn current_stage(&self) -> Option<StageDefinition> {
        let state = self.state.lock();
        let context = state.context.as_ref()?;
        context.template.stage(context.stage_index).cloned()
    }

    /// Called whenever an agent finishes a turn (goes idle). Ignored when no
    /// process is running, a transition is in flight, or the agent is not in
    /// the current stage's roster.
    pub async fn on_agent_turn_complete(&self, agent_id: &str) {
        if self.advancing.load(Ordering::SeqCst) {
            return;
        }

        enum Next {
            Advance,
            Prompt(String),
            Nothing,
        }

        let (next, stage_name) = {
            let mut state = self.state.lock();
            let Some(context) = state.context.as_ref() else {
                return;
            };
            let Some(stage) = context.template.stage(context.stage_index).cloned() else {
                return;
            };
            if !stage.roles.iter().any(|r| r == agent_id) {
                return;
            }

            let agent_key = turn_key(&stage.id, agent_id);
            let agent_count = state.agent_turn_counts.get(&agent_key).copied().unwrap_or(0) + 1;
            state.agent_turn_counts.insert(agent_key, agent_count);

            let stage_count = state.stage_turn_counts.get(&stage.id).copied().unwrap_or(0) + 1;
            state.stage_turn_counts.insert(stage.id.clone(), stage_count);

            tracing::info!(
                stage = %stage.name,
                agent_id,
                agent_turns = agent_count,
                stage_turns = stage_count,
                "turn complete"
            );

            let complete = match stage.completion {
                CompletionRule::TurnCount { turns } => stage_count >= turns,
                CompletionRule::ExplicitSignal => false,
            };
            let next = if complete {
                Next::Advance
            } else if let TurnDiscipline::Sequential { order } = &stage.discipline {
                match next_in_cycle(order, agent_id) {
                    Some(next_agent) => Next::Prompt(next_agent),
                    None => Next::Nothing,
                }
            } else {
                Next::Nothing
            };
            (next, stage.name.clone())
        };

        match next {
            Next::Advance => self.advance().await,
            Next::Prompt(next_agent) => {
                let prompt = format!(
                    "[PROCESS TURN] It's your turn. The previous participant just finished. \
                     Continue the {stage_name} stage and share your perspective with the group."
                );
                if let Err(e) = self.delegate.follow_up(&next_agent, &prompt).await {
                    tracing::warn!(agent_id = %next_agent, error = %e, "turn follow-up failed");
                }
            }
            Next::Nothing => {}
        }
    }

    /// Called when an agent explicitly signals stage completion. Persists any
    /// provided artifacts, then advances regardless of turn counts.
    pub async fn on_explicit_stage_complete(&self, agent_id: &str, artifacts: &HashMap<String, String>) {
        if self.advancing.load(Ordering::SeqCst) {
            return;
        }
        let stage = {
            let state = self.state.lock();
            let Some(context) = state.context.as_ref() else {
                return;
            };
            let Some(stage) = context.template.stage(context.stage_index).cloned() else {
                return;
            };
            if !stage.roles.iter().any(|r| r == agent_id) {
                return;
            }
            stage
        };

        tracing::info!(agent_id, stage = %stage.name, "explicit stage completion");
        for (artifact_id, content) in artifacts {
            self.delegate.save_artifact(&stage.id, artifact_id, content).await;
        }
        self.advance().await;
    }

    async fn advance(&self) {
        if self
            .advancing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let Some((problem, template, stage_index)) = ({
            let state = self.state.lock();
            state.context.as_ref().map(|c| (c.problem.clone(), c.template.clone(), c.stage_index))
        }) else {
            self.advancing.store(false, Ordering::SeqCst);
            return;
        };

        let Some(current) = template.stage(stage_index).cloned() else {
            self.advancing.store(false, Ordering::SeqCst);
            return;
        };
        let next_index = stage_index + 1;
        let next = template.stage(next_index).cloned();

        self.delegate.stage_advanced(&current.id).await;
        self.delegate
            .broadcast(StageEvent::StageAdvanced {
                from_stage_id: current.id.clone(),
                from_stage_name: current.name.clone(),
                to_stage_id: next.as_ref().map(|s| s.id.clone()),
                to_stage_name: next.as_ref().map(|s| s.name.clone()),
                stage_index: next_index,
                total_stages: template.stages.len(),
            })
            .await;

        let Some(next) = next else {
            self.delegate.process_completed(&current.id).await;
            self.state.lock().context = None;
            self.delegate
                .broadcast(StageEvent::ProcessCompleted {
                    process_id: template.id.clone(),
                    problem: problem.clone(),
                })
                .await;
            self.advancing.store(false, Ordering::SeqCst);
            return;
        };

        if let Err(e) = self.delegate.dismiss_stage_agents(&current).await {
            tracing::warn!(error = %e, "dismissing stage agents failed");
        }

        {
            let mut state = self.state.lock();
            if let Some(context) = state.context.as_mut() {
                context.stage_index = next_index;
                context.stage_started_at = Utc::now();
            }
        }
        self.advancing.store(false, Ordering::SeqCst);

        // A spawn failure leaves the stage index where it is; the operator can
        // retry by dismissing and re-linking, and counters already refer to
        // the new stage.
        if let Err(e) = self.delegate.spawn_stage_agents(&template, next_index, &problem).await {
            tracing::error!(error = %e, stage = %next.name, "spawning next stage failed");
            self.delegate
                .broadcast(StageEvent::Error { message: format!("failed to start stage {}: {e}", next.name) })
                .await;
            return;
        }

        self.delegate
            .broadcast(StageEvent::StageStarted {
                stage_id: next.id.clone(),
                stage_name: next.name.clone(),
                stage_index: next_index,
                total_stages: template.stages.len(),
            })
            .await;
    }
}

fn next_in_cycle(order: &[String], current: &str) -> Option<String> {
    if order.is_empty() {
        return None;
    }
    let idx = order.iter().position(|a| a == current)?;
    Some(order[(idx + 1) % order.len()].clone())
}
