//! One lifecycle record per active agent.
//!
//! The manager owns spawn / follow-up / dismiss, the FIFO prompt queue, and
//! the background consumption loop that turns a runtime stream into typed
//! [`Signal`]s. An agent is *busy* while its status is Starting or Running,
//! and also until its first resume token arrives; follow-ups sent to a busy
//! agent queue and drain automatically when the agent goes idle.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use overworld_core::ids::AgentId;
use overworld_core::runtime::RuntimeMessage;

use crate::findings::FindingsBoard;
use crate::prompt::{build_system_prompt, PromptInputs, TeamMember};
use crate::runtime::{AgentRuntime, RunSpec};
use crate::vault::KnowledgeVault;

const CHECKPOINT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Clone, Debug, thiserror::Error)]
pub enum SessionError {
    #[error("agent \"{0}\" is already active")]
    AlreadyActive(AgentId),
    #[error("no active session for agent \"{0}\"")]
    NotFound(AgentId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Starting,
    Running,
    Idle,
    Stopped,
}

/// What a session is allowed to touch in the repository.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermissionTier {
    ReadOnly,
    WriteWithApproval,
    Full,
}

impl PermissionTier {
    pub fn allowed_tools(&self) -> Vec<String> {
        let tools: &[&str] = match self {
            Self::ReadOnly => &["Read", "Glob", "Grep"],
            Self::WriteWithApproval => &["Read", "Glob", "Grep", "Edit", "Write"],
            Self::Full => &["Read", "Glob", "Grep", "Edit", "Write", "Bash"],
        };
        tools.iter().map(|t| t.to_string()).collect()
    }
}

/// Stage context injected into an agent's system prompt during a process.
#[derive(Clone, Debug)]
pub struct ProcessAgentContext {
    pub problem: String,
    pub process_name: String,
    pub stage_id: String,
    pub stage_name: String,
    pub stage_goal: String,
    pub stage_index: usize,
    pub total_stages: usize,
    pub persona: String,
    /// stage id -> artifact id -> content, from all prior stages.
    pub prior_artifacts: HashMap<String, HashMap<String, String>>,
    /// True when the agent was respawned into a resumed realm.
    pub resumed: bool,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub agent_id: AgentId,
    pub agent_name: String,
    pub role: String,
    pub realm: String,
    pub mission: String,
    pub root: PathBuf,
    pub permissions: PermissionTier,
    pub process: Option<ProcessAgentContext>,
}

/// Typed lifecycle signals consumed by the hub's signal pump.
#[derive(Debug)]
pub enum Signal {
    Message { agent_id: AgentId, message: RuntimeMessage },
    Complete { agent_id: AgentId },
    Idle { agent_id: AgentId },
    Dismissed { agent_id: AgentId },
    Error { agent_id: AgentId, message: String },
}

struct SessionEntry {
    config: SessionConfig,
    vault: KnowledgeVault,
    resume_token: Option<String>,
    status: SessionStatus,
    pending: VecDeque<String>,
    cancel: CancellationToken,
    checkpoint: Option<JoinHandle<()>>,
}

pub struct SessionManager {
    runtime: Arc<dyn AgentRuntime>,
    sessions: DashMap<AgentId, Arc<Mutex<SessionEntry>>>,
    findings: Arc<Mutex<FindingsBoard>>,
    signals: mpsc::UnboundedSender<Signal>,
}

impl SessionManager {
    pub fn new(
        runtime: Arc<dyn AgentRuntime>,
        findings: Arc<Mutex<FindingsBoard>>,
        signals: mpsc::UnboundedSender<Signal>,
    ) -> Self {
        Self {
            runtime,
            sessions: DashMap::new(),
            findings,
            signals,
        }
    }

    /// Spawn a new agent session. The run itself happens in the background;
    /// runtime failures surface as [`Signal::Error`], never as a caller error.
    pub async fn spawn(self: &Arc<Self>, config: SessionConfig) -> Result<(), SessionError> {
        let agent_id = config.agent_id.clone();
        if self.sessions.contains_key(&agent_id) {
            return Err(SessionError::AlreadyActive(agent_id));
        }

        let mut vault = KnowledgeVault::new(
            &config.root,
            &agent_id,
            &config.agent_name,
            &config.role,
            &config.realm,
        );
        vault.load().await;

        let mission = config.mission.clone();
        let entry = Arc::new(Mutex::new(SessionEntry {
            config,
            vault,
            resume_token: None,
            status: SessionStatus::Starting,
            pending: VecDeque::new(),
            cancel: CancellationToken::new(),
            checkpoint: None,
        }));

        // Claim the id atomically; the contains_key above is only a fast path
        // and another spawn may have landed while the vault was loading.
        match self.sessions.entry(agent_id.clone()) {
            Entry::Occupied(_) => return Err(SessionError::AlreadyActive(agent_id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&entry));
            }
        }

        // Flush the vault every minute so a crash loses at most a minute of
        // knowledge.
        let checkpoint = tokio::spawn({
            let entry = Arc::clone(&entry);
            async move {
                let mut interval = tokio::time::interval(CHECKPOINT_INTERVAL);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    entry.lock().await.vault.save().await;
                }
            }
        });
        entry.lock().await.checkpoint = Some(checkpoint);
        tracing::info!(agent_id = %agent_id, "agent session spawned");

        self.spawn_run(entry, mission, None);
        Ok(())
    }

    /// Follow up with an existing session. Busy sessions queue the prompt;
    /// idle sessions resume immediately with it.
    pub async fn follow_up(self: &Arc<Self>, agent_id: &AgentId, prompt: String) -> Result<(), SessionError> {
        let entry = self
            .sessions
            .get(agent_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| SessionError::NotFound(agent_id.clone()))?;

        let mut guard = entry.lock().await;
        let busy = guard.resume_token.is_none()
            || matches!(guard.status, SessionStatus::Starting | SessionStatus::Running);
        if busy {
            guard.pending.push_back(prompt);
            tracing::info!(
                agent_id = %agent_id,
                queued = guard.pending.len(),
                "agent busy, prompt queued"
            );
            return Ok(());
        }

        guard.cancel = CancellationToken::new();
        guard.status = SessionStatus::Starting;
        let resume = guard.resume_token.clone();
        drop(guard);

        self.spawn_run(entry, prompt, resume);
        Ok(())
    }

    /// Dismiss an agent: cancel any in-flight run, save the vault, remove the
    /// record. Dismissing an unknown agent is a no-op.
    pub async fn dismiss(&self, agent_id: &AgentId) {
        let Some((_, entry)) = self.sessions.remove(agent_id) else {
            return;
        };

        let mut guard = entry.lock().await;
        if let Some(checkpoint) = guard.checkpoint.take() {
            checkpoint.abort();
        }
        guard.cancel.cancel();
        guard.status = SessionStatus::Stopped;
        guard.vault.save().await;
        drop(guard);

        tracing::info!(agent_id = %agent_id, "agent dismissed");
        let _ = self.signals.send(Signal::Dismissed { agent_id: agent_id.clone() });
    }

    /// Tear down every session, e.g. when switching realms.
    pub async fn dismiss_all(&self) {
        let ids: Vec<AgentId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.dismiss(&id).await;
        }
    }

    pub fn active_ids(&self) -> Vec<AgentId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_active(&self, agent_id: &AgentId) -> bool {
        self.sessions.contains_key(agent_id)
    }

    pub async fn status(&self, agent_id: &AgentId) -> Option<SessionStatus> {
        let entry = self.sessions.get(agent_id).map(|e| Arc::clone(e.value()))?;
        let status = entry.lock().await.status;
        Some(status)
    }

    pub async fn queued_prompts(&self, agent_id: &AgentId) -> usize {
        match self.sessions.get(agent_id).map(|e| Arc::clone(e.value())) {
            Some(entry) => entry.lock().await.pending.len(),
            None => 0,
        }
    }

    /// Record an insight into an agent's vault, if the agent is active.
    pub async fn with_vault<F>(&self, agent_id: &AgentId, f: F)
    where
        F: FnOnce(&mut KnowledgeVault),
    {
        if let Some(entry) = self.sessions.get(agent_id).map(|e| Arc::clone(e.value())) {
            f(&mut entry.lock().await.vault);
        }
    }

    /// Roster of every other active agent, for prompt assembly.
    pub async fn team_roster(&self, exclude: &AgentId) -> Vec<TeamMember> {
        let mut roster = Vec::new();
        let entries: Vec<(AgentId, Arc<Mutex<SessionEntry>>)> = self
            .sessions
            .iter()
            .filter(|e| e.key() != exclude)
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        for (id, entry) in entries {
            let guard = entry.lock().await;
            roster.push(TeamMember {
                agent_id: id.to_string(),
                agent_name: guard.config.agent_name.clone(),
                role: guard.config.role.clone(),
                realm: guard.config.realm.clone(),
                expertise_summary: guard.vault.expertise_summary(),
            });
        }
        roster
    }

    // ── Background run ──

    fn spawn_run(self: &Arc<Self>, entry: Arc<Mutex<SessionEntry>>, prompt: String, resume: Option<String>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run(entry, prompt, resume).await;
        });
    }

    async fn run(self: Arc<Self>, entry: Arc<Mutex<SessionEntry>>, prompt: String, resume: Option<String>) {
        let (agent_id, cancel, spec) = {
            let guard = entry.lock().await;
            let agent_id = guard.config.agent_id.clone();
            let team = self.team_roster(&agent_id).await;
            let findings = self.findings.lock().await;
            let system_prompt = build_system_prompt(&PromptInputs {
                agent_name: &guard.config.agent_name,
                role: &guard.config.role,
                realm: &guard.config.realm,
                mission: &guard.config.mission,
                vault: &guard.vault,
                team,
                findings: &findings,
                process: guard.config.process.as_ref(),
            });
            drop(findings);
            let spec = RunSpec {
                agent_id: agent_id.clone(),
                system_prompt,
                prompt,
                allowed_tools: guard.config.permissions.allowed_tools(),
                resume,
                root: guard.config.root.clone(),
            };
            (agent_id, guard.cancel.clone(), spec)
        };

        match self.runtime.start(spec).await {
            Ok(mut stream) => {
                entry.lock().await.status = SessionStatus::Running;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        message = stream.next() => {
                            let Some(message) = message else { break };
                            if let Some(token) = message.resume_token() {
                                entry.lock().await.resume_token = Some(token.to_string());
                            }
                            let is_result = message.is_result();
                            let _ = self.signals.send(Signal::Message {
                                agent_id: agent_id.clone(),
                                message,
                            });
                            if is_result {
                                let _ = self.signals.send(Signal::Complete { agent_id: agent_id.clone() });
                            }
                        }
                    }
                }
            }
            Err(e) => {
                if !cancel.is_cancelled() {
                    tracing::warn!(agent_id = %agent_id, error = %e, "agent run failed to start");
                    let _ = self.signals.send(Signal::Error {
                        agent_id: agent_id.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        self.finish_run(entry, agent_id).await;
    }

    /// Shared tail for every run: flush the vault, go idle unless dismissed,
    /// then drain one queued prompt.
    async fn finish_run(self: &Arc<Self>, entry: Arc<Mutex<SessionEntry>>, agent_id: AgentId) {
        let mut guard = entry.lock().await;
        guard.vault.save().await;
        if guard.status == SessionStatus::Stopped {
            return;
        }
        guard.status = SessionStatus::Idle;
        let _ = self.signals.send(Signal::Idle { agent_id: agent_id.clone() });

        if let Some(next) = guard.pending.pop_front() {
            tracing::info!(
                agent_id = %agent_id,
                remaining = guard.pending.len(),
                "draining queued prompt"
            );
            guard.cancel = CancellationToken::new();
            guard.status = SessionStatus::Starting;
            let resume = guard.resume_token.clone();
            drop(guard);
            self.spawn_run(entry, next, resume);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockRuntime, MockScript};
    use std::time::Duration;

    fn config(id: &str) -> SessionConfig {
        SessionConfig {
            agent_id: AgentId::from_raw(id),
            agent_name: id.to_uppercase(),
            role: "Explorer".into(),
            realm: String::new(),
            mission: "explore".into(),
            root: std::env::temp_dir().join(format!("overworld-mgr-test-{}", uuid::Uuid::now_v7())),
            permissions: PermissionTier::ReadOnly,
            process: None,
        }
    }

    fn manager(
        scripts: Vec<MockScript>,
    ) -> (Arc<SessionManager>, Arc<MockRuntime>, mpsc::UnboundedReceiver<Signal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let findings = Arc::new(Mutex::new(FindingsBoard::new(std::path::Path::new("."))));
        let runtime = Arc::new(MockRuntime::new(scripts));
        let manager = Arc::new(SessionManager::new(Arc::clone(&runtime) as _, findings, tx));
        (manager, runtime, rx)
    }

    async fn drain_signals(rx: &mut mpsc::UnboundedReceiver<Signal>) -> Vec<String> {
        let mut kinds = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            kinds.push(match signal {
                Signal::Message { .. } => "message".to_string(),
                Signal::Complete { .. } => "complete".to_string(),
                Signal::Idle { .. } => "idle".to_string(),
                Signal::Dismissed { .. } => "dismissed".to_string(),
                Signal::Error { message, .. } => format!("error:{message}"),
            });
        }
        kinds
    }

    #[tokio::test]
    async fn spawn_runs_to_idle() {
        let (manager, _runtime, mut rx) = manager(vec![MockScript::simple_turn("t1", "hello")]);
        manager.spawn(config("a")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let agent = AgentId::from_raw("a");
        assert_eq!(manager.status(&agent).await, Some(SessionStatus::Idle));

        let kinds = drain_signals(&mut rx).await;
        // init + assistant + result messages, then complete, then idle.
        assert_eq!(kinds.iter().filter(|k| *k == "message").count(), 3);
        assert!(kinds.contains(&"complete".to_string()));
        assert_eq!(kinds.last().unwrap(), "idle");
    }

    #[tokio::test]
    async fn duplicate_spawn_is_rejected_without_side_effects() {
        let (manager, runtime, _rx) = manager(vec![
            MockScript::simple_turn("t1", "one"),
            MockScript::simple_turn("t2", "two"),
        ]);
        manager.spawn(config("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = manager.spawn(config("a")).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyActive(_)));
        // The existing session is untouched and the runtime never ran again.
        assert_eq!(runtime.call_count(), 1);
        assert_eq!(manager.active_ids(), vec![AgentId::from_raw("a")]);
        assert_eq!(
            manager.status(&AgentId::from_raw("a")).await,
            Some(SessionStatus::Idle)
        );
    }

    #[tokio::test]
    async fn follow_up_to_unknown_agent_errors() {
        let (manager, _runtime, _rx) = manager(vec![]);
        let err = manager
            .follow_up(&AgentId::from_raw("ghost"), "hi".into())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test]
    async fn follow_up_on_idle_agent_resumes() {
        let (manager, _runtime, mut rx) = manager(vec![
            MockScript::simple_turn("t1", "first"),
            MockScript::simple_turn("t1", "second"),
        ]);
        let agent = AgentId::from_raw("a");
        manager.spawn(config("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = drain_signals(&mut rx).await;

        manager.follow_up(&agent, "again".into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(manager.status(&agent).await, Some(SessionStatus::Idle));
        let kinds = drain_signals(&mut rx).await;
        assert!(kinds.contains(&"complete".to_string()));
    }

    #[tokio::test]
    async fn busy_agent_queues_prompts_fifo() {
        let (manager, runtime, mut rx) = manager(vec![
            MockScript::Delayed(Duration::from_millis(80), vec![
                RuntimeMessage::System { subtype: "init".into(), session_id: Some("t1".into()) },
                RuntimeMessage::Result { session_id: Some("t1".into()), is_error: false, result: None },
            ]),
            MockScript::simple_turn("t1", "first follow-up"),
            MockScript::simple_turn("t1", "second follow-up"),
        ]);
        let agent = AgentId::from_raw("a");
        manager.spawn(config("a")).await.unwrap();

        // Still starting: both prompts must queue.
        manager.follow_up(&agent, "one".into()).await.unwrap();
        manager.follow_up(&agent, "two".into()).await.unwrap();
        assert_eq!(manager.queued_prompts(&agent).await, 2);

        // Let the initial run and both drained follow-ups finish.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(manager.queued_prompts(&agent).await, 0);
        assert_eq!(manager.status(&agent).await, Some(SessionStatus::Idle));

        let kinds = drain_signals(&mut rx).await;
        // Three runs, three idles.
        assert_eq!(kinds.iter().filter(|k| *k == "idle").count(), 3);
        assert_eq!(kinds.iter().filter(|k| *k == "complete").count(), 3);

        // Queue drained in submission order, resuming with the captured token.
        assert_eq!(runtime.prompts(), vec!["explore", "one", "two"]);
        assert_eq!(
            runtime.resumes(),
            vec![None, Some("t1".to_string()), Some("t1".to_string())]
        );
    }

    #[tokio::test]
    async fn run_without_token_stays_busy() {
        // The run errors before producing a resume token, so the session goes
        // idle but follow-ups still queue (no token to resume with).
        let (manager, _runtime, mut rx) = manager(vec![MockScript::Error(
            crate::runtime::RuntimeError::Launch("no binary".into()),
        )]);
        let agent = AgentId::from_raw("a");
        manager.spawn(config("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let kinds = drain_signals(&mut rx).await;
        assert!(kinds.iter().any(|k| k.starts_with("error:")));
        assert_eq!(manager.status(&agent).await, Some(SessionStatus::Idle));

        manager.follow_up(&agent, "hello?".into()).await.unwrap();
        assert_eq!(manager.queued_prompts(&agent).await, 1);
    }

    #[tokio::test]
    async fn dismiss_is_idempotent_and_emits_once() {
        let (manager, _runtime, mut rx) = manager(vec![MockScript::simple_turn("t1", "hi")]);
        let agent = AgentId::from_raw("a");
        manager.spawn(config("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = drain_signals(&mut rx).await;

        manager.dismiss(&agent).await;
        manager.dismiss(&agent).await;
        manager.dismiss(&agent).await;

        assert!(!manager.is_active(&agent));
        let kinds = drain_signals(&mut rx).await;
        assert_eq!(kinds.iter().filter(|k| *k == "dismissed").count(), 1);
    }

    #[tokio::test]
    async fn dismiss_cancels_in_flight_run() {
        let (manager, _runtime, mut rx) = manager(vec![MockScript::Delayed(
            Duration::from_secs(30),
            vec![RuntimeMessage::Result { session_id: None, is_error: false, result: None }],
        )]);
        let agent = AgentId::from_raw("a");
        manager.spawn(config("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        manager.dismiss(&agent).await;
        assert!(!manager.is_active(&agent));
        let kinds = drain_signals(&mut rx).await;
        assert!(kinds.contains(&"dismissed".to_string()));
        // No idle for a stopped session.
        assert!(!kinds.contains(&"idle".to_string()));
    }

    #[tokio::test]
    async fn dismiss_all_clears_every_session() {
        let (manager, _runtime, _rx) = manager(vec![
            MockScript::simple_turn("t1", "a"),
            MockScript::simple_turn("t2", "b"),
        ]);
        manager.spawn(config("a")).await.unwrap();
        manager.spawn(config("b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(manager.active_ids().len(), 2);
        manager.dismiss_all().await;
        assert!(manager.active_ids().is_empty());
    }

    #[tokio::test]
    async fn team_roster_excludes_the_asking_agent() {
        let (manager, _runtime, _rx) = manager(vec![
            MockScript::simple_turn("t1", "a"),
            MockScript::simple_turn("t2", "b"),
        ]);
        manager.spawn(config("a")).await.unwrap();
        manager.spawn(config("b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let roster = manager.team_roster(&AgentId::from_raw("a")).await;
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].agent_id, "b");
    }
}
