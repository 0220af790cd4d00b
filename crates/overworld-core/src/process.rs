//! Structured process templates and their runtime state.
//!
//! A process is a linear sequence of stages. Each stage names the roles that
//! participate, how turns are ordered, and what it takes to finish the stage.
//! Templates are immutable data; all mutation happens on [`ProcessState`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub id: String,
    pub name: String,
    pub persona: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// How turns are ordered within a stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnDiscipline {
    /// Agents take turns in a fixed cyclic order.
    Sequential { order: Vec<String> },
    /// All agents work at once; nobody is prompted to go next.
    Parallel,
    /// One designated role carries the stage alone.
    Single { role: String },
}

/// When a stage is considered done.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompletionRule {
    /// Done once the stage has accumulated this many completed turns, summed
    /// across every participating agent.
    TurnCount { turns: u32 },
    /// Done only when an agent explicitly signals completion.
    ExplicitSignal,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactDefinition {
    pub id: String,
    pub label: String,
    pub produced_by: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageDefinition {
    pub id: String,
    pub name: String,
    pub goal: String,
    /// Role ids active during this stage.
    pub roles: Vec<String>,
    pub discipline: TurnDiscipline,
    pub completion: CompletionRule,
    #[serde(default)]
    pub artifacts: Vec<ArtifactDefinition>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub roles: Vec<RoleDefinition>,
    pub stages: Vec<StageDefinition>,
}

impl ProcessDefinition {
    pub fn role(&self, id: &str) -> Option<&RoleDefinition> {
        self.roles.iter().find(|r| r.id == id)
    }

    pub fn stage(&self, index: usize) -> Option<&StageDefinition> {
        self.stages.get(index)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Completed,
    Paused,
}

/// Serializable snapshot of a process in flight. Lives inside the world state
/// so realm snapshots capture it and resume can rebuild the scheduler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessState {
    pub process_id: String,
    pub problem: String,
    pub current_stage_index: usize,
    pub status: ProcessStatus,
    /// stage id -> artifact id -> content.
    #[serde(default)]
    pub collected_artifacts: HashMap<String, HashMap<String, String>>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// stage id -> total completed turns across all agents.
    #[serde(default)]
    pub stage_turn_counts: HashMap<String, u32>,
    /// "stage_id:agent_id" -> completed turns for that agent in that stage.
    #[serde(default)]
    pub agent_turn_counts: HashMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_started_at: Option<DateTime<Utc>>,
}

impl ProcessState {
    pub fn new(process_id: impl Into<String>, problem: impl Into<String>) -> Self {
        Self {
            process_id: process_id.into(),
            problem: problem.into(),
            current_stage_index: 0,
            status: ProcessStatus::Running,
            collected_artifacts: HashMap::new(),
            started_at: Utc::now(),
            completed_at: None,
            stage_turn_counts: HashMap::new(),
            agent_turn_counts: HashMap::new(),
            stage_started_at: Some(Utc::now()),
        }
    }

    pub fn advance_stage(&mut self) {
        self.current_stage_index += 1;
        self.stage_started_at = Some(Utc::now());
    }

    pub fn complete(&mut self) {
        self.status = ProcessStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn set_artifact(&mut self, stage_id: &str, artifact_id: &str, content: String) {
        self.collected_artifacts
            .entry(stage_id.to_string())
            .or_default()
            .insert(artifact_id.to_string(), content);
    }
}

/// Counter key for per-agent turn tracking within a stage.
pub fn turn_key(stage_id: &str, agent_id: &str) -> String {
    format!("{stage_id}:{agent_id}")
}

/// Built-in process templates.
pub fn builtin_templates() -> Vec<ProcessDefinition> {
    vec![standard_brainstorm(), rapid_fire()]
}

pub fn template_by_id(id: &str) -> Option<ProcessDefinition> {
    builtin_templates().into_iter().find(|t| t.id == id)
}

fn standard_brainstorm() -> ProcessDefinition {
    ProcessDefinition {
        id: "standard_brainstorm".into(),
        name: "Standard Brainstorm".into(),
        description: "Frame the problem, alternate idea generation with critique, then synthesize.".into(),
        roles: vec![
            RoleDefinition {
                id: "facilitator".into(),
                name: "Facilitator".into(),
                persona: "You keep the session focused. Restate the problem crisply and set constraints.".into(),
                color: Some("#4fc3f7".into()),
            },
            RoleDefinition {
                id: "ideator".into(),
                name: "Ideator".into(),
                persona: "You generate bold, concrete ideas. Quantity over polish.".into(),
                color: Some("#81c784".into()),
            },
            RoleDefinition {
                id: "critic".into(),
                name: "Critic".into(),
                persona: "You stress-test ideas. Name the weakest assumption in each.".into(),
                color: Some("#e57373".into()),
            },
            RoleDefinition {
                id: "synthesizer".into(),
                name: "Synthesizer".into(),
                persona: "You merge surviving ideas into a coherent recommendation.".into(),
                color: Some("#ba68c8".into()),
            },
        ],
        stages: vec![
            StageDefinition {
                id: "framing".into(),
                name: "Problem Framing".into(),
                goal: "Produce a one-paragraph framing of the problem and its constraints.".into(),
                roles: vec!["facilitator".into()],
                discipline: TurnDiscipline::Single { role: "facilitator".into() },
                completion: CompletionRule::TurnCount { turns: 1 },
                artifacts: vec![],
            },
            StageDefinition {
                id: "ideation".into(),
                name: "Ideation".into(),
                goal: "Alternate between proposing ideas and critiquing them.".into(),
                roles: vec!["ideator".into(), "critic".into()],
                discipline: TurnDiscipline::Sequential {
                    order: vec!["ideator".into(), "critic".into()],
                },
                completion: CompletionRule::TurnCount { turns: 4 },
                artifacts: vec![],
            },
            StageDefinition {
                id: "synthesis".into(),
                name: "Synthesis".into(),
                goal: "Distill the discussion into a final recommendation.".into(),
                roles: vec!["synthesizer".into()],
                discipline: TurnDiscipline::Single { role: "synthesizer".into() },
                completion: CompletionRule::ExplicitSignal,
                artifacts: vec![ArtifactDefinition {
                    id: "recommendation".into(),
                    label: "Final recommendation".into(),
                    produced_by: "synthesizer".into(),
                }],
            },
        ],
    }
}

fn rapid_fire() -> ProcessDefinition {
    ProcessDefinition {
        id: "rapid_fire".into(),
        name: "Rapid Fire".into(),
        description: "Two idea sprinters race in parallel, then a judge picks the shortlist.".into(),
        roles: vec![
            RoleDefinition {
                id: "sprinter_a".into(),
                name: "Sprinter A".into(),
                persona: "You fire off short, distinct ideas as fast as you can.".into(),
                color: Some("#ffd54f".into()),
            },
            RoleDefinition {
                id: "sprinter_b".into(),
                name: "Sprinter B".into(),
                persona: "You fire off short, distinct ideas as fast as you can.".into(),
                color: Some("#ff8a65".into()),
            },
            RoleDefinition {
                id: "judge".into(),
                name: "Judge".into(),
                persona: "You rank the ideas and keep only the strongest three.".into(),
                color: Some("#90a4ae".into()),
            },
        ],
        stages: vec![
            StageDefinition {
                id: "burst".into(),
                name: "Idea Burst".into(),
                goal: "Generate as many distinct ideas as possible.".into(),
                roles: vec!["sprinter_a".into(), "sprinter_b".into()],
                discipline: TurnDiscipline::Parallel,
                completion: CompletionRule::TurnCount { turns: 6 },
                artifacts: vec![],
            },
            StageDefinition {
                id: "verdict".into(),
                name: "Verdict".into(),
                goal: "Pick the three strongest ideas and justify each.".into(),
                roles: vec!["judge".into()],
                discipline: TurnDiscipline::Single { role: "judge".into() },
                completion: CompletionRule::ExplicitSignal,
                artifacts: vec![ArtifactDefinition {
                    id: "shortlist".into(),
                    label: "Idea shortlist".into(),
                    produced_by: "judge".into(),
                }],
            },
        ],
    }
}
