//! System prompt assembly for agent runs.
//!
//! Deterministic string building only; the interesting prompt engineering
//! lives with the runtime's own templates.

use crate::findings::FindingsBoard;
use crate::manager::ProcessAgentContext;
use crate::vault::KnowledgeVault;

pub struct PromptInputs<'a> {
    pub agent_name: &'a str,
    pub role: &'a str,
    pub realm: &'a str,
    pub mission: &'a str,
    pub vault: &'a KnowledgeVault,
    pub team: Vec<TeamMember>,
    pub findings: &'a FindingsBoard,
    pub process: Option<&'a ProcessAgentContext>,
}

#[derive(Clone, Debug)]
pub struct TeamMember {
    pub agent_id: String,
    pub agent_name: String,
    pub role: String,
    pub realm: String,
    pub expertise_summary: String,
}

pub fn build_system_prompt(inputs: &PromptInputs<'_>) -> String {
    let mut sections = Vec::new();

    sections.push(format!(
        "You are {name}, a {role} exploring this codebase. Your realm is `{realm}`.",
        name = inputs.agent_name,
        role = inputs.role,
        realm = if inputs.realm.is_empty() { "/" } else { inputs.realm },
    ));
    sections.push(format!("Mission: {}", inputs.mission));

    let knowledge = inputs.vault.knowledge();
    if !knowledge.insights.is_empty() {
        let recent: Vec<_> = knowledge.insights.iter().rev().take(10).rev().cloned().collect();
        sections.push(format!("What you already know:\n{}", bullet_list(&recent)));
    }
    let expertise = inputs.vault.expertise_summary();
    if expertise != "No expertise yet." {
        sections.push(format!("Your strongest areas: {expertise}"));
    }

    if !inputs.team.is_empty() {
        let roster: Vec<String> = inputs
            .team
            .iter()
            .map(|m| format!("{} ({}, realm `{}`) — {}", m.agent_name, m.role, m.realm, m.expertise_summary))
            .collect();
        sections.push(format!("Teammates you can consult:\n{}", bullet_list(&roster)));
    }

    let findings = inputs.findings.summary();
    if findings != "No findings yet." {
        sections.push(format!("Recent team findings:\n{findings}"));
    }

    if let Some(process) = inputs.process {
        sections.push(process_section(process));
    }

    sections.join("\n\n")
}

fn process_section(process: &ProcessAgentContext) -> String {
    let mut out = format!(
        "You are participating in a \"{name}\" session about: {problem}\n\
         Current stage {n} of {total}: {stage} — {goal}\n\
         Your persona: {persona}",
        name = process.process_name,
        problem = process.problem,
        n = process.stage_index + 1,
        total = process.total_stages,
        stage = process.stage_name,
        goal = process.stage_goal,
        persona = process.persona,
    );
    if !process.prior_artifacts.is_empty() {
        let mut artifacts = Vec::new();
        for (stage_id, by_artifact) in &process.prior_artifacts {
            for (artifact_id, content) in by_artifact {
                artifacts.push(format!("[{stage_id}/{artifact_id}] {content}"));
            }
        }
        artifacts.sort();
        out.push_str("\n\nResults from earlier stages:\n");
        out.push_str(&bullet_list(&artifacts));
    }
    if process.resumed {
        out.push_str("\n\nThis session was resumed; pick up where the stage left off.");
    }
    out
}

fn bullet_list(items: &[String]) -> String {
    items.iter().map(|i| format!("- {i}")).collect::<Vec<_>>().join("\n")
}
