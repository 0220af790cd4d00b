//! Per-agent knowledge that outlives individual runs.
//!
//! Stored as JSON under `<root>/.overworld/knowledge/<safe-id>.json`. Saves
//! are best-effort: a failed write is logged and the session carries on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use overworld_core::ids::AgentId;
use overworld_core::paths::sanitize_component;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: String,
    pub outcome: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentKnowledge {
    pub agent_id: String,
    pub agent_name: String,
    pub role: String,
    pub realm: String,
    #[serde(default)]
    pub expertise: HashMap<String, f64>,
    #[serde(default)]
    pub realm_knowledge: HashMap<String, f64>,
    #[serde(default)]
    pub insights: Vec<String>,
    #[serde(default)]
    pub task_history: Vec<TaskRecord>,
    #[serde(default)]
    pub files_analyzed: Vec<String>,
}

pub struct KnowledgeVault {
    knowledge: AgentKnowledge,
    file_path: PathBuf,
}

impl KnowledgeVault {
    pub fn new(root: &Path, agent_id: &AgentId, agent_name: &str, role: &str, realm: &str) -> Self {
        let safe_id = sanitize_component(agent_id.as_str());
        let file_path = root
            .join(".overworld")
            .join("knowledge")
            .join(format!("{safe_id}.json"));
        Self {
            knowledge: AgentKnowledge {
                agent_id: agent_id.to_string(),
                agent_name: agent_name.to_string(),
                role: role.to_string(),
                realm: realm.to_string(),
                expertise: HashMap::new(),
                realm_knowledge: HashMap::new(),
                insights: Vec::new(),
                task_history: Vec::new(),
                files_analyzed: Vec::new(),
            },
            file_path,
        }
    }

    /// Load existing knowledge if present; absence just means a fresh agent.
    pub async fn load(&mut self) {
        match tokio::fs::read_to_string(&self.file_path).await {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(knowledge) => self.knowledge = knowledge,
                Err(e) => {
                    tracing::warn!(path = %self.file_path.display(), error = %e, "corrupt knowledge file ignored");
                }
            },
            Err(_) => {}
        }
    }

    pub async fn save(&self) {
        if let Some(parent) = self.file_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!(error = %e, "vault dir create failed");
                return;
            }
        }
        match serde_json::to_string_pretty(&self.knowledge) {
            Ok(json) => {
                if let Err(e) = tokio::fs::write(&self.file_path, json).await {
                    tracing::warn!(path = %self.file_path.display(), error = %e, "vault save failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "vault serialize failed"),
        }
    }

    pub fn knowledge(&self) -> &AgentKnowledge {
        &self.knowledge
    }

    pub fn add_insight(&mut self, insight: impl Into<String>) {
        self.knowledge.insights.push(insight.into());
    }

    pub fn record_file_analyzed(&mut self, file_path: &str) {
        if !self.knowledge.files_analyzed.iter().any(|f| f == file_path) {
            self.knowledge.files_analyzed.push(file_path.to_string());
        }
        let dir = match file_path.rsplit_once('/') {
            Some((dir, _)) if !dir.is_empty() => dir.to_string(),
            _ => "/".to_string(),
        };
        *self.knowledge.realm_knowledge.entry(dir).or_insert(0.0) += 1.0;
    }

    pub fn increment_expertise(&mut self, area: &str, amount: f64) {
        *self.knowledge.expertise.entry(area.to_string()).or_insert(0.0) += amount;
    }

    pub fn add_task_history(&mut self, task: impl Into<String>, outcome: impl Into<String>) {
        self.knowledge.task_history.push(TaskRecord {
            task: task.into(),
            outcome: outcome.into(),
            timestamp: Utc::now(),
        });
    }

    /// Top five expertise areas, strongest first.
    pub fn expertise_summary(&self) -> String {
        summarize(&self.knowledge.expertise, "No expertise yet.")
    }

    pub fn realm_summary(&self) -> String {
        summarize(&self.knowledge.realm_knowledge, "No realm knowledge yet.")
    }
}

fn summarize(scores: &HashMap<String, f64>, empty: &str) -> String {
    let mut entries: Vec<_> = scores.iter().collect();
    entries.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));
    entries.truncate(5);
    if entries.is_empty() {
        return empty.to_string();
    }
    entries
        .iter()
        .map(|(area, score)| format!("{area}: {score}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_root() -> PathBuf {
        std::env::temp_dir().join(format!("overworld-vault-test-{}", uuid::Uuid::now_v7()))
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let root = test_root();
        let id = AgentId::from_raw("scout");

        let mut vault = KnowledgeVault::new(&root, &id, "Scout", "Explorer", "src");
        vault.add_insight("the parser lives in src/parse");
        vault.increment_expertise("parsing", 2.0);
        vault.record_file_analyzed("src/parse/lexer.rs");
        vault.add_task_history("map the parser", "done");
        vault.save().await;

        let mut reloaded = KnowledgeVault::new(&root, &id, "Scout", "Explorer", "src");
        reloaded.load().await;
        assert_eq!(reloaded.knowledge().insights.len(), 1);
        assert_eq!(reloaded.knowledge().expertise["parsing"], 2.0);
        assert_eq!(reloaded.knowledge().realm_knowledge["src/parse"], 1.0);
        assert_eq!(reloaded.knowledge().task_history.len(), 1);

        let _ = tokio::fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn load_missing_file_starts_fresh() {
        let root = test_root();
        let mut vault = KnowledgeVault::new(&root, &AgentId::from_raw("ghost"), "G", "r", "/");
        vault.load().await;
        assert!(vault.knowledge().insights.is_empty());
    }

    #[test]
    fn traversal_in_agent_id_cannot_escape_the_vault_dir() {
        let root = PathBuf::from("/repo");
        let id = AgentId::from_raw("../../etc/passwd");
        let vault = KnowledgeVault::new(&root, &id, "X", "r", "/");
        let path = vault.file_path.to_string_lossy().into_owned();
        assert!(path.starts_with("/repo/.overworld/knowledge/"));
        assert!(!path.contains(".."));
    }

    #[test]
    fn expertise_summary_orders_and_caps() {
        let mut vault = KnowledgeVault::new(Path::new("."), &AgentId::from_raw("a"), "A", "r", "/");
        assert_eq!(vault.expertise_summary(), "No expertise yet.");
        for (area, score) in [("a", 1.0), ("b", 5.0), ("c", 3.0), ("d", 2.0), ("e", 4.0), ("f", 6.0)] {
            vault.increment_expertise(area, score);
        }
        let summary = vault.expertise_summary();
        assert!(summary.starts_with("f: 6"));
        assert!(!summary.contains("a: 1"), "sixth entry should be dropped: {summary}");
    }

    #[test]
    fn file_record_is_deduplicated() {
        let mut vault = KnowledgeVault::new(Path::new("."), &AgentId::from_raw("a"), "A", "r", "/");
        vault.record_file_analyzed("src/lib.rs");
        vault.record_file_analyzed("src/lib.rs");
        assert_eq!(vault.knowledge().files_analyzed.len(), 1);
        assert_eq!(vault.knowledge().realm_knowledge["src"], 2.0);
    }
}
