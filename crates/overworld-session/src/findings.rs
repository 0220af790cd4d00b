//! Shared discovery board: append-only findings visible to every agent.
//!
//! Persisted as a single JSON file under `<root>/.overworld/findings.json`,
//! best-effort like the vault.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use overworld_core::ids::{AgentId, FindingId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Finding {
    pub id: FindingId,
    pub agent_id: AgentId,
    pub agent_name: String,
    pub realm: String,
    pub finding: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

pub struct FindingsBoard {
    findings: Vec<Finding>,
    file_path: PathBuf,
}

impl FindingsBoard {
    pub fn new(root: &Path) -> Self {
        Self {
            findings: Vec::new(),
            file_path: root.join(".overworld").join("findings.json"),
        }
    }

    pub async fn load(&mut self) {
        if let Ok(data) = tokio::fs::read_to_string(&self.file_path).await {
            match serde_json::from_str(&data) {
                Ok(findings) => self.findings = findings,
                Err(e) => {
                    tracing::warn!(path = %self.file_path.display(), error = %e, "corrupt findings file ignored");
                }
            }
        }
    }

    pub async fn save(&self) {
        if let Some(parent) = self.file_path.parent() {
            if tokio::fs::create_dir_all(parent).await.is_err() {
                return;
            }
        }
        if let Ok(json) = serde_json::to_string_pretty(&self.findings) {
            if let Err(e) = tokio::fs::write(&self.file_path, json).await {
                tracing::warn!(error = %e, "findings save failed");
            }
        }
    }

    pub fn add(
        &mut self,
        agent_id: AgentId,
        agent_name: impl Into<String>,
        realm: impl Into<String>,
        finding: impl Into<String>,
        severity: Severity,
    ) -> Finding {
        let entry = Finding {
            id: FindingId::new(),
            agent_id,
            agent_name: agent_name.into(),
            realm: realm.into(),
            finding: finding.into(),
            severity,
            timestamp: Utc::now(),
        };
        self.findings.push(entry.clone());
        entry
    }

    pub fn all(&self) -> &[Finding] {
        &self.findings
    }

    /// The most recent `limit` findings, oldest first.
    pub fn recent(&self, limit: usize) -> &[Finding] {
        let start = self.findings.len().saturating_sub(limit);
        &self.findings[start..]
    }

    pub fn summary(&self) -> String {
        let recent = self.recent(10);
        if recent.is_empty() {
            return "No findings yet.".to_string();
        }
        recent
            .iter()
            .map(|f| format!("- [{}] {}", f.agent_name, f.finding))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
