//! Realm bookkeeping: which repositories have been explored, and the saved
//! world for each.
//!
//! The registry is a single JSON file under the data directory; world
//! snapshots live one file per realm. Everything here is best-effort — a
//! missing or corrupt file degrades to an empty registry or a fresh world,
//! never an error that reaches a client.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use overworld_core::paths::sanitize_component;
use overworld_world::WorldState;

/// Stable id for a repository path: first 12 hex chars of its sha256.
pub fn realm_id_for_path(path: &str) -> String {
    let digest = Sha256::digest(path.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..12].to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RealmStats {
    pub total_files: usize,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub agents_used: usize,
    #[serde(default)]
    pub findings_count: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RealmEntry {
    pub id: String,
    pub path: String,
    pub name: String,
    pub last_explored: DateTime<Utc>,
    #[serde(default)]
    pub stats: RealmStats,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    realms: Vec<RealmEntry>,
    #[serde(default)]
    last_active_realm_id: Option<String>,
}

/// All known realms, persisted at `<data-dir>/realms.json`.
pub struct RealmRegistry {
    file_path: PathBuf,
    realms: Vec<RealmEntry>,
    last_active: Option<String>,
}

impl RealmRegistry {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            file_path: data_dir.join("realms.json"),
            realms: Vec::new(),
            last_active: None,
        }
    }

    pub async fn load(&mut self) {
        match tokio::fs::read_to_string(&self.file_path).await {
            Ok(raw) => match serde_json::from_str::<RegistryFile>(&raw) {
                Ok(file) => {
                    self.realms = file.realms;
                    self.last_active = file.last_active_realm_id;
                }
                Err(e) => {
                    tracing::warn!(path = %self.file_path.display(), error = %e, "corrupt realm registry, starting empty");
                }
            },
            Err(_) => {} // first run
        }
    }

    pub async fn save(&self) {
        let file = RegistryFile {
            realms: self.realms.clone(),
            last_active_realm_id: self.last_active.clone(),
        };
        let json = match serde_json::to_string_pretty(&file) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize realm registry");
                return;
            }
        };
        if let Some(parent) = self.file_path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(e) = tokio::fs::write(&self.file_path, json).await {
            tracing::warn!(path = %self.file_path.display(), error = %e, "failed to save realm registry");
        }
    }

    /// All realms, most recently explored first.
    pub fn list(&self) -> Vec<RealmEntry> {
        let mut realms = self.realms.clone();
        realms.sort_by(|a, b| b.last_explored.cmp(&a.last_explored));
        realms
    }

    pub fn get(&self, id: &str) -> Option<&RealmEntry> {
        self.realms.iter().find(|r| r.id == id)
    }

    pub fn upsert(&mut self, entry: RealmEntry) {
        match self.realms.iter_mut().find(|r| r.id == entry.id) {
            Some(existing) => *existing = entry,
            None => self.realms.push(entry),
        }
    }

    pub fn remove(&mut self, id: &str) {
        self.realms.retain(|r| r.id != id);
    }

    pub fn last_active(&self) -> Option<&str> {
        self.last_active.as_deref()
    }

    pub fn set_last_active(&mut self, id: Option<String>) {
        self.last_active = id;
    }
}

/// Saved world states, one per realm, under `<data-dir>/worlds/`.
pub struct SnapshotStore {
    base: PathBuf,
}

impl SnapshotStore {
    pub fn new(data_dir: &Path) -> Self {
        Self { base: data_dir.join("worlds") }
    }

    fn state_path(&self, realm_id: &str) -> PathBuf {
        self.base.join(sanitize_component(realm_id)).join("state.json")
    }

    pub async fn save(&self, realm_id: &str, world: &WorldState) -> Result<(), std::io::Error> {
        let path = self.state_path(realm_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = world
            .to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(&path, json).await
    }

    /// None when the realm has no snapshot or the snapshot fails to parse.
    pub async fn load(&self, realm_id: &str) -> Option<WorldState> {
        let path = self.state_path(realm_id);
        let raw = tokio::fs::read_to_string(&path).await.ok()?;
        match WorldState::from_json(&raw) {
            Ok(world) => Some(world),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt world snapshot");
                None
            }
        }
    }

    pub async fn remove(&self, realm_id: &str) {
        let dir = self.base.join(sanitize_component(realm_id));
        let _ = tokio::fs::remove_dir_all(dir).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("overworld-realms-test-{}", uuid::Uuid::now_v7()))
    }

    fn entry(id: &str, minutes_ago: i64) -> RealmEntry {
        RealmEntry {
            id: id.into(),
            path: format!("/repos/{id}"),
            name: id.into(),
            last_explored: Utc::now() - chrono::Duration::minutes(minutes_ago),
            stats: RealmStats::default(),
        }
    }

    #[test]
    fn realm_ids_are_stable_short_hex() {
        let a = realm_id_for_path("/home/dev/projects/widget");
        let b = realm_id_for_path("/home/dev/projects/widget");
        let c = realm_id_for_path("/home/dev/projects/other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn registry_roundtrips_through_disk() {
        let dir = temp_dir();
        let mut registry = RealmRegistry::new(&dir);
        registry.upsert(entry("aaa", 10));
        registry.upsert(entry("bbb", 1));
        registry.set_last_active(Some("bbb".into()));
        registry.save().await;

        let mut reloaded = RealmRegistry::new(&dir);
        reloaded.load().await;
        assert_eq!(reloaded.list().len(), 2);
        // Most recent first.
        assert_eq!(reloaded.list()[0].id, "bbb");
        assert_eq!(reloaded.last_active(), Some("bbb"));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn load_tolerates_missing_and_corrupt_files() {
        let dir = temp_dir();
        let mut registry = RealmRegistry::new(&dir);
        registry.load().await;
        assert!(registry.list().is_empty());

        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("realms.json"), "{ not json").await.unwrap();
        registry.load().await;
        assert!(registry.list().is_empty());

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[test]
    fn upsert_replaces_existing_entry() {
        let mut registry = RealmRegistry::new(Path::new("/nonexistent"));
        registry.upsert(entry("aaa", 10));
        let mut updated = entry("aaa", 0);
        updated.stats.findings_count = 7;
        registry.upsert(updated);

        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.get("aaa").unwrap().stats.findings_count, 7);

        registry.remove("aaa");
        assert!(registry.get("aaa").is_none());
    }

    #[tokio::test]
    async fn snapshots_roundtrip_and_remove() {
        let dir = temp_dir();
        let store = SnapshotStore::new(&dir);

        let mut world = WorldState::new();
        world.add_agent(
            overworld_core::ids::AgentId::from_raw("oracle"),
            "The Oracle",
            0x6a8aff,
            "Oracle",
            "/",
            None,
        );
        store.save("abc123", &world).await.unwrap();

        let loaded = store.load("abc123").await.unwrap();
        assert!(loaded.agent(&overworld_core::ids::AgentId::from_raw("oracle")).is_some());

        store.remove("abc123").await;
        assert!(store.load("abc123").await.is_none());

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn snapshot_paths_resist_traversal() {
        let dir = temp_dir();
        let store = SnapshotStore::new(&dir);
        let path = store.state_path("../../etc/passwd");
        assert!(path.starts_with(dir.join("worlds")));
        assert!(!path.to_string_lossy().contains(".."));
    }
}
