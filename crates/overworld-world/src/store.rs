//! The authoritative world snapshot.
//!
//! Single-writer: the hub mutates this behind a lock and broadcasts snapshots.
//! Everything here is synchronous and panic-free; operations on state that
//! does not exist (an unknown agent, no active process) are silent no-ops.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use overworld_core::ids::AgentId;
use overworld_core::process::ProcessState;

use crate::map::{default_map, MapNode, MapObject, Position, TileMap};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Starting,
    Running,
    Idle,
    Stopped,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    /// directory -> familiarity score
    #[serde(default)]
    pub realm_knowledge: HashMap<String, f64>,
    /// skill area -> level
    #[serde(default)]
    pub expertise: HashMap<String, f64>,
    #[serde(default)]
    pub codebase_fluency: f64,
    #[serde(default)]
    pub collaboration_score: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: AgentId,
    pub name: String,
    pub color: u32,
    pub x: u32,
    pub y: u32,
    pub role: String,
    /// Directory scope this agent patrols, e.g. "src/api".
    pub realm: String,
    pub stats: AgentStats,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_activity: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Quest {
    pub quest_id: String,
    pub title: String,
    pub body: String,
    pub status: String,
}

/// One level of an agent's (or the player's) descent into the map tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NavigationFrame {
    pub path: String,
    pub return_position: Position,
}

/// Navigation stacks, persisted with the world so a resumed realm puts
/// everyone back where they were.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NavigationState {
    #[serde(default)]
    pub stacks: HashMap<String, Vec<NavigationFrame>>,
    #[serde(default)]
    pub current_paths: HashMap<String, String>,
}

/// Immutable view handed to clients on every `world:state` broadcast.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub tick: u64,
    pub agents: Vec<AgentInfo>,
    pub map: TileMap,
    pub objects: Vec<MapObject>,
    pub quests: Vec<Quest>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorldState {
    agents: HashMap<AgentId, AgentInfo>,
    map: TileMap,
    objects: Vec<MapObject>,
    quests: Vec<Quest>,
    tick: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    map_tree: Option<MapNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    process: Option<ProcessState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    navigation: Option<NavigationState>,
}

impl Default for WorldState {
    fn default() -> Self {
        Self::new()
    }
}

impl WorldState {
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
            map: default_map(),
            objects: Vec::new(),
            quests: Vec::new(),
            tick: 0,
            map_tree: None,
            process: None,
            navigation: None,
        }
    }

    // ── Map / objects / quests ──

    pub fn set_map(&mut self, map: TileMap) {
        self.map = map;
    }

    pub fn map(&self) -> &TileMap {
        &self.map
    }

    pub fn set_objects(&mut self, objects: Vec<MapObject>) {
        self.objects = objects;
    }

    pub fn objects(&self) -> &[MapObject] {
        &self.objects
    }

    pub fn set_quests(&mut self, quests: Vec<Quest>) {
        self.quests = quests;
    }

    pub fn set_map_tree(&mut self, root: MapNode) {
        self.map_tree = Some(root);
    }

    pub fn map_tree(&self) -> Option<&MapNode> {
        self.map_tree.as_ref()
    }

    pub fn map_tree_mut(&mut self) -> Option<&mut MapNode> {
        self.map_tree.as_mut()
    }

    /// Resolve a slash path in the map tree; empty path is the root.
    pub fn map_node(&self, path: &str) -> Option<&MapNode> {
        self.map_tree.as_ref()?.resolve(path)
    }

    // ── Agents ──

    pub fn add_agent(
        &mut self,
        agent_id: AgentId,
        name: impl Into<String>,
        color: u32,
        role: impl Into<String>,
        realm: impl Into<String>,
        spawn_at: Option<Position>,
    ) -> AgentInfo {
        let pos = spawn_at.unwrap_or_else(|| self.find_spawn_position());
        let agent = AgentInfo {
            agent_id: agent_id.clone(),
            name: name.into(),
            color,
            x: pos.x,
            y: pos.y,
            role: role.into(),
            realm: realm.into(),
            stats: AgentStats::default(),
            status: AgentStatus::Starting,
            current_activity: None,
        };
        self.agents.insert(agent_id, agent.clone());
        agent
    }

    pub fn remove_agent(&mut self, agent_id: &AgentId) {
        self.agents.remove(agent_id);
    }

    pub fn agent(&self, agent_id: &AgentId) -> Option<&AgentInfo> {
        self.agents.get(agent_id)
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentInfo> {
        self.agents.values()
    }

    pub fn update_status(&mut self, agent_id: &AgentId, status: AgentStatus) {
        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.status = status;
        }
    }

    pub fn update_activity(&mut self, agent_id: &AgentId, activity: impl Into<String>) {
        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.current_activity = Some(activity.into());
        }
    }

    pub fn update_stats(&mut self, agent_id: &AgentId, delta: &AgentStats) {
        let Some(agent) = self.agents.get_mut(agent_id) else {
            return;
        };
        for (k, v) in &delta.realm_knowledge {
            agent.stats.realm_knowledge.insert(k.clone(), *v);
        }
        for (k, v) in &delta.expertise {
            agent.stats.expertise.insert(k.clone(), *v);
        }
        if delta.codebase_fluency != 0.0 {
            agent.stats.codebase_fluency = delta.codebase_fluency;
        }
        if delta.collaboration_score != 0.0 {
            agent.stats.collaboration_score = delta.collaboration_score;
        }
    }

    pub fn apply_move(&mut self, agent_id: &AgentId, x: u32, y: u32) -> bool {
        let Some(agent) = self.agents.get_mut(agent_id) else {
            return false;
        };
        agent.x = x;
        agent.y = y;
        true
    }

    pub fn is_walkable(&self, x: u32, y: u32) -> bool {
        self.map.is_walkable(x, y)
    }

    pub fn is_occupied(&self, x: u32, y: u32) -> bool {
        self.agents.values().any(|a| a.x == x && a.y == y)
    }

    /// Random walkable, unoccupied tile: up to 100 probes in the map interior,
    /// then a row-major scan, then (1,1) as the last resort.
    pub fn find_spawn_position(&self) -> Position {
        let w = self.map.width;
        let h = self.map.height;
        if w > 4 && h > 4 {
            let mut rng = rand::thread_rng();
            for _ in 0..100 {
                let x = rng.gen_range(2..w - 2);
                let y = rng.gen_range(2..h - 2);
                if self.is_walkable(x, y) && !self.is_occupied(x, y) {
                    return Position { x, y };
                }
            }
        }
        for y in 1..h.saturating_sub(1) {
            for x in 1..w.saturating_sub(1) {
                if self.is_walkable(x, y) && !self.is_occupied(x, y) {
                    return Position { x, y };
                }
            }
        }
        Position { x: 1, y: 1 }
    }

    // ── Process state ──

    pub fn set_process(&mut self, state: ProcessState) {
        self.process = Some(state);
    }

    pub fn process(&self) -> Option<&ProcessState> {
        self.process.as_ref()
    }

    pub fn process_mut(&mut self) -> Option<&mut ProcessState> {
        self.process.as_mut()
    }

    pub fn clear_process(&mut self) {
        self.process = None;
    }

    /// Record the finished stage's artifacts and bump the stage index.
    /// No-op when no process is active.
    pub fn advance_stage(&mut self, completed_stage_id: &str, artifacts: &HashMap<String, String>) {
        let Some(process) = self.process.as_mut() else {
            return;
        };
        for (artifact_id, content) in artifacts {
            process.set_artifact(completed_stage_id, artifact_id, content.clone());
        }
        process.advance_stage();
    }

    /// Mark the process completed with the final stage's artifacts.
    /// No-op when no process is active.
    pub fn complete_process(&mut self, final_stage_id: &str, artifacts: &HashMap<String, String>) {
        let Some(process) = self.process.as_mut() else {
            return;
        };
        for (artifact_id, content) in artifacts {
            process.set_artifact(final_stage_id, artifact_id, content.clone());
        }
        process.complete();
    }

    /// Store a single artifact produced mid-stage. No-op when no process is
    /// active.
    pub fn set_artifact(&mut self, stage_id: &str, artifact_id: &str, content: String) {
        if let Some(process) = self.process.as_mut() {
            process.set_artifact(stage_id, artifact_id, content);
        }
    }

    // ── Navigation ──

    pub fn set_navigation(&mut self, nav: NavigationState) {
        self.navigation = Some(nav);
    }

    pub fn navigation(&self) -> Option<&NavigationState> {
        self.navigation.as_ref()
    }

    // ── Snapshots ──

    /// Tick advances on every snapshot so clients can discard stale frames.
    pub fn snapshot(&mut self) -> WorldSnapshot {
        self.tick += 1;
        WorldSnapshot {
            tick: self.tick,
            agents: self.agents.values().cloned().collect(),
            map: self.map.clone(),
            objects: self.objects.clone(),
            quests: self.quests.clone(),
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
