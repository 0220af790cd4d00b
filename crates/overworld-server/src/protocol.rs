//! The WebSocket wire protocol.
//!
//! Every frame is a JSON object with a `type` field. Inbound kinds a server
//! build does not know answer with an `error` naming the kind; the connection
//! stays open either way.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use overworld_core::ids::{AgentId, SpectatorId};
use overworld_session::PermissionTier;
use overworld_world::{AgentInfo, MapObject, Position, Quest, TileMap, WorldSnapshot};

use crate::realms::RealmEntry;

#[derive(Clone, Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid JSON")]
    InvalidJson,
    #[error("Unknown message type: {0}")]
    UnknownKind(String),
    #[error("Malformed {kind} message: {detail}")]
    Malformed { kind: String, detail: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GamePhase {
    Onboarding,
    Analyzing,
    Playing,
}

/// Permission level as spoken on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionLevel {
    #[default]
    ReadOnly,
    WriteWithApproval,
    Full,
}

impl PermissionLevel {
    pub fn tier(&self) -> PermissionTier {
        match self {
            Self::ReadOnly => PermissionTier::ReadOnly,
            Self::WriteWithApproval => PermissionTier::WriteWithApproval,
            Self::Full => PermissionTier::Full,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub max_agents: usize,
    pub permission_level: PermissionLevel,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self { max_agents: 5, permission_level: PermissionLevel::ReadOnly }
    }
}

/// Partial settings update; absent fields keep their current value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsPatch {
    #[serde(default)]
    pub max_agents: Option<usize>,
    #[serde(default)]
    pub permission_level: Option<PermissionLevel>,
}

impl SessionSettings {
    pub fn merge(&mut self, patch: &SettingsPatch) {
        if let Some(max_agents) = patch.max_agents {
            self.max_agents = max_agents;
        }
        if let Some(level) = patch.permission_level {
            self.permission_level = level;
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpectatorInfo {
    pub spectator_id: SpectatorId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
}

/// Where an agent sits in the folder hierarchy, for the presence overlay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub id: String,
    pub name: String,
    pub path: String,
    pub depth: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoStats {
    pub total_files: usize,
    #[serde(default)]
    pub languages: Vec<String>,
}

/// Client → server frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "agent:register")]
    AgentRegister {
        agent_id: String,
        name: String,
        #[serde(default)]
        color: Option<u32>,
    },
    #[serde(rename = "player:link-repo")]
    LinkRepo { repo_url: String },
    #[serde(rename = "player:start-process")]
    StartProcess {
        problem: String,
        #[serde(default)]
        process_id: Option<String>,
    },
    #[serde(rename = "player:command")]
    PlayerCommand { text: String },
    #[serde(rename = "player:update-settings")]
    UpdateSettings { settings: SettingsPatch },
    #[serde(rename = "player:dismiss-agent")]
    DismissAgent { agent_id: String },
    #[serde(rename = "player:list-realms")]
    ListRealms,
    #[serde(rename = "player:resume-realm")]
    ResumeRealm { realm_id: String },
    #[serde(rename = "player:remove-realm")]
    RemoveRealm { realm_id: String },
    #[serde(rename = "player:navigate-enter")]
    NavigateEnter { target_path: String },
    #[serde(rename = "player:navigate-back")]
    NavigateBack,
    #[serde(rename = "spectator:register")]
    SpectatorRegister {
        name: String,
        #[serde(default)]
        color: Option<u32>,
    },
    #[serde(rename = "spectator:command")]
    SpectatorCommand { name: String, text: String },
}

const KNOWN_KINDS: &[&str] = &[
    "agent:register",
    "player:link-repo",
    "player:start-process",
    "player:command",
    "player:update-settings",
    "player:dismiss-agent",
    "player:list-realms",
    "player:resume-realm",
    "player:remove-realm",
    "player:navigate-enter",
    "player:navigate-back",
    "spectator:register",
    "spectator:command",
];

impl ClientMessage {
    /// Parse one raw frame, distinguishing garbage, unknown kinds, and
    /// known kinds with a bad payload.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw).map_err(|_| ProtocolError::InvalidJson)?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(ProtocolError::InvalidJson)?
            .to_string();
        if !KNOWN_KINDS.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownKind(kind));
        }
        serde_json::from_value(value)
            .map_err(|e| ProtocolError::Malformed { kind, detail: e.to_string() })
    }
}

/// Server → client frames.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "server:info")]
    ServerInfo {
        port: u16,
        game_phase: GamePhase,
        active_realm_id: Option<String>,
    },
    #[serde(rename = "world:state")]
    WorldState {
        #[serde(flatten)]
        snapshot: WorldSnapshot,
        spectators: Vec<SpectatorInfo>,
    },
    #[serde(rename = "repo:ready")]
    RepoReady {
        repo_name: String,
        map: TileMap,
        quests: Vec<Quest>,
        objects: Vec<MapObject>,
        stats: RepoStats,
    },
    #[serde(rename = "agent:joined")]
    AgentJoined { agent: AgentInfo },
    #[serde(rename = "agent:left")]
    AgentLeft { agent_id: AgentId },
    #[serde(rename = "action:result")]
    ActionResult {
        agent_id: AgentId,
        action: String,
        params: Value,
        success: bool,
    },
    #[serde(rename = "agent:thought")]
    AgentThought { agent_id: AgentId, text: String },
    #[serde(rename = "agent:activity")]
    AgentActivity { agent_id: AgentId, activity: String },
    #[serde(rename = "findings:posted")]
    FindingsPosted {
        agent_id: AgentId,
        agent_name: String,
        realm: String,
        finding: String,
        severity: String,
    },
    #[serde(rename = "realm:list")]
    RealmList { realms: Vec<RealmEntry> },
    #[serde(rename = "realm:removed")]
    RealmRemoved { realm_id: String },
    #[serde(rename = "realm:presence")]
    RealmPresence { players: Vec<PresenceEntry> },
    #[serde(rename = "map:change")]
    MapChange {
        path: String,
        map: TileMap,
        objects: Vec<MapObject>,
        position: Position,
        breadcrumb: Position,
    },
    #[serde(rename = "process:started")]
    ProcessStarted {
        process_id: String,
        process_name: String,
        problem: String,
        current_stage_id: String,
        current_stage_name: String,
        total_stages: usize,
    },
    #[serde(rename = "stage:started")]
    StageStarted {
        stage_id: String,
        stage_name: String,
        stage_index: usize,
        total_stages: usize,
    },
    #[serde(rename = "stage:advanced")]
    StageAdvanced {
        from_stage_id: String,
        from_stage_name: String,
        to_stage_id: Option<String>,
        to_stage_name: Option<String>,
        stage_index: usize,
        total_stages: usize,
    },
    #[serde(rename = "process:completed")]
    ProcessCompleted { process_id: String, problem: String },
    #[serde(rename = "spectator:welcome")]
    SpectatorWelcome { spectator_id: SpectatorId, name: String },
    #[serde(rename = "spectator:joined")]
    SpectatorJoined {
        spectator_id: SpectatorId,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color: Option<u32>,
    },
    #[serde(rename = "spectator:left")]
    SpectatorLeft { spectator_id: SpectatorId },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error { message: message.into() }
    }

    /// Wire encoding; a message that fails to serialize becomes an error
    /// frame instead of killing the connection.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to serialize server message");
            r#"{"type":"error","message":"Internal server error"}"#.to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_link_repo() {
        let msg = ClientMessage::parse(r#"{"type":"player:link-repo","repo_url":"/tmp/repo"}"#)
            .unwrap();
        assert_eq!(msg, ClientMessage::LinkRepo { repo_url: "/tmp/repo".into() });
    }

    #[test]
    fn parses_start_process_with_optional_template() {
        let msg = ClientMessage::parse(r#"{"type":"player:start-process","problem":"cut latency"}"#)
            .unwrap();
        assert_eq!(
            msg,
            ClientMessage::StartProcess { problem: "cut latency".into(), process_id: None }
        );
    }

    #[test]
    fn unknown_kind_is_named_in_the_error() {
        let err = ClientMessage::parse(r#"{"type":"player:fly","x":1}"#).unwrap_err();
        match err {
            ProtocolError::UnknownKind(kind) => assert_eq!(kind, "player:fly"),
            other => panic!("expected UnknownKind, got {other:?}"),
        }
    }

    #[test]
    fn malformed_payload_names_the_kind() {
        let err = ClientMessage::parse(r#"{"type":"player:resume-realm"}"#).unwrap_err();
        match err {
            ProtocolError::Malformed { kind, .. } => assert_eq!(kind, "player:resume-realm"),
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn garbage_is_invalid_json() {
        assert!(matches!(
            ClientMessage::parse("not json at all"),
            Err(ProtocolError::InvalidJson)
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"no_type":true}"#),
            Err(ProtocolError::InvalidJson)
        ));
    }

    #[test]
    fn server_message_tags_with_colon_kinds() {
        let msg = ServerMessage::AgentLeft { agent_id: AgentId::from_raw("scout") };
        let json: Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(json["type"], "agent:left");
        assert_eq!(json["agent_id"], "scout");
    }

    #[test]
    fn world_state_flattens_the_snapshot() {
        let mut world = overworld_world::WorldState::new();
        let msg = ServerMessage::WorldState { snapshot: world.snapshot(), spectators: vec![] };
        let json: Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(json["type"], "world:state");
        assert_eq!(json["tick"], 1);
        assert!(json["map"]["tiles"].is_array());
        assert!(json["spectators"].as_array().unwrap().is_empty());
    }

    #[test]
    fn settings_merge_keeps_absent_fields() {
        let mut settings = SessionSettings::default();
        settings.merge(&SettingsPatch { max_agents: Some(8), permission_level: None });
        assert_eq!(settings.max_agents, 8);
        assert_eq!(settings.permission_level, PermissionLevel::ReadOnly);

        let patch: SettingsPatch =
            serde_json::from_str(r#"{"permission_level":"write-with-approval"}"#).unwrap();
        settings.merge(&patch);
        assert_eq!(settings.permission_level, PermissionLevel::WriteWithApproval);
        assert_eq!(settings.max_agents, 8);
    }

    #[test]
    fn permission_levels_map_to_tiers() {
        assert_eq!(PermissionLevel::ReadOnly.tier(), PermissionTier::ReadOnly);
        assert_eq!(PermissionLevel::Full.tier(), PermissionTier::Full);
    }
}
