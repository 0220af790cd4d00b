use serde::{Deserialize, Serialize};

use crate::ids::AgentId;

/// Visualization events derived from agent activity.
/// Stateless value objects; the translator produces them and the hub applies
/// them to the world and broadcasts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpgEvent {
    pub agent_id: AgentId,
    #[serde(flatten)]
    pub kind: RpgEventKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpgEventKind {
    Move { x: u32, y: u32 },
    Speak { text: String },
    Think { text: String },
    Emote { emote: String },
    SkillEffect { text: String },
    Activity { text: String },
}

impl RpgEvent {
    pub fn new(agent_id: AgentId, kind: RpgEventKind) -> Self {
        Self { agent_id, kind }
    }

    pub fn event_type(&self) -> &'static str {
        match self.kind {
            RpgEventKind::Move { .. } => "move",
            RpgEventKind::Speak { .. } => "speak",
            RpgEventKind::Think { .. } => "think",
            RpgEventKind::Emote { .. } => "emote",
            RpgEventKind::SkillEffect { .. } => "skill_effect",
            RpgEventKind::Activity { .. } => "activity",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_tags_the_kind() {
        let evt = RpgEvent::new(
            AgentId::from_raw("scout"),
            RpgEventKind::Speak { text: "found it".into() },
        );
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["type"], "speak");
        assert_eq!(json["agent_id"], "scout");
        assert_eq!(json["text"], "found it");

        let parsed: RpgEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, evt);
    }

    #[test]
    fn event_type_strings() {
        let evt = RpgEvent::new(AgentId::from_raw("a"), RpgEventKind::Emote { emote: "exclamation".into() });
        assert_eq!(evt.event_type(), "emote");
        let evt = RpgEvent::new(AgentId::from_raw("a"), RpgEventKind::SkillEffect { text: "x".into() });
        assert_eq!(evt.event_type(), "skill_effect");
    }
}
