//! Turns raw runtime messages into visualization events.
//!
//! Handles two message shapes: real-time stream chunks (block start / delta /
//! stop) and complete assistant turns with content arrays. All buffering is
//! per-agent so interleaved sessions never bleed into each other.

use std::collections::HashMap;

use overworld_core::events::{RpgEvent, RpgEventKind};
use overworld_core::ids::AgentId;
use overworld_core::runtime::{ContentBlock, Delta, RuntimeMessage, StreamChunk};
use overworld_world::map::MapObject;

#[derive(Default)]
pub struct EventTranslator {
    /// Which tool is currently in flight for each agent.
    current_tool: HashMap<AgentId, String>,
    /// Accumulated text deltas, flushed as a single speak on block stop.
    text_buffers: HashMap<AgentId, String>,
    /// Current map objects, for file-path resolution.
    objects: Vec<MapObject>,
}

impl EventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the object set (called whenever the active map changes).
    pub fn set_objects(&mut self, objects: Vec<MapObject>) {
        self.objects = objects;
    }

    /// Main entry point: zero or more events to broadcast for one message.
    pub fn translate(&mut self, agent_id: &AgentId, message: &RuntimeMessage) -> Vec<RpgEvent> {
        match message {
            RuntimeMessage::StreamEvent { event, .. } => self.handle_chunk(agent_id, event),
            RuntimeMessage::Assistant { message, .. } => {
                self.handle_assistant(agent_id, &message.content)
            }
            _ => Vec::new(),
        }
    }

    /// Drop any buffered state for a dismissed agent.
    pub fn forget(&mut self, agent_id: &AgentId) {
        self.current_tool.remove(agent_id);
        self.text_buffers.remove(agent_id);
    }

    /// Find the map object matching a file path: exact basename label match
    /// first, then either path containing the other.
    pub fn find_object_for_file(&self, file_path: &str) -> Option<&MapObject> {
        if file_path.is_empty() {
            return None;
        }
        let base = file_path.rsplit('/').next().unwrap_or(file_path);

        if let Some(obj) = self.objects.iter().find(|o| o.label == base) {
            return Some(obj);
        }
        if let Some(obj) = self
            .objects
            .iter()
            .find(|o| o.full_path().is_some_and(|p| p.contains(file_path)))
        {
            return Some(obj);
        }
        self.objects
            .iter()
            .find(|o| o.full_path().is_some_and(|p| file_path.contains(p)))
    }

    /// Walk the agent's sprite over to the object for the file a tool is
    /// touching, when the tool input names one we can place on the map.
    fn move_event_for_input(
        &self,
        agent_id: &AgentId,
        input: &serde_json::Value,
    ) -> Option<RpgEvent> {
        let path = input
            .get("file_path")
            .or_else(|| input.get("path"))
            .and_then(|v| v.as_str())?;
        let obj = self.find_object_for_file(path)?;
        Some(RpgEvent::new(
            agent_id.clone(),
            RpgEventKind::Move { x: obj.x, y: obj.y },
        ))
    }

    fn handle_chunk(&mut self, agent_id: &AgentId, chunk: &StreamChunk) -> Vec<RpgEvent> {
        match chunk {
            StreamChunk::ContentBlockStart { content_block } => {
                if let ContentBlock::ToolUse { name, input } = content_block {
                    self.current_tool.insert(agent_id.clone(), name.clone());
                    let mut events = Vec::new();
                    events.extend(self.move_event_for_input(agent_id, input));
                    events.extend(events_for_tool(agent_id, name));
                    return events;
                }
                Vec::new()
            }
            StreamChunk::ContentBlockDelta { delta } => {
                if let Delta::TextDelta { text } = delta {
                    self.text_buffers
                        .entry(agent_id.clone())
                        .or_default()
                        .push_str(text);
                }
                Vec::new()
            }
            StreamChunk::ContentBlockStop {} => {
                self.current_tool.remove(agent_id);
                let mut events = Vec::new();
                if let Some(text) = self.text_buffers.remove(agent_id) {
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        events.push(RpgEvent::new(
                            agent_id.clone(),
                            RpgEventKind::Speak { text: trimmed.to_string() },
                        ));
                    }
                }
                events
            }
            StreamChunk::Other => Vec::new(),
        }
    }

    fn handle_assistant(&mut self, agent_id: &AgentId, content: &[ContentBlock]) -> Vec<RpgEvent> {
        let mut events = Vec::new();
        for block in content {
            match block {
                ContentBlock::Text { text } => {
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        events.push(RpgEvent::new(
                            agent_id.clone(),
                            RpgEventKind::Speak { text: trimmed.to_string() },
                        ));
                    }
                }
                ContentBlock::ToolUse { name, input } => {
                    events.extend(self.move_event_for_input(agent_id, input));
                    events.extend(events_for_tool(agent_id, name));
                }
                ContentBlock::Other => {}
            }
        }
        events
    }
}

fn events_for_tool(agent_id: &AgentId, tool_name: &str) -> Vec<RpgEvent> {
    let id = agent_id.clone();
    match tool_name {
        "Read" => vec![RpgEvent::new(id, RpgEventKind::Think { text: "Reading file...".into() })],
        "Edit" | "Write" => vec![RpgEvent::new(
            id,
            RpgEventKind::SkillEffect { text: "Writing code...".into() },
        )],
        "Bash" => vec![
            RpgEvent::new(id.clone(), RpgEventKind::Emote { emote: "exclamation".into() }),
            RpgEvent::new(id, RpgEventKind::Activity { text: "Running command...".into() }),
        ],
        "Grep" | "Glob" => vec![RpgEvent::new(
            id,
            RpgEventKind::Think { text: "Searching codebase...".into() },
        )],
        "SummonAgent" => vec![RpgEvent::new(
            id,
            RpgEventKind::Speak { text: "I need to summon a specialist...".into() },
        )],
        "RequestHelp" => vec![RpgEvent::new(
            id,
            RpgEventKind::Speak { text: "Requesting help from a teammate...".into() },
        )],
        "PostFindings" => vec![RpgEvent::new(
            id,
            RpgEventKind::Speak { text: "Sharing findings with the team...".into() },
        )],
        other => vec![RpgEvent::new(
            id,
            RpgEventKind::Activity { text: format!("Using {other}...") },
        )],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overworld_core::runtime::AssistantPayload;
    use overworld_world::map::ObjectKind;

    fn agent(id: &str) -> AgentId {
        AgentId::from_raw(id)
    }

    fn delta(agent: &AgentId, text: &str) -> RuntimeMessage {
        RuntimeMessage::StreamEvent {
            session_id: None,
            event: StreamChunk::ContentBlockDelta {
                delta: Delta::TextDelta { text: text.into() },
            },
        }
    }

    fn stop() -> RuntimeMessage {
        RuntimeMessage::StreamEvent {
            session_id: None,
            event: StreamChunk::ContentBlockStop {},
        }
    }

    fn tool_start(name: &str) -> RuntimeMessage {
        RuntimeMessage::StreamEvent {
            session_id: None,
            event: StreamChunk::ContentBlockStart {
                content_block: ContentBlock::ToolUse {
                    name: name.into(),
                    input: serde_json::Value::Null,
                },
            },
        }
    }

    fn object(label: &str, full_path: &str) -> MapObject {
        let mut metadata = serde_json::Map::new();
        metadata.insert("full_path".into(), serde_json::Value::String(full_path.into()));
        MapObject {
            id: format!("obj_{label}"),
            kind: ObjectKind::File,
            x: 1,
            y: 1,
            label: label.into(),
            metadata,
        }
    }

    #[test]
    fn deltas_buffer_until_stop_then_one_speak() {
        let mut translator = EventTranslator::new();
        let a = agent("a");

        assert!(translator.translate(&a, &delta(&a, "Hello ")).is_empty());
        assert!(translator.translate(&a, &delta(&a, "World")).is_empty());

        let events = translator.translate(&a, &stop());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, RpgEventKind::Speak { text: "Hello World".into() });

        // Buffer was consumed.
        assert!(translator.translate(&a, &stop()).is_empty());
    }

    #[test]
    fn whitespace_only_buffer_is_dropped() {
        let mut translator = EventTranslator::new();
        let a = agent("a");
        translator.translate(&a, &delta(&a, "  \n "));
        assert!(translator.translate(&a, &stop()).is_empty());
    }

    #[test]
    fn buffers_are_isolated_per_agent() {
        let mut translator = EventTranslator::new();
        let a = agent("a");
        let b = agent("b");

        translator.translate(&a, &delta(&a, "from a"));
        translator.translate(&b, &delta(&b, "from b"));

        let a_events = translator.translate(&a, &stop());
        assert_eq!(a_events[0].kind, RpgEventKind::Speak { text: "from a".into() });
        let b_events = translator.translate(&b, &stop());
        assert_eq!(b_events[0].kind, RpgEventKind::Speak { text: "from b".into() });
    }

    #[test]
    fn tool_table_mapping() {
        let mut translator = EventTranslator::new();
        let a = agent("a");

        let read = translator.translate(&a, &tool_start("Read"));
        assert!(matches!(read[0].kind, RpgEventKind::Think { .. }));

        let write = translator.translate(&a, &tool_start("Write"));
        assert!(matches!(write[0].kind, RpgEventKind::SkillEffect { .. }));

        let bash = translator.translate(&a, &tool_start("Bash"));
        assert_eq!(bash.len(), 2);
        assert!(matches!(bash[0].kind, RpgEventKind::Emote { .. }));
        assert!(matches!(bash[1].kind, RpgEventKind::Activity { .. }));

        let unknown = translator.translate(&a, &tool_start("WebFetch"));
        assert_eq!(unknown[0].kind, RpgEventKind::Activity { text: "Using WebFetch...".into() });
    }

    #[test]
    fn assistant_turn_emits_per_block() {
        let mut translator = EventTranslator::new();
        let a = agent("a");
        let msg = RuntimeMessage::Assistant {
            session_id: None,
            message: AssistantPayload {
                content: vec![
                    ContentBlock::Text { text: "  found it  ".into() },
                    ContentBlock::Text { text: "   ".into() },
                    ContentBlock::ToolUse { name: "Grep".into(), input: serde_json::Value::Null },
                ],
            },
        };
        let events = translator.translate(&a, &msg);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, RpgEventKind::Speak { text: "found it".into() });
        assert!(matches!(events[1].kind, RpgEventKind::Think { .. }));
    }

    #[test]
    fn non_translatable_messages_yield_nothing() {
        let mut translator = EventTranslator::new();
        let a = agent("a");
        let msg = RuntimeMessage::Result { session_id: None, is_error: false, result: None };
        assert!(translator.translate(&a, &msg).is_empty());
    }

    #[test]
    fn tool_use_on_known_file_walks_to_its_object() {
        let mut translator = EventTranslator::new();
        let mut obj = object("lexer.rs", "src/parse/lexer.rs");
        obj.x = 7;
        obj.y = 3;
        translator.set_objects(vec![obj]);
        let a = agent("a");

        let msg = RuntimeMessage::StreamEvent {
            session_id: None,
            event: StreamChunk::ContentBlockStart {
                content_block: ContentBlock::ToolUse {
                    name: "Read".into(),
                    input: serde_json::json!({ "file_path": "src/parse/lexer.rs" }),
                },
            },
        };
        let events = translator.translate(&a, &msg);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, RpgEventKind::Move { x: 7, y: 3 });
        assert!(matches!(events[1].kind, RpgEventKind::Think { .. }));

        // Unknown file: no move, just the tool event.
        let events = translator.translate(&a, &tool_start("Read"));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn object_lookup_fallback_chain() {
        let mut translator = EventTranslator::new();
        translator.set_objects(vec![
            object("lexer.rs", "src/parse/lexer.rs"),
            object("parser module", "src/parse/mod.rs"),
        ]);

        // 1. Basename label match.
        let hit = translator.find_object_for_file("deep/dir/lexer.rs").unwrap();
        assert_eq!(hit.label, "lexer.rs");

        // 2. Stored path contains the query.
        let hit = translator.find_object_for_file("parse/mod.rs").unwrap();
        assert_eq!(hit.label, "parser module");

        // 3. Query contains the stored path.
        let hit = translator.find_object_for_file("/abs/repo/src/parse/mod.rs").unwrap();
        assert_eq!(hit.label, "parser module");

        assert!(translator.find_object_for_file("nothing/here.txt").is_none());
        assert!(translator.find_object_for_file("").is_none());
    }
}
