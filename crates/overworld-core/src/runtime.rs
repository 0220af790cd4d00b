use serde::{Deserialize, Serialize};

/// One line of the agent runtime's stream-json output.
///
/// The runtime is an external process; we only model the shapes the hub acts
/// on and fold everything else into `Other` so a newer runtime never breaks
/// parsing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeMessage {
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
    },

    StreamEvent {
        #[serde(default)]
        session_id: Option<String>,
        event: StreamChunk,
    },

    /// A complete assistant turn with its content blocks.
    Assistant {
        #[serde(default)]
        session_id: Option<String>,
        message: AssistantPayload,
    },

    /// Terminal message for a run.
    Result {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<String>,
    },

    #[serde(other)]
    Other,
}

impl RuntimeMessage {
    /// The resume token (runtime session id) carried by this message, if any.
    pub fn resume_token(&self) -> Option<&str> {
        match self {
            Self::System { session_id, .. }
            | Self::StreamEvent { session_id, .. }
            | Self::Assistant { session_id, .. }
            | Self::Result { session_id, .. } => session_id.as_deref(),
            Self::Other => None,
        }
    }

    /// True for the `system/init` handshake that carries the first token.
    pub fn is_init(&self) -> bool {
        matches!(self, Self::System { subtype, .. } if subtype == "init")
    }

    pub fn is_result(&self) -> bool {
        matches!(self, Self::Result { .. })
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AssistantPayload {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

/// Streaming chunk inside a `stream_event` message.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    ContentBlockStart {
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        delta: Delta,
    },
    ContentBlockStop {},
    #[serde(other)]
    Other,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_init_handshake() {
        let line = r#"{"type":"system","subtype":"init","session_id":"sess-abc"}"#;
        let msg: RuntimeMessage = serde_json::from_str(line).unwrap();
        assert!(msg.is_init());
        assert_eq!(msg.resume_token(), Some("sess-abc"));
    }

    #[test]
    fn parses_text_delta_chunk() {
        let line = r#"{"type":"stream_event","session_id":"s1","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hello "}}}"#;
        let msg: RuntimeMessage = serde_json::from_str(line).unwrap();
        match msg {
            RuntimeMessage::StreamEvent {
                event: StreamChunk::ContentBlockDelta { delta: Delta::TextDelta { text } },
                ..
            } => assert_eq!(text, "Hello "),
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parses_tool_use_block_start() {
        let line = r#"{"type":"stream_event","event":{"type":"content_block_start","content_block":{"type":"tool_use","name":"Read","input":{"file_path":"src/main.rs"}}}}"#;
        let msg: RuntimeMessage = serde_json::from_str(line).unwrap();
        match msg {
            RuntimeMessage::StreamEvent {
                event: StreamChunk::ContentBlockStart { content_block: ContentBlock::ToolUse { name, .. } },
                ..
            } => assert_eq!(name, "Read"),
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parses_assistant_turn() {
        let line = r#"{"type":"assistant","session_id":"s1","message":{"content":[{"type":"text","text":"done"},{"type":"tool_use","name":"Bash","input":{}}]}}"#;
        let msg: RuntimeMessage = serde_json::from_str(line).unwrap();
        match &msg {
            RuntimeMessage::Assistant { message, .. } => assert_eq!(message.content.len(), 2),
            other => panic!("unexpected parse: {other:?}"),
        }
        assert_eq!(msg.resume_token(), Some("s1"));
    }

    #[test]
    fn parses_result_message() {
        let line = r#"{"type":"result","session_id":"s1","is_error":false,"result":"summary"}"#;
        let msg: RuntimeMessage = serde_json::from_str(line).unwrap();
        assert!(msg.is_result());
    }

    #[test]
    fn unknown_message_type_folds_to_other() {
        let line = r#"{"type":"user","message":{"role":"user"}}"#;
        let msg: RuntimeMessage = serde_json::from_str(line).unwrap();
        assert!(matches!(msg, RuntimeMessage::Other));
        assert_eq!(msg.resume_token(), None);
    }

    #[test]
    fn unknown_chunk_type_folds_to_other() {
        let line = r#"{"type":"stream_event","event":{"type":"message_start"}}"#;
        let msg: RuntimeMessage = serde_json::from_str(line).unwrap();
        assert!(matches!(
            msg,
            RuntimeMessage::StreamEvent { event: StreamChunk::Other, .. }
        ));
    }
}
