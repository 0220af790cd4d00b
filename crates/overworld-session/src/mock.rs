//! Deterministic runtime for tests — no subprocesses, no network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;

use overworld_core::runtime::{AssistantPayload, ContentBlock, Delta, RuntimeMessage, StreamChunk};

use crate::runtime::{AgentRuntime, MessageStream, RunSpec, RuntimeError};

/// One pre-programmed run: either a fixed message sequence, a launch error,
/// or a delayed sequence for timing-sensitive tests.
pub enum MockScript {
    Messages(Vec<RuntimeMessage>),
    Error(RuntimeError),
    Delayed(Duration, Vec<RuntimeMessage>),
}

impl MockScript {
    /// A complete run: init handshake, one assistant text turn, result.
    pub fn simple_turn(token: &str, text: &str) -> Self {
        Self::Messages(vec![
            RuntimeMessage::System { subtype: "init".into(), session_id: Some(token.into()) },
            RuntimeMessage::Assistant {
                session_id: Some(token.into()),
                message: AssistantPayload {
                    content: vec![ContentBlock::Text { text: text.into() }],
                },
            },
            RuntimeMessage::Result { session_id: Some(token.into()), is_error: false, result: Some("ok".into()) },
        ])
    }

    /// A run that streams the given deltas before finishing the block.
    pub fn streamed(token: &str, deltas: &[&str]) -> Self {
        let mut messages = vec![RuntimeMessage::System {
            subtype: "init".into(),
            session_id: Some(token.into()),
        }];
        for delta in deltas {
            messages.push(RuntimeMessage::StreamEvent {
                session_id: Some(token.into()),
                event: StreamChunk::ContentBlockDelta {
                    delta: Delta::TextDelta { text: (*delta).into() },
                },
            });
        }
        messages.push(RuntimeMessage::StreamEvent {
            session_id: Some(token.into()),
            event: StreamChunk::ContentBlockStop {},
        });
        messages.push(RuntimeMessage::Result {
            session_id: Some(token.into()),
            is_error: false,
            result: None,
        });
        Self::Messages(messages)
    }

    /// A run that errors without ever producing a resume token.
    pub fn failed_run() -> Self {
        Self::Messages(vec![RuntimeMessage::Result {
            session_id: None,
            is_error: true,
            result: Some("runtime crashed".into()),
        }])
    }
}

/// Hands out scripts in order, one per `start` call, and records every spec
/// it was started with so tests can assert prompt ordering.
pub struct MockRuntime {
    scripts: Mutex<VecDeque<MockScript>>,
    call_count: AtomicUsize,
    specs: Mutex<Vec<RunSpec>>,
}

impl MockRuntime {
    pub fn new(scripts: Vec<MockScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            call_count: AtomicUsize::new(0),
            specs: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Prompts passed to `start`, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.specs.lock().iter().map(|s| s.prompt.clone()).collect()
    }

    /// Resume tokens passed to `start`, in call order.
    pub fn resumes(&self) -> Vec<Option<String>> {
        self.specs.lock().iter().map(|s| s.resume.clone()).collect()
    }
}

#[async_trait]
impl AgentRuntime for MockRuntime {
    async fn start(&self, spec: RunSpec) -> Result<MessageStream, RuntimeError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.specs.lock().push(spec);
        let script = self.scripts.lock().pop_front().ok_or_else(|| {
            RuntimeError::Config("MockRuntime: no script configured for this call".into())
        })?;
        match script {
            MockScript::Messages(messages) => Ok(Box::pin(stream::iter(messages))),
            MockScript::Error(e) => Err(e),
            MockScript::Delayed(delay, messages) => {
                tokio::time::sleep(delay).await;
                Ok(Box::pin(stream::iter(messages)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use overworld_core::ids::AgentId;
    use std::path::PathBuf;

    fn spec() -> RunSpec {
        RunSpec {
            agent_id: AgentId::from_raw("a"),
            system_prompt: String::new(),
            prompt: "go".into(),
            allowed_tools: vec![],
            resume: None,
            root: PathBuf::from("."),
        }
    }

    #[tokio::test]
    async fn scripts_play_in_order() {
        let runtime = MockRuntime::new(vec![
            MockScript::simple_turn("t1", "first"),
            MockScript::simple_turn("t2", "second"),
        ]);

        let first: Vec<_> = runtime.start(spec()).await.unwrap().collect().await;
        assert_eq!(first.len(), 3);
        assert_eq!(first[0].resume_token(), Some("t1"));

        let second: Vec<_> = runtime.start(spec()).await.unwrap().collect().await;
        assert_eq!(second[0].resume_token(), Some("t2"));
        assert_eq!(runtime.call_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_scripts_error() {
        let runtime = MockRuntime::new(vec![]);
        assert!(runtime.start(spec()).await.is_err());
    }

    #[tokio::test]
    async fn streamed_script_shape() {
        let runtime = MockRuntime::new(vec![MockScript::streamed("t", &["Hello ", "World"])]);
        let messages: Vec<_> = runtime.start(spec()).await.unwrap().collect().await;
        // init + 2 deltas + stop + result
        assert_eq!(messages.len(), 5);
        assert!(messages.last().unwrap().is_result());
    }
}
