//! The seam between the hub and the external agent runtime.
//!
//! An [`AgentRuntime`] turns a [`RunSpec`] into a stream of
//! [`RuntimeMessage`]s. The production implementation shells out to an agent
//! CLI emitting line-delimited JSON; tests use [`crate::mock::MockRuntime`].

use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;

use async_trait::async_trait;
use futures::Stream;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_stream::wrappers::UnboundedReceiverStream;

use overworld_core::ids::AgentId;
use overworld_core::runtime::RuntimeMessage;

pub type MessageStream = Pin<Box<dyn Stream<Item = RuntimeMessage> + Send>>;

#[derive(Clone, Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to launch agent runtime: {0}")]
    Launch(String),
    #[error("agent runtime misconfigured: {0}")]
    Config(String),
}

/// Everything needed to start one agent run.
#[derive(Clone, Debug)]
pub struct RunSpec {
    pub agent_id: AgentId,
    pub system_prompt: String,
    pub prompt: String,
    pub allowed_tools: Vec<String>,
    /// Resume token from a previous run of the same agent, if any.
    pub resume: Option<String>,
    /// Working directory for the run (the linked repository root).
    pub root: PathBuf,
}

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn start(&self, spec: RunSpec) -> Result<MessageStream, RuntimeError>;
}

/// Runs an external agent CLI as a subprocess, one process per run.
///
/// The CLI is expected to print one JSON message per stdout line. Lines that
/// do not parse are logged and skipped so tool chatter never kills a session.
pub struct CliRuntime {
    command: String,
    extra_args: Vec<String>,
}

impl CliRuntime {
    pub fn new(command: impl Into<String>) -> Self {
        Self { command: command.into(), extra_args: Vec::new() }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    fn build_command(&self, spec: &RunSpec) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.current_dir(&spec.root)
            .arg("--print")
            .arg("--verbose")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--system-prompt")
            .arg(&spec.system_prompt);
        if !spec.allowed_tools.is_empty() {
            cmd.arg("--allowed-tools").arg(spec.allowed_tools.join(","));
        }
        if let Some(token) = &spec.resume {
            cmd.arg("--resume").arg(token);
        }
        for arg in &self.extra_args {
            cmd.arg(arg);
        }
        cmd.arg(&spec.prompt);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl AgentRuntime for CliRuntime {
    async fn start(&self, spec: RunSpec) -> Result<MessageStream, RuntimeError> {
        let mut cmd = self.build_command(&spec);
        let mut child = cmd.spawn().map_err(|e| RuntimeError::Launch(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Launch("child stdout not captured".into()))?;
        let stderr = child.stderr.take();

        let agent_id = spec.agent_id.clone();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        // Surface runtime stderr in our logs without mixing it into the stream.
        if let Some(stderr) = stderr {
            let agent_id = agent_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        tracing::warn!(agent_id = %agent_id, "runtime stderr: {line}");
                    }
                }
            });
        }

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match parse_line(line) {
                            Some(msg) => {
                                if tx.send(msg).is_err() {
                                    break;
                                }
                            }
                            None => {
                                tracing::debug!(agent_id = %agent_id, "skipping unparseable runtime line");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(agent_id = %agent_id, error = %e, "runtime stdout read failed");
                        break;
                    }
                }
            }
            match child.wait().await {
                Ok(status) if !status.success() => {
                    tracing::warn!(agent_id = %agent_id, ?status, "agent runtime exited non-zero");
                }
                Err(e) => {
                    tracing::warn!(agent_id = %agent_id, error = %e, "failed to reap agent runtime");
                }
                _ => {}
            }
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

fn parse_line(line: &str) -> Option<RuntimeMessage> {
    serde_json::from_str(line).ok()
}
