pub mod findings;
pub mod manager;
pub mod mock;
pub mod prompt;
pub mod runtime;
pub mod translator;
pub mod vault;

pub use manager::{
    PermissionTier, ProcessAgentContext, SessionConfig, SessionError, SessionManager, SessionStatus, Signal,
};
pub use mock::{MockRuntime, MockScript};
pub use runtime::{AgentRuntime, CliRuntime, MessageStream, RunSpec, RuntimeError};
pub use translator::EventTranslator;
