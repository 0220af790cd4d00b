pub mod error;
pub mod events;
pub mod ids;
pub mod paths;
pub mod process;
pub mod runtime;

pub use error::CoreError;
pub use events::{RpgEvent, RpgEventKind};
pub use ids::{AgentId, ClientId, FindingId, ProcessId, RealmId, SpectatorId};
pub use runtime::{ContentBlock, RuntimeMessage, StreamChunk};
