pub mod map;
pub mod store;

pub use map::{default_map, MapNode, MapNodeKind, MapObject, ObjectKind, Position, TileMap};
pub use store::{AgentInfo, AgentStats, AgentStatus, NavigationFrame, NavigationState, Quest, WorldSnapshot, WorldState};
