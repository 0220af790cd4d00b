pub mod client;
pub mod hub;
pub mod protocol;
pub mod realms;
pub mod server;
pub mod worldgen;

pub use client::{ClientRegistry, ClientRole};
pub use hub::{Hub, HubConfig};
pub use server::{start, ServerConfig, ServerHandle};
