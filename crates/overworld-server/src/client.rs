//! Connected WebSocket clients.
//!
//! Each connection gets a registry entry with a bounded send queue and a role
//! tag (player, registered external agent, or spectator). Delivery is
//! best-effort: a full queue drops the frame with a warning rather than
//! blocking the hub.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use overworld_core::ids::{AgentId, ClientId, SpectatorId};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum ClientRole {
    /// Connected but not yet identified; treated as the player console.
    #[default]
    Player,
    /// An externally driven agent that registered itself.
    Agent(AgentId),
    Spectator(SpectatorId),
}

pub struct Client {
    pub id: ClientId,
    role: Mutex<ClientRole>,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_pong: AtomicU64,
}

impl Client {
    fn new(id: ClientId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            role: Mutex::new(ClientRole::Player),
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn role(&self) -> ClientRole {
        self.role.lock().clone()
    }

    pub fn set_role(&self, role: ClientRole) {
        *self.role.lock() = role;
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < CLIENT_TIMEOUT.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all connected clients.
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<Client>>,
    max_send_queue: usize,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self { clients: DashMap::new(), max_send_queue }
    }

    /// Register a new client and return its id + the outbound frame stream.
    pub fn register(&self) -> (ClientId, mpsc::Receiver<String>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.clients.insert(id.clone(), Arc::new(Client::new(id.clone(), tx)));
        (id, rx)
    }

    /// Remove a client, returning the role it held so disconnect handling
    /// can clean up world state for agents and spectators.
    pub fn unregister(&self, id: &ClientId) -> Option<ClientRole> {
        self.clients.remove(id).map(|(_, client)| {
            client.connected.store(false, Ordering::Relaxed);
            client.role()
        })
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    pub fn role(&self, id: &ClientId) -> Option<ClientRole> {
        self.clients.get(id).map(|c| c.role())
    }

    pub fn set_role(&self, id: &ClientId, role: ClientRole) {
        if let Some(client) = self.clients.get(id) {
            client.set_role(role);
        }
    }

    /// The connection a registered external agent speaks on, if any.
    pub fn client_for_agent(&self, agent_id: &AgentId) -> Option<ClientId> {
        self.clients
            .iter()
            .find(|entry| entry.value().role() == ClientRole::Agent(agent_id.clone()))
            .map(|entry| entry.key().clone())
    }

    /// Queue a frame for one client. False when unknown, closed, or full.
    pub fn send_to(&self, id: &ClientId, frame: String) -> bool {
        let Some(client) = self.clients.get(id) else {
            return false;
        };
        match client.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                tracing::warn!(
                    client_id = %id,
                    frame_len = frame.len(),
                    "send queue full, dropping frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a frame for every connected client, skipping the closed ones.
    pub fn broadcast(&self, frame: &str) {
        for entry in self.clients.iter() {
            let client = entry.value();
            if client.is_connected() {
                let _ = client.tx.try_send(frame.to_string());
            }
        }
    }

    fn record_pong(&self, id: &ClientId) {
        if let Some(client) = self.clients.get(id) {
            client.record_pong();
        }
    }

    fn mark_disconnected(&self, id: &ClientId) {
        if let Some(client) = self.clients.get(id) {
            client.connected.store(false, Ordering::Relaxed);
        }
    }

    /// Remove clients that stopped answering pings.
    pub fn cleanup_dead_clients(&self) -> usize {
        let dead: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|entry| !entry.value().is_alive())
            .map(|entry| entry.key().clone())
            .collect();
        let removed = dead.len();
        for id in dead {
            self.unregister(&id);
            tracing::info!(client_id = %id, "cleaned up dead client");
        }
        removed
    }
}

/// Drive one WebSocket: writer task forwards queued frames and pings, reader
/// task feeds inbound text to the hub and tracks pongs.
pub async fn handle_ws_connection(
    socket: WebSocket,
    client_id: ClientId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ClientRegistry>,
    on_message: mpsc::Sender<(ClientId, String)>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_cid = client_id.clone();
    let writer_registry = Arc::clone(&registry);
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    match frame {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        writer_registry.mark_disconnected(&writer_cid);
    });

    let reader_cid = client_id.clone();
    let reader_registry = Arc::clone(&registry);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    let _ = on_message.send((reader_cid.clone(), text.to_string())).await;
                }
                WsMessage::Pong(_) => reader_registry.record_pong(&reader_cid),
                WsMessage::Close(_) => break,
                WsMessage::Ping(_) => {} // axum answers automatically
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }
}

/// Periodic sweep for clients that vanished without a close frame.
pub fn start_cleanup_task(
    registry: Arc<ClientRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead_clients();
            if removed > 0 {
                tracing::info!(removed, "dead client cleanup");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister() {
        let registry = ClientRegistry::new(32);
        assert_eq!(registry.count(), 0);

        let (id1, _rx1) = registry.register();
        let (id2, _rx2) = registry.register();
        assert_ne!(id1, id2);
        assert_eq!(registry.count(), 2);

        registry.unregister(&id1);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn roles_default_to_player() {
        let registry = ClientRegistry::new(32);
        let (id, _rx) = registry.register();
        assert_eq!(registry.role(&id), Some(ClientRole::Player));

        let agent = AgentId::from_raw("oracle");
        registry.set_role(&id, ClientRole::Agent(agent.clone()));
        assert_eq!(registry.role(&id), Some(ClientRole::Agent(agent.clone())));
        assert_eq!(registry.client_for_agent(&agent), Some(id));
        assert_eq!(registry.client_for_agent(&AgentId::from_raw("ghost")), None);
    }

    #[test]
    fn send_to_specific_client() {
        let registry = ClientRegistry::new(32);
        let (id, mut rx) = registry.register();

        assert!(registry.send_to(&id, "hello".into()));
        assert_eq!(rx.try_recv().unwrap(), "hello");

        assert!(!registry.send_to(&ClientId::new(), "nobody home".into()));
    }

    #[test]
    fn full_queue_drops_the_frame() {
        let registry = ClientRegistry::new(2);
        let (id, _rx) = registry.register();

        assert!(registry.send_to(&id, "one".into()));
        assert!(registry.send_to(&id, "two".into()));
        assert!(!registry.send_to(&id, "three".into()));
    }

    #[test]
    fn broadcast_skips_disconnected_clients() {
        let registry = ClientRegistry::new(32);
        let (id1, mut rx1) = registry.register();
        let (id2, mut rx2) = registry.register();

        registry.mark_disconnected(&id2);
        registry.broadcast("ping");

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
        let _ = id1;
    }

    #[test]
    fn cleanup_removes_expired_clients() {
        let registry = ClientRegistry::new(32);
        let (id, _rx) = registry.register();

        registry.clients.get(&id).unwrap().last_pong.store(0, Ordering::Relaxed);
        assert_eq!(registry.cleanup_dead_clients(), 1);
        assert_eq!(registry.count(), 0);
    }
}
