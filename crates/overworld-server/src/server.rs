//! HTTP surface: the WebSocket endpoint plus a health probe.
//!
//! The axum layer stays thin. Sockets are registered, upgraded, and pumped
//! here; every frame is handed to the hub through one mpsc channel so the
//! hub sees a single ordered stream of inbound messages.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

use overworld_core::ids::ClientId;

use crate::client::{handle_ws_connection, start_cleanup_task, ClientRegistry};
use crate::hub::Hub;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const INBOUND_QUEUE: usize = 1024;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// TCP port; 0 asks the OS for a free one.
    pub port: u16,
    /// Per-client outbound frame queue depth.
    pub max_send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 9090, max_send_queue: 256 }
    }
}

#[derive(Clone)]
struct AppState {
    hub: Arc<Hub>,
    registry: Arc<ClientRegistry>,
    message_tx: mpsc::Sender<(ClientId, String)>,
}

/// Running server. Dropping the handle aborts the background tasks.
pub struct ServerHandle {
    pub port: u16,
    _server: JoinHandle<()>,
    _dispatch: JoinHandle<()>,
    _cleanup: JoinHandle<()>,
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self._server.abort();
        self._dispatch.abort();
        self._cleanup.abort();
    }
}

/// Bind, wire the dispatch loop, and serve until the handle is dropped.
pub async fn start(
    config: ServerConfig,
    hub: Arc<Hub>,
    registry: Arc<ClientRegistry>,
) -> std::io::Result<ServerHandle> {
    let (message_tx, mut message_rx) = mpsc::channel::<(ClientId, String)>(INBOUND_QUEUE);

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    let port = listener.local_addr()?.port();
    hub.set_port(port);

    let state = AppState {
        hub: Arc::clone(&hub),
        registry: Arc::clone(&registry),
        message_tx,
    };
    let router = build_router(state);

    let dispatch = {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            while let Some((client_id, raw)) = message_rx.recv().await {
                hub.dispatch(&client_id, &raw).await;
            }
        })
    };

    let cleanup = start_cleanup_task(Arc::clone(&registry), CLEANUP_INTERVAL);

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "server stopped");
        }
    });

    tracing::info!(port, "listening");
    Ok(ServerHandle { port, _server: server, _dispatch: dispatch, _cleanup: cleanup })
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let (client_id, rx) = state.registry.register();
        tracing::info!(client_id = %client_id, "client connected");
        state.hub.on_connect(&client_id);

        handle_ws_connection(
            socket,
            client_id.clone(),
            rx,
            Arc::clone(&state.registry),
            state.message_tx.clone(),
        )
        .await;

        let role = state.registry.unregister(&client_id);
        state.hub.on_disconnect(&client_id, role).await;
        tracing::info!(client_id = %client_id, "client disconnected");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubConfig;
    use crate::worldgen::GridMapGenerator;
    use overworld_session::MockRuntime;
    use std::path::PathBuf;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("overworld-server-test-{}", uuid::Uuid::now_v7()))
    }

    async fn started() -> (ServerHandle, Arc<Hub>) {
        let registry = Arc::new(ClientRegistry::new(256));
        let hub = Hub::new(
            HubConfig {
                data_dir: temp_dir(),
                runtime: Arc::new(MockRuntime::new(vec![])),
                generator: Arc::new(GridMapGenerator::default()),
            },
            Arc::clone(&registry),
        )
        .await;
        let handle = start(ServerConfig { port: 0, max_send_queue: 256 }, Arc::clone(&hub), registry)
            .await
            .unwrap();
        (handle, hub)
    }

    #[tokio::test]
    async fn health_endpoint_answers() {
        let (handle, _hub) = started().await;
        assert_ne!(handle.port, 0);

        let body: serde_json::Value =
            reqwest::get(format!("http://127.0.0.1:{}/health", handle.port))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn two_servers_bind_distinct_ports() {
        let (a, _) = started().await;
        let (b, _) = started().await;
        assert_ne!(a.port, b.port);
    }
}
