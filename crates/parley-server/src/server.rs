use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::oneshot;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::client::{self, ClientRegistry};
use crate::orchestrator::SessionOrchestrator;

pub const DEFAULT_PORT: u16 = 38888;
pub const DEFAULT_WS_PATH: &str = "/ws/agent";

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub max_send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            path: DEFAULT_WS_PATH.to_string(),
            max_send_queue: 256,
        }
    }
}

/// Shared application state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SessionOrchestrator>,
    pub clients: Arc<ClientRegistry>,
}

pub fn build_router(path: &str, state: AppState) -> Router {
    Router::new()
        .route(path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind and serve. The orchestrator must send through the same `clients`
/// registry so envelopes reach the sockets accepted here.
pub async fn start(
    config: ServerConfig,
    orchestrator: Arc<SessionOrchestrator>,
    clients: Arc<ClientRegistry>,
) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(&config.path, AppState { orchestrator, clients });
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
    });

    info!(addr = %local_addr, path = %config.path, "parley server listening");

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown: Some(shutdown_tx),
        server,
    })
}

/// Keeps the serve task alive; `shutdown` stops accepting and drains.
pub struct ServerHandle {
    pub port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.server).await;
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (client_id, rx) = state.clients.register();
    info!(client_id = %client_id, "client connected");
    client::handle_ws_connection(socket, client_id, rx, state.clients, state.orchestrator).await;
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "sessions": state.orchestrator.session_count(),
            "clients": state.clients.count(),
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::provider::{NoopMemoryProvider, StaticPromptProvider};
    use parley_engine::{AgentConfig, AgentRegistry, AgentServices};
    use parley_llm::mock::{ScriptedLlm, ScriptedToolExecutor};
    use parley_store::{AgentProfileRepo, Database, InMemoryContextStore};

    fn orchestrator(clients: Arc<ClientRegistry>) -> Arc<SessionOrchestrator> {
        Arc::new(SessionOrchestrator::new(
            Arc::new(AgentRegistry::new()),
            AgentProfileRepo::new(Database::in_memory().unwrap()),
            AgentServices {
                llm: Arc::new(ScriptedLlm::new(Vec::new())),
                tools: Arc::new(ScriptedToolExecutor::new(Vec::new())),
                prompts: Arc::new(StaticPromptProvider),
                memory: Arc::new(NoopMemoryProvider),
                store: Arc::new(InMemoryContextStore::new()),
            },
            AgentConfig::default(),
            clients,
        ))
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let clients = Arc::new(ClientRegistry::new(32));
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        };
        let handle = start(config, orchestrator(clients.clone()), clients).await.unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["sessions"], 0);

        handle.shutdown().await;
    }

    #[test]
    fn default_config_matches_documented_endpoint() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 38888);
        assert_eq!(config.path, "/ws/agent");
    }

    #[test]
    fn build_router_creates_routes() {
        let clients = Arc::new(ClientRegistry::new(32));
        let state = AppState {
            orchestrator: orchestrator(clients.clone()),
            clients,
        };
        let _router = build_router(DEFAULT_WS_PATH, state);
    }
}
