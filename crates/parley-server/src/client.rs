use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use parley_core::ids::SessionId;

use crate::error::ServerError;
use crate::orchestrator::SessionOrchestrator;
use crate::protocol::{self, ClientEnvelope, ServiceEnvelope};
use crate::transport::ClientTransport;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Unique connection identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl Default for ClientId {
    fn default() -> Self {
        Self(format!("client_{}", Uuid::now_v7()))
    }
}

impl ClientId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One WebSocket connection and the sessions it has spoken for.
pub struct Client {
    pub id: ClientId,
    pub sessions: HashSet<SessionId>,
    pub tx: mpsc::Sender<String>,
}

/// Connection table plus the session → connection index used for routing.
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<Mutex<Client>>>,
    session_index: DashMap<SessionId, ClientId>,
    max_send_queue: usize,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            clients: DashMap::new(),
            session_index: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new connection and return its id plus the outbound queue.
    pub fn register(&self) -> (ClientId, mpsc::Receiver<String>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let client = Client {
            id: id.clone(),
            sessions: HashSet::new(),
            tx,
        };
        self.clients.insert(id.clone(), Arc::new(Mutex::new(client)));
        (id, rx)
    }

    /// Remove a connection. Returns the sessions that were still routed to it.
    pub async fn unregister(&self, id: &ClientId) -> Vec<SessionId> {
        let Some((_, client)) = self.clients.remove(id) else {
            return Vec::new();
        };
        let sessions: Vec<SessionId> = client.lock().await.sessions.drain().collect();
        sessions
            .into_iter()
            .filter(|session_id| self.session_index.remove_if(session_id, |_, owner| owner == id).is_some())
            .collect()
    }

    /// Route `session_id` to `client_id`. The latest connection to speak for a
    /// session owns it.
    pub async fn bind_session(&self, client_id: &ClientId, session_id: SessionId) {
        let Some(client) = self.clients.get(client_id).map(|c| Arc::clone(c.value())) else {
            return;
        };
        let previous = self.session_index.insert(session_id.clone(), client_id.clone());
        if let Some(previous) = previous.filter(|p| p != client_id) {
            debug!(session_id = %session_id, from = %previous, to = %client_id, "session moved to new connection");
            if let Some(old) = self.clients.get(&previous).map(|c| Arc::clone(c.value())) {
                old.lock().await.sessions.remove(&session_id);
            }
        }
        client.lock().await.sessions.insert(session_id);
    }

    pub fn client_for_session(&self, session_id: &SessionId) -> Option<ClientId> {
        self.session_index.get(session_id).map(|c| c.value().clone())
    }

    /// Queue a message for one connection, waiting while the queue is full.
    /// Returns false once the connection is gone.
    pub async fn send_to(&self, client_id: &ClientId, message: String) -> bool {
        let Some(client) = self.clients.get(client_id).map(|c| Arc::clone(c.value())) else {
            return false;
        };
        let tx = client.lock().await.tx.clone();
        if tx.capacity() == 0 {
            trace!(client_id = %client_id, "send queue full, waiting");
        }
        match tx.send(message).await {
            Ok(()) => true,
            Err(mpsc::error::SendError(msg)) => {
                debug!(client_id = %client_id, msg_len = msg.len(), "connection closed, message discarded");
                false
            }
        }
    }

    /// Number of open connections.
    pub fn count(&self) -> usize {
        self.clients.len()
    }
}

#[async_trait]
impl ClientTransport for ClientRegistry {
    async fn send(&self, session_id: &SessionId, envelope: &ServiceEnvelope) -> Result<(), ServerError> {
        let client_id = self
            .client_for_session(session_id)
            .ok_or_else(|| ServerError::NotConnected(session_id.to_string()))?;
        let json = envelope.to_json()?;
        if self.send_to(&client_id, json).await {
            Ok(())
        } else {
            Err(ServerError::Transport(format!("could not queue {} for {client_id}", envelope.event_type)))
        }
    }
}

/// Drive one WebSocket connection until either side hangs up.
///
/// Inbound frames are accepted one at a time, in arrival order, by a single
/// worker. Agent runs are spawned off that worker, so a request blocked on an
/// approval never holds up the `tool_approval` frame that releases it. When
/// the connection ends, every session still routed to it is detached.
pub async fn handle_ws_connection(
    socket: WebSocket,
    client_id: ClientId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ClientRegistry>,
    orchestrator: Arc<SessionOrchestrator>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_cid = client_id.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    trace!(client_id = %writer_cid, "sent ping");
                }
            }
        }
    });

    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<ClientEnvelope>();

    let worker_orchestrator = Arc::clone(&orchestrator);
    let worker = tokio::spawn(async move {
        while let Some(envelope) = frames_rx.recv().await {
            if let Some(pending) = worker_orchestrator.accept(envelope).await {
                let orchestrator = Arc::clone(&worker_orchestrator);
                tokio::spawn(async move { orchestrator.run_request(pending).await });
            }
        }
    });

    let reader_cid = client_id.clone();
    let reader_registry = Arc::clone(&registry);
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => match protocol::parse_client_event(text.as_str()) {
                    Ok(envelope) => {
                        reader_registry
                            .bind_session(&reader_cid, envelope.session_id.clone())
                            .await;
                        if frames_tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(client_id = %reader_cid, error = %e, "dropping malformed frame");
                    }
                },
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => reader.abort(),
        _ = &mut reader => {},
    }

    // Frames already read are still applied before the sessions are detached.
    if let Err(e) = worker.await {
        warn!(client_id = %client_id, error = %e, "frame worker failed");
    }

    let orphaned = registry.unregister(&client_id).await;
    info!(client_id = %client_id, sessions = orphaned.len(), "client disconnected");
    for session_id in orphaned {
        orchestrator.on_disconnect(&session_id).await;
    }
}
