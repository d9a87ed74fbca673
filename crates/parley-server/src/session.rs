use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use parley_core::ids::{AgentId, RequestId, SessionId};
use parley_engine::{EventPipe, REQUEST_CANCELLED};

/// Lifecycle of one client session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    Uninitialized,
    Initialized,
    Attached,
    Processing,
    Detached,
    Deleted,
}

impl SessionPhase {
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        match (self, next) {
            (Deleted, _) => false,
            (_, Deleted) => true,
            (Uninitialized, Initialized | Attached | Processing | Detached) => true,
            (Initialized, Initialized | Attached | Processing | Detached) => true,
            (Attached, Initialized | Attached | Processing | Detached) => true,
            (Processing, Attached | Processing | Detached) => true,
            (Detached, Initialized | Attached) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::Attached => "attached",
            Self::Processing => "processing",
            Self::Detached => "detached",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event bus
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub data: Value,
}

/// In-process topic fan-out for listeners that live next to a session.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: impl Into<String>) -> mpsc::UnboundedReceiver<BusMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().entry(topic.into()).or_default().push(tx);
        rx
    }

    /// Deliver to every live subscriber of `topic`. Returns how many received it.
    pub fn publish(&self, topic: &str, data: Value) -> usize {
        let mut subscribers = self.subscribers.lock();
        let Some(senders) = subscribers.get_mut(topic) else {
            return 0;
        };
        let message = BusMessage {
            topic: topic.to_string(),
            data,
        };
        senders.retain(|tx| tx.send(message.clone()).is_ok());
        senders.len()
    }

    pub fn unsubscribe_all(&self) {
        self.subscribers.lock().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().values().map(Vec::len).sum()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Runtime session
// ─────────────────────────────────────────────────────────────────────────────

/// Live state for one connected session. Persisted transcripts live in the
/// context store, not here.
pub struct RuntimeSession {
    pub session_id: SessionId,
    pub agent_id: Option<AgentId>,
    pub avatar_url: Option<String>,
    pub user_id: Option<String>,
    pub plugin_config: Option<Value>,
    pub created_at: DateTime<Utc>,
    phase: SessionPhase,
    pipe: Option<Arc<EventPipe>>,
    bus: Arc<EventBus>,
}

impl RuntimeSession {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            agent_id: None,
            avatar_url: None,
            user_id: None,
            plugin_config: None,
            created_at: Utc::now(),
            phase: SessionPhase::Uninitialized,
            pipe: None,
            bus: Arc::new(EventBus::new()),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Move to `next`. An unexpected transition is logged and applied anyway.
    pub fn transition(&mut self, next: SessionPhase) {
        if !self.phase.can_transition_to(next) {
            warn!(session_id = %self.session_id, from = %self.phase, to = %next, "unexpected session transition");
        }
        self.phase = next;
    }

    pub fn pipe(&self) -> Option<Arc<EventPipe>> {
        self.pipe.clone()
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// Start a new request pipe. A pipe still in flight is cancelled first.
    pub fn create_pipe(&mut self, request_id: RequestId) -> Arc<EventPipe> {
        if let Some(previous) = self.pipe.take() {
            if !previous.is_closed() {
                debug!(session_id = %self.session_id, request_id = %previous.request_id(), "superseding in-flight request");
                previous.close(Some(REQUEST_CANCELLED));
            }
        }
        let pipe = Arc::new(EventPipe::new(request_id));
        self.pipe = Some(Arc::clone(&pipe));
        pipe
    }

    /// True when `request_id` owns the current pipe.
    pub fn is_current(&self, request_id: &RequestId) -> bool {
        self.pipe.as_ref().is_some_and(|p| p.request_id() == request_id)
    }

    /// Drop listeners and close the pipe, rejecting any approval still pending.
    pub fn release(&mut self) {
        self.bus.unsubscribe_all();
        if let Some(pipe) = self.pipe.take() {
            pipe.close(None);
        }
    }
}
