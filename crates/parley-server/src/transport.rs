use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use parley_core::ids::SessionId;

use crate::error::ServerError;
use crate::protocol::{ServerEventType, ServiceEnvelope};

/// Outbound path to whichever client owns a session.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    async fn send(&self, session_id: &SessionId, envelope: &ServiceEnvelope) -> Result<(), ServerError>;
}

/// Captures every envelope instead of sending it. Can be told to fail
/// selected event types to exercise the orchestrator's error paths.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<ServiceEnvelope>>,
    failing: Mutex<HashSet<ServerEventType>>,
    notify: Notify,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later send of `event_type` fail (the envelope is still recorded).
    pub fn fail_on(&self, event_type: ServerEventType) {
        self.failing.lock().insert(event_type);
    }

    pub fn envelopes(&self) -> Vec<ServiceEnvelope> {
        self.sent.lock().clone()
    }

    pub fn types(&self) -> Vec<ServerEventType> {
        self.sent.lock().iter().map(|e| e.event_type).collect()
    }

    pub fn count(&self, event_type: ServerEventType) -> usize {
        self.sent.lock().iter().filter(|e| e.event_type == event_type).count()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    /// Wait until at least `n` envelopes of `event_type` were sent.
    pub async fn wait_for(&self, event_type: ServerEventType, n: usize, limit: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.count(event_type) >= n {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(limit, wait).await.is_ok()
    }
}

#[async_trait]
impl ClientTransport for RecordingTransport {
    async fn send(&self, session_id: &SessionId, envelope: &ServiceEnvelope) -> Result<(), ServerError> {
        self.sent.lock().push(envelope.clone());
        self.notify.notify_waiters();
        if self.failing.lock().contains(&envelope.event_type) {
            return Err(ServerError::Transport(format!(
                "simulated failure sending {} to {session_id}",
                envelope.event_type
            )));
        }
        Ok(())
    }
}
