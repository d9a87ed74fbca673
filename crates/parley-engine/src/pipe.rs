//! Per-request event channel between an agent and the client forwarder.
//!
//! The pipe owns three pieces of state:
//! - an unbounded FIFO of [`AgentEvent`]s, ended by exactly one `final` event;
//! - a resolve-once final result;
//! - an approval table where each id is either awaiting a decision or holds a cached one.
//!
//! Enqueueing and the final transition happen under one lock, so no event can
//! land behind `final` and readers always see `final` last.

use std::collections::HashMap;
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use parley_core::events::{AgentEvent, Decision};
use parley_core::ids::{ApprovalId, RequestId};

/// Close reason that also marks the pipe as cancelled.
pub const REQUEST_CANCELLED: &str = "request_cancelled";

enum ApprovalSlot {
    AwaitingDecision(Vec<oneshot::Sender<Decision>>),
    DecisionCached(Decision),
}

/// Result of trying to record a decision for an approval id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// This decision is now the answer for the id.
    Recorded(Decision),
    /// The id was already resolved; the earlier decision stands.
    AlreadyResolved(Decision),
}

impl Resolution {
    pub fn decision(&self) -> Decision {
        match self {
            Self::Recorded(d) | Self::AlreadyResolved(d) => *d,
        }
    }
}

#[derive(Default)]
struct PipeState {
    /// A `final` event has been enqueued; further writes are dropped.
    finalized: bool,
    /// `close()` has run.
    shut_down: bool,
    cancelled: bool,
    approvals: HashMap<ApprovalId, ApprovalSlot>,
}

pub struct EventPipe {
    request_id: RequestId,
    tx: mpsc::UnboundedSender<AgentEvent>,
    rx: tokio::sync::Mutex<ReaderState>,
    state: Mutex<PipeState>,
    final_tx: watch::Sender<Option<String>>,
}

struct ReaderState {
    rx: mpsc::UnboundedReceiver<AgentEvent>,
    delivered_final: bool,
}

impl EventPipe {
    pub fn new(request_id: RequestId) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (final_tx, _) = watch::channel(None);
        Self {
            request_id,
            tx,
            rx: tokio::sync::Mutex::new(ReaderState {
                rx,
                delivered_final: false,
            }),
            state: Mutex::new(PipeState::default()),
            final_tx,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// True once `final` was written or the pipe was closed.
    pub fn is_closed(&self) -> bool {
        let state = self.state.lock();
        state.finalized || state.shut_down
    }

    /// True once `close()` ran: the request was torn down or has ended.
    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Enqueue an event. Returns `false` if the pipe already saw `final`.
    pub fn write(&self, event: AgentEvent) -> bool {
        let mut state = self.state.lock();
        if state.finalized {
            debug!(request_id = %self.request_id, event = event.event_type(), "write after final dropped");
            return false;
        }

        let final_text = match &event {
            AgentEvent::Final { text, .. } => Some(text.clone()),
            _ => None,
        };

        // The receiver lives inside `self`, so the send cannot fail while we exist.
        let _ = self.tx.send(event);

        if let Some(text) = final_text {
            state.finalized = true;
            self.final_tx.send_replace(Some(text));
        }
        true
    }

    // ─────────────────────────────────────────────────────────────────────
    // Typed writers
    // ─────────────────────────────────────────────────────────────────────

    pub fn text_delta(&self, text: impl Into<String>) -> bool {
        self.write(AgentEvent::TextDelta { text: text.into() })
    }

    pub fn think_delta(&self, text: impl Into<String>) -> bool {
        self.write(AgentEvent::ThinkDelta { text: text.into() })
    }

    pub fn tool_call(&self, name: impl Into<String>, arguments: Value) -> bool {
        self.write(AgentEvent::ToolCall {
            name: name.into(),
            arguments,
        })
    }

    pub fn tool_result(&self, name: impl Into<String>, success: bool, result: Value) -> bool {
        self.write(AgentEvent::ToolResult {
            name: name.into(),
            success,
            result,
        })
    }

    pub fn approval_required(
        &self,
        approval_id: ApprovalId,
        name: impl Into<String>,
        arguments: Value,
        message: impl Into<String>,
        safety_assessment: Value,
    ) -> bool {
        self.write(AgentEvent::ApprovalRequired {
            approval_id,
            name: name.into(),
            arguments,
            message: message.into(),
            safety_assessment,
        })
    }

    pub fn usage(&self, prompt_tokens: u64, completion_tokens: u64, cost: f64) -> bool {
        self.write(AgentEvent::Usage {
            prompt_tokens,
            completion_tokens,
            cost,
        })
    }

    pub fn final_text(&self, text: impl Into<String>) -> bool {
        self.write(AgentEvent::final_text(text))
    }

    pub fn final_structured(&self, text: impl Into<String>, structured: Value) -> bool {
        self.write(AgentEvent::Final {
            text: text.into(),
            structured: Some(structured),
        })
    }

    pub fn error(&self, message: impl Into<String>) -> bool {
        self.write(AgentEvent::error(message))
    }

    pub fn error_with_code(&self, code: &str, message: impl Into<String>, recoverable: bool) -> bool {
        self.write(AgentEvent::Error {
            code: Some(code.to_string()),
            message: message.into(),
            recoverable,
            detail: None,
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reading
    // ─────────────────────────────────────────────────────────────────────

    /// Next queued event, or `None` once `final` has been handed out.
    pub async fn next_event(&self) -> Option<AgentEvent> {
        let mut reader = self.rx.lock().await;
        if reader.delivered_final {
            return None;
        }
        let event = reader.rx.recv().await?;
        if event.is_final() {
            reader.delivered_final = true;
        }
        Some(event)
    }

    /// Lazy event sequence that ends right after `final`.
    /// Each call continues from wherever the previous reader stopped.
    pub fn reader(&self) -> impl Stream<Item = AgentEvent> + Send + '_ {
        futures::stream::unfold(self, |pipe| async move {
            let event = pipe.next_event().await?;
            Some((event, pipe))
        })
    }

    /// Wait for the final text. Resolves exactly once per pipe.
    pub async fn wait_final(&self) -> String {
        let mut rx = self.final_tx.subscribe();
        let text = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone().unwrap_or_default(),
            Err(_) => String::new(),
        };
        text
    }

    /// The final text if it has been written.
    pub fn final_value(&self) -> Option<String> {
        self.final_tx.borrow().clone()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Approval handshake
    // ─────────────────────────────────────────────────────────────────────

    /// Record a decision, waking every waiter on this id.
    fn resolve(&self, approval_id: &ApprovalId, decision: Decision) -> Resolution {
        let waiters = {
            let mut state = self.state.lock();
            match state.approvals.remove(approval_id) {
                Some(ApprovalSlot::DecisionCached(existing)) => {
                    state
                        .approvals
                        .insert(approval_id.clone(), ApprovalSlot::DecisionCached(existing));
                    return Resolution::AlreadyResolved(existing);
                }
                Some(ApprovalSlot::AwaitingDecision(waiters)) => {
                    state
                        .approvals
                        .insert(approval_id.clone(), ApprovalSlot::DecisionCached(decision));
                    waiters
                }
                None => {
                    state
                        .approvals
                        .insert(approval_id.clone(), ApprovalSlot::DecisionCached(decision));
                    Vec::new()
                }
            }
        };
        for waiter in waiters {
            let _ = waiter.send(decision);
        }
        Resolution::Recorded(decision)
    }

    /// Deliver a client decision. A repeated decision for a resolved id is ignored.
    pub fn approval_decision(
        &self,
        approval_id: ApprovalId,
        decision: Decision,
        message: Option<String>,
    ) -> Resolution {
        let resolution = self.resolve(&approval_id, decision);
        match resolution {
            Resolution::Recorded(_) => {
                debug!(request_id = %self.request_id, approval_id = %approval_id, %decision, "approval decision recorded");
                self.write(AgentEvent::ApprovalDecision {
                    approval_id,
                    decision,
                    message,
                });
            }
            Resolution::AlreadyResolved(existing) => {
                warn!(
                    request_id = %self.request_id,
                    approval_id = %approval_id,
                    ignored = %decision,
                    kept = %existing,
                    "duplicate approval decision ignored"
                );
            }
        }
        resolution
    }

    /// Wait for the decision on `approval_id`.
    ///
    /// Returns at once if the decision is already known. A closed pipe or an
    /// elapsed timeout counts as a rejection, which is then cached for the id.
    pub async fn wait_for_approval(&self, approval_id: &ApprovalId, timeout: Option<Duration>) -> Decision {
        let rx = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match state.approvals.get_mut(approval_id) {
                Some(ApprovalSlot::DecisionCached(decision)) => return *decision,
                Some(ApprovalSlot::AwaitingDecision(waiters)) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
                None if state.shut_down => {
                    state
                        .approvals
                        .insert(approval_id.clone(), ApprovalSlot::DecisionCached(Decision::Rejected));
                    return Decision::Rejected;
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    state
                        .approvals
                        .insert(approval_id.clone(), ApprovalSlot::AwaitingDecision(vec![tx]));
                    rx
                }
            }
        };

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(result) => result.ok(),
                Err(_) => {
                    warn!(request_id = %self.request_id, approval_id = %approval_id, ?limit, "approval wait timed out");
                    None
                }
            },
            None => rx.await.ok(),
        };

        match received {
            Some(decision) => decision,
            None => self.resolve(approval_id, Decision::Rejected).decision(),
        }
    }

    /// Number of approval ids still waiting for a decision.
    pub fn pending_approvals(&self) -> usize {
        self.state
            .lock()
            .approvals
            .values()
            .filter(|slot| matches!(slot, ApprovalSlot::AwaitingDecision(_)))
            .count()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Shutdown
    // ─────────────────────────────────────────────────────────────────────

    /// Tear the pipe down. Idempotent.
    ///
    /// Pending approval waiters resolve to rejected; `reason`, if given, is
    /// written as an error event; `final` is written with empty text if unset.
    pub fn close(&self, reason: Option<&str>) {
        let waiters: Vec<oneshot::Sender<Decision>> = {
            let mut state = self.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            if reason == Some(REQUEST_CANCELLED) {
                state.cancelled = true;
            }
            let mut waiters = Vec::new();
            for slot in state.approvals.values_mut() {
                if let ApprovalSlot::AwaitingDecision(pending) = slot {
                    waiters.append(pending);
                    *slot = ApprovalSlot::DecisionCached(Decision::Rejected);
                }
            }
            waiters
        };

        if !waiters.is_empty() {
            debug!(request_id = %self.request_id, count = waiters.len(), "rejecting pending approvals on close");
        }
        for waiter in waiters {
            let _ = waiter.send(Decision::Rejected);
        }

        if let Some(reason) = reason {
            self.write(AgentEvent::Error {
                code: Some("pipe_closed".to_string()),
                message: reason.to_string(),
                recoverable: false,
                detail: None,
            });
        }
        self.final_text("");
    }
}
