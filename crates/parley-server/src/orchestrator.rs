//! Session lifecycle and per-message workflow.
//!
//! Each `user_message` runs the agent and a forwarding consumer side by side
//! over one fresh pipe. The consumer translates every pipe event into an
//! envelope, sends it to the client and republishes it on the session bus.
//!
//! Handling is split in two: [`SessionOrchestrator::accept`] applies a frame's
//! effect on session state and must be called in arrival order, while
//! [`SessionOrchestrator::run_request`] drives the agent and may run
//! concurrently with later frames.

use std::pin::pin;
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use parley_core::ids::{AgentId, RequestId, SessionId};
use parley_core::profile::AgentProfile;
use parley_core::request::AgentRequest;
use parley_engine::{AgentConfig, AgentRegistry, AgentServices, ConfiguredAgent, EventPipe};
use parley_store::{AgentProfileRepo, StoreError};

use crate::protocol::{
    self, AttachSessionPayload, ClientEnvelope, ClientPayload, InitSessionPayload, ReasonPayload, ServiceEnvelope,
    SessionPhaseName, StatePayload, ToolApprovalPayload, UserMessagePayload,
};
use crate::session::{BusMessage, EventBus, RuntimeSession, SessionPhase};
use crate::translate;
use crate::transport::ClientTransport;

pub const INVALID_AGENT: &str = "invalid_agent";

/// A `user_message` whose pipe is open but whose agent has not run yet.
pub struct PendingRequest {
    session_id: SessionId,
    agent_id: Option<AgentId>,
    pipe: Arc<EventPipe>,
    bus: Arc<EventBus>,
    request: AgentRequest,
}

impl PendingRequest {
    pub fn request_id(&self) -> &RequestId {
        self.pipe.request_id()
    }
}

pub struct SessionOrchestrator {
    registry: Arc<AgentRegistry>,
    profiles: AgentProfileRepo,
    services: AgentServices,
    agent_config: AgentConfig,
    transport: Arc<dyn ClientTransport>,
    sessions: DashMap<SessionId, RuntimeSession>,
}

impl SessionOrchestrator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        profiles: AgentProfileRepo,
        services: AgentServices,
        agent_config: AgentConfig,
        transport: Arc<dyn ClientTransport>,
    ) -> Self {
        Self {
            registry,
            profiles,
            services,
            agent_config,
            transport,
            sessions: DashMap::new(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_phase(&self, session_id: &SessionId) -> Option<SessionPhase> {
        self.sessions.get(session_id).map(|s| s.phase())
    }

    /// Listen to forwarded events of a live session, e.g. topic `agent.final`.
    pub fn subscribe(&self, session_id: &SessionId, topic: &str) -> Option<mpsc::UnboundedReceiver<BusMessage>> {
        self.sessions.get(session_id).map(|s| s.bus().subscribe(topic))
    }

    /// Parse one raw frame and handle it. Malformed frames are logged and dropped.
    pub async fn handle_frame(&self, raw: &str) {
        match protocol::parse_client_event(raw) {
            Ok(envelope) => self.handle(envelope).await,
            Err(e) => warn!(error = %e, "dropping malformed frame"),
        }
    }

    /// Accept a frame and, for `user_message`, run the request to completion.
    pub async fn handle(&self, envelope: ClientEnvelope) {
        if let Some(pending) = self.accept(envelope).await {
            self.run_request(pending).await;
        }
    }

    /// Apply one frame in order. A `user_message` is only set up here: its
    /// pipe is opened and the returned request still has to be run.
    #[instrument(skip_all, fields(session_id = %envelope.session_id, event = envelope.event_type().as_str()))]
    pub async fn accept(&self, envelope: ClientEnvelope) -> Option<PendingRequest> {
        let ClientEnvelope {
            session_id,
            agent_id,
            trace_id,
            payload,
            ..
        } = envelope;
        match payload {
            ClientPayload::InitSession(payload) => self.init_session(session_id, agent_id, payload).await,
            ClientPayload::AttachSession(payload) => self.attach_session(session_id, payload).await,
            ClientPayload::UserMessage(payload) => return Some(self.begin_request(session_id, payload, trace_id)),
            ClientPayload::ToolApproval(payload) => self.tool_approval(&session_id, payload),
            ClientPayload::Heartbeat(_) => self.send(ServiceEnvelope::heartbeat(session_id)).await,
            ClientPayload::DetachSession(ReasonPayload { reason }) => {
                self.detach(&session_id, reason.as_deref()).await
            }
            ClientPayload::DeleteSession(ReasonPayload { reason }) => {
                self.delete(&session_id, reason.as_deref()).await
            }
        }
        None
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    async fn init_session(&self, session_id: SessionId, envelope_agent: Option<AgentId>, payload: InitSessionPayload) {
        let Some(agent_id) = payload.agent_id.or(envelope_agent) else {
            warn!(session_id = %session_id, "init_session without agent id");
            self.send(ServiceEnvelope::error(session_id, INVALID_AGENT, "init_session requires an agent id"))
                .await;
            return;
        };

        let profile = match self.ensure_agent(&agent_id) {
            Ok(profile) => profile,
            Err(StoreError::NotFound(_)) => {
                warn!(session_id = %session_id, agent_id = %agent_id, "init_session for unknown agent");
                self.send(ServiceEnvelope::error(
                    session_id,
                    INVALID_AGENT,
                    format!("unknown agent: {agent_id}"),
                ))
                .await;
                return;
            }
            Err(e) => {
                error!(session_id = %session_id, agent_id = %agent_id, error = %e, "agent profile lookup failed");
                self.send(ServiceEnvelope::error(session_id, "store_error", e.to_string()))
                    .await;
                return;
            }
        };

        let mut session = RuntimeSession::new(session_id.clone());
        session.agent_id = Some(agent_id.clone());
        session.avatar_url = profile.avatar_url.clone();
        session.user_id = payload.user_id;
        session.plugin_config = payload.plugin_config;
        session.transition(SessionPhase::Initialized);

        if let Some(mut previous) = self.sessions.insert(session_id.clone(), session) {
            debug!(session_id = %session_id, "re-initialized session, releasing previous runtime");
            previous.release();
        }
        info!(session_id = %session_id, agent_id = %agent_id, "session initialized");

        self.send(ServiceEnvelope::state(
            session_id,
            StatePayload::new(SessionPhaseName::Initialized)
                .with_progress(0.0)
                .with_avatar(profile.avatar_url),
        ))
        .await;
    }

    async fn attach_session(&self, session_id: SessionId, payload: AttachSessionPayload) {
        let avatar_url = {
            let mut session = self.session_entry(&session_id, "attach_session");
            if session.agent_id.is_none() {
                if let Some(agent_id) = payload.agent_id {
                    match self.ensure_agent(&agent_id) {
                        Ok(profile) => {
                            session.agent_id = Some(agent_id);
                            session.avatar_url = profile.avatar_url;
                        }
                        Err(e) => warn!(session_id = %session_id, agent_id = %agent_id, error = %e, "attach ignored unknown agent"),
                    }
                }
            }
            if session.phase() != SessionPhase::Processing {
                session.transition(SessionPhase::Attached);
            }
            session.avatar_url.clone()
        };

        self.send(ServiceEnvelope::state(
            session_id,
            StatePayload::new(SessionPhaseName::Attached)
                .with_progress(0.0)
                .with_avatar(avatar_url),
        ))
        .await;
    }

    /// Release a session's runtime resources. Persisted context stays.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn detach(&self, session_id: &SessionId, reason: Option<&str>) {
        let Some((_, mut session)) = self.sessions.remove(session_id) else {
            warn!(session_id = %session_id, "detach for unknown session");
            return;
        };
        self.send(ServiceEnvelope::state(
            session_id.clone(),
            StatePayload::new(SessionPhaseName::Detached)
                .with_progress(0.0)
                .with_avatar(session.avatar_url.clone()),
        ))
        .await;
        session.transition(SessionPhase::Detached);
        session.release();
        info!(session_id = %session_id, reason = reason.unwrap_or("client request"), "session detached");
    }

    /// Detach after the owning connection went away; nothing is sent.
    pub async fn on_disconnect(&self, session_id: &SessionId) {
        if let Some((_, mut session)) = self.sessions.remove(session_id) {
            session.transition(SessionPhase::Detached);
            session.release();
            info!(session_id = %session_id, "session detached on disconnect");
        }
    }

    /// Release the runtime and purge every persisted transcript of the session.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn delete(&self, session_id: &SessionId, reason: Option<&str>) {
        match self.sessions.remove(session_id) {
            Some((_, mut session)) => {
                session.transition(SessionPhase::Deleted);
                session.release();
            }
            None => debug!(session_id = %session_id, "delete for session with no runtime"),
        }

        match self.services.store.clear_session(session_id) {
            Ok(removed) => info!(
                session_id = %session_id,
                removed,
                reason = reason.unwrap_or("client request"),
                "session deleted"
            ),
            Err(e) => error!(session_id = %session_id, error = %e, "failed to purge session context"),
        }

        self.send(ServiceEnvelope::state(
            session_id.clone(),
            StatePayload::new(SessionPhaseName::Deleted).with_progress(1.0),
        ))
        .await;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Messages
    // ─────────────────────────────────────────────────────────────────────

    /// Open a fresh pipe for the message. Any request still running on the
    /// session is cancelled by the swap.
    fn begin_request(&self, session_id: SessionId, payload: UserMessagePayload, trace_id: Option<String>) -> PendingRequest {
        let request_id = RequestId::new();
        let mut session = self.session_entry(&session_id, "user_message");
        session.transition(SessionPhase::Processing);
        let pipe = session.create_pipe(request_id.clone());
        let request = build_request(&session, payload, trace_id);
        info!(session_id = %session_id, request_id = %request_id, "processing user message");
        PendingRequest {
            agent_id: session.agent_id.clone(),
            bus: session.bus(),
            session_id,
            pipe,
            request,
        }
    }

    /// Run the agent and forward its events until the pipe's `final`.
    #[instrument(skip_all, fields(session_id = %pending.session_id, request_id = %pending.request_id()))]
    pub async fn run_request(&self, pending: PendingRequest) {
        let PendingRequest {
            session_id,
            agent_id,
            pipe,
            bus,
            request,
        } = pending;
        let request_id = pipe.request_id().clone();

        tokio::join!(
            self.run_workflow(&request, &pipe, agent_id.as_ref()),
            self.forward_events(&session_id, &pipe, &bus),
        );

        if let Some(mut session) = self.sessions.get_mut(&session_id) {
            if session.is_current(&request_id) {
                session.transition(SessionPhase::Attached);
            }
        }
        debug!(session_id = %session_id, request_id = %request_id, "user message done");
    }

    /// Run the agent. Any failure becomes one error event, and the pipe is
    /// always closed so the consumer sees `final`.
    async fn run_workflow(&self, request: &AgentRequest, pipe: &EventPipe, agent_id: Option<&AgentId>) {
        match self.registry.process(request, pipe, agent_id).await {
            Ok(outcome) => debug!(request_id = %pipe.request_id(), ?outcome, "workflow finished"),
            Err(e) => {
                error!(request_id = %pipe.request_id(), error = %e, "workflow failed");
                pipe.error_with_code(e.code(), format!("workflow failed: {e}"), false);
            }
        }
        pipe.close(None);
    }

    async fn forward_events(&self, session_id: &SessionId, pipe: &EventPipe, bus: &EventBus) {
        let request_id = pipe.request_id();
        let mut events = pin!(pipe.reader());
        while let Some(event) = events.next().await {
            let envelope = translate::to_envelope(session_id, request_id, &event);
            if let Err(e) = self.transport.send(session_id, &envelope).await {
                warn!(
                    session_id = %session_id,
                    request_id = %request_id,
                    event = event.event_type(),
                    error = %e,
                    "failed to deliver event"
                );
            }
            let topic = format!("agent.{}", event.event_type());
            bus.publish(
                &topic,
                json!({
                    "session_id": session_id,
                    "request_id": request_id,
                    "event": event,
                }),
            );
        }
    }

    fn tool_approval(&self, session_id: &SessionId, payload: ToolApprovalPayload) {
        let pipe = self.sessions.get(session_id).and_then(|s| s.pipe());
        let Some(pipe) = pipe else {
            debug!(session_id = %session_id, approval_id = %payload.approval_id, "approval for session without active request ignored");
            return;
        };
        let resolution = pipe.approval_decision(payload.approval_id.clone(), payload.decision, payload.message);
        debug!(session_id = %session_id, approval_id = %payload.approval_id, ?resolution, "approval forwarded");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────

    /// Existing session, or a fresh uninitialized one.
    fn session_entry(
        &self,
        session_id: &SessionId,
        cause: &'static str,
    ) -> dashmap::mapref::one::RefMut<'_, SessionId, RuntimeSession> {
        self.sessions.entry(session_id.clone()).or_insert_with(|| {
            info!(session_id = %session_id, cause, "session created lazily");
            RuntimeSession::new(session_id.clone())
        })
    }

    /// Profile for `agent_id`, registering the agent on first sight.
    fn ensure_agent(&self, agent_id: &AgentId) -> Result<AgentProfile, StoreError> {
        if let Some(agent) = self.registry.get_agent(agent_id) {
            return Ok(agent.profile().clone());
        }
        let profile = self.profiles.get(agent_id)?;
        self.registry.register_agent(Arc::new(ConfiguredAgent::new(
            profile.clone(),
            self.services.clone(),
            self.agent_config.clone(),
        )));
        Ok(profile)
    }

    async fn send(&self, envelope: ServiceEnvelope) {
        if let Err(e) = self.transport.send(&envelope.session_id, &envelope).await {
            warn!(session_id = %envelope.session_id, event = %envelope.event_type, error = %e, "failed to send envelope");
        }
    }
}

fn build_request(session: &RuntimeSession, payload: UserMessagePayload, trace_id: Option<String>) -> AgentRequest {
    let mut request = AgentRequest::new(payload.text, session.session_id.clone());
    if let Some(user_id) = &session.user_id {
        request = request.with_extra("user_id", json!(user_id));
    }
    if let Some(config) = &session.plugin_config {
        request = request.with_extra("plugin_config", config.clone());
    }
    if let Some(metadata) = payload.metadata {
        request = request.with_extra("metadata", metadata);
    }
    if let Some(attachments) = payload.attachments {
        request = request.with_extra("attachments", attachments);
    }
    if let Some(trace_id) = trace_id {
        request = request.with_extra("trace_id", json!(trace_id));
    }
    request
}
