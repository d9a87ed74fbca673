//! Client-facing wire envelopes.
//!
//! Envelope keys go out in camelCase (`eventId`, `sessionId`, `traceId`).
//! Inbound frames are accepted with either camelCase or snake_case keys, both
//! at the top level and inside payloads. Outbound payloads mirror the internal
//! event fields and stay snake_case.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use parley_core::events::Decision;
use parley_core::ids::{AgentId, ApprovalId, EventId, SessionId};

pub const PROTOCOL_VERSION: &str = "1.0";

/// Seconds since the Unix epoch, with sub-second precision.
pub fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("envelope is not a JSON object")]
    NotAnObject,

    #[error("missing event type")]
    MissingType,

    #[error("unsupported event type: {0}")]
    UnknownType(String),

    #[error("missing session id")]
    MissingSessionId,
}

// ─────────────────────────────────────────────────────────────────────────────
// Event types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientEventType {
    InitSession,
    AttachSession,
    UserMessage,
    ToolApproval,
    Heartbeat,
    DetachSession,
    DeleteSession,
}

impl ClientEventType {
    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "init_session" => Self::InitSession,
            "attach_session" => Self::AttachSession,
            "user_message" => Self::UserMessage,
            "tool_approval" => Self::ToolApproval,
            "heartbeat" => Self::Heartbeat,
            "detach_session" => Self::DetachSession,
            "delete_session" => Self::DeleteSession,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InitSession => "init_session",
            Self::AttachSession => "attach_session",
            Self::UserMessage => "user_message",
            Self::ToolApproval => "tool_approval",
            Self::Heartbeat => "heartbeat",
            Self::DetachSession => "detach_session",
            Self::DeleteSession => "delete_session",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerEventType {
    TextDelta,
    ThinkDelta,
    ToolCall,
    ToolResult,
    ApprovalRequired,
    ApprovalDecision,
    Heartbeat,
    Final,
    Error,
    Usage,
    State,
}

impl ServerEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TextDelta => "text_delta",
            Self::ThinkDelta => "think_delta",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::ApprovalRequired => "approval_required",
            Self::ApprovalDecision => "approval_decision",
            Self::Heartbeat => "heartbeat",
            Self::Final => "final",
            Self::Error => "error",
            Self::Usage => "usage",
            Self::State => "state",
        }
    }
}

impl std::fmt::Display for ServerEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Client,
    Agent,
    System,
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct UserMessagePayload {
    pub text: String,
    pub attachments: Option<Value>,
    pub metadata: Option<Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolApprovalPayload {
    pub approval_id: ApprovalId,
    pub decision: Decision,
    pub message: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HeartbeatPayload {
    pub client_time: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct InitSessionPayload {
    pub user_id: Option<String>,
    pub agent_id: Option<AgentId>,
    pub metadata: Option<Value>,
    pub plugin_config: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttachSessionPayload {
    pub agent_id: Option<AgentId>,
    pub metadata: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReasonPayload {
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ClientPayload {
    InitSession(InitSessionPayload),
    AttachSession(AttachSessionPayload),
    UserMessage(UserMessagePayload),
    ToolApproval(ToolApprovalPayload),
    Heartbeat(HeartbeatPayload),
    DetachSession(ReasonPayload),
    DeleteSession(ReasonPayload),
}

impl ClientPayload {
    pub fn event_type(&self) -> ClientEventType {
        match self {
            Self::InitSession(_) => ClientEventType::InitSession,
            Self::AttachSession(_) => ClientEventType::AttachSession,
            Self::UserMessage(_) => ClientEventType::UserMessage,
            Self::ToolApproval(_) => ClientEventType::ToolApproval,
            Self::Heartbeat(_) => ClientEventType::Heartbeat,
            Self::DetachSession(_) => ClientEventType::DetachSession,
            Self::DeleteSession(_) => ClientEventType::DeleteSession,
        }
    }
}

/// A validated inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientEnvelope {
    pub event_id: String,
    pub session_id: SessionId,
    pub ts: f64,
    pub source: String,
    pub agent_id: Option<AgentId>,
    pub trace_id: Option<String>,
    pub version: String,
    pub payload: ClientPayload,
}

impl ClientEnvelope {
    pub fn event_type(&self) -> ClientEventType {
        self.payload.event_type()
    }
}

/// Look a key up under its snake_case name, then its camelCase alias.
fn field<'a>(obj: &'a Map<String, Value>, snake: &str, camel: &str) -> Option<&'a Value> {
    obj.get(snake).or_else(|| obj.get(camel)).filter(|v| !v.is_null())
}

fn string_field(obj: &Map<String, Value>, snake: &str, camel: &str) -> Option<String> {
    field(obj, snake, camel)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

fn value_field(obj: &Map<String, Value>, snake: &str, camel: &str) -> Option<Value> {
    field(obj, snake, camel).cloned()
}

fn parse_payload(kind: ClientEventType, payload: &Map<String, Value>) -> ClientPayload {
    match kind {
        ClientEventType::InitSession => ClientPayload::InitSession(InitSessionPayload {
            user_id: string_field(payload, "user_id", "userId"),
            agent_id: string_field(payload, "agent_id", "agentId").map(AgentId::from_raw),
            metadata: value_field(payload, "metadata", "metadata"),
            plugin_config: value_field(payload, "plugin_config", "pluginConfig"),
        }),
        ClientEventType::AttachSession => ClientPayload::AttachSession(AttachSessionPayload {
            agent_id: string_field(payload, "agent_id", "agentId").map(AgentId::from_raw),
            metadata: value_field(payload, "metadata", "metadata"),
        }),
        ClientEventType::UserMessage => ClientPayload::UserMessage(UserMessagePayload {
            text: field(payload, "text", "text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            attachments: value_field(payload, "attachments", "attachments"),
            metadata: value_field(payload, "metadata", "metadata"),
        }),
        ClientEventType::ToolApproval => ClientPayload::ToolApproval(ToolApprovalPayload {
            approval_id: ApprovalId::from_raw(string_field(payload, "approval_id", "approvalId").unwrap_or_default()),
            decision: Decision::parse_lenient(field(payload, "decision", "decision").and_then(Value::as_str)),
            message: string_field(payload, "message", "message"),
        }),
        ClientEventType::Heartbeat => ClientPayload::Heartbeat(HeartbeatPayload {
            client_time: field(payload, "client_time", "clientTime")
                .and_then(Value::as_f64)
                .unwrap_or_else(now_ts),
        }),
        ClientEventType::DetachSession => ClientPayload::DetachSession(ReasonPayload {
            reason: string_field(payload, "reason", "reason"),
        }),
        ClientEventType::DeleteSession => ClientPayload::DeleteSession(ReasonPayload {
            reason: string_field(payload, "reason", "reason"),
        }),
    }
}

/// Parse and validate one inbound text frame.
///
/// The session id comes from the envelope, or from the payload when the
/// envelope omits it. Missing optional fields get defaults: a fresh event id,
/// the current time, source `client` and the current protocol version.
pub fn parse_client_event(raw: &str) -> Result<ClientEnvelope, ProtocolError> {
    let value: Value = serde_json::from_str(raw)?;
    let Value::Object(msg) = value else {
        return Err(ProtocolError::NotAnObject);
    };

    let kind_raw = msg.get("type").and_then(Value::as_str).ok_or(ProtocolError::MissingType)?;
    let kind = ClientEventType::parse(kind_raw).ok_or_else(|| ProtocolError::UnknownType(kind_raw.to_string()))?;

    let empty = Map::new();
    let payload = match msg.get("payload") {
        Some(Value::Object(map)) => map,
        _ => &empty,
    };

    let session_id = string_field(&msg, "session_id", "sessionId")
        .or_else(|| string_field(payload, "session_id", "sessionId"))
        .map(SessionId::from_raw)
        .ok_or(ProtocolError::MissingSessionId)?;

    Ok(ClientEnvelope {
        event_id: string_field(&msg, "event_id", "eventId").unwrap_or_else(|| EventId::new().to_string()),
        session_id,
        ts: field(&msg, "ts", "ts").and_then(Value::as_f64).unwrap_or_else(now_ts),
        source: string_field(&msg, "source", "source").unwrap_or_else(|| "client".to_string()),
        agent_id: string_field(&msg, "agent_id", "agentId").map(AgentId::from_raw),
        trace_id: string_field(&msg, "trace_id", "traceId"),
        version: string_field(&msg, "version", "version").unwrap_or_else(|| PROTOCOL_VERSION.to_string()),
        payload: parse_payload(kind, payload),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEnvelope {
    pub event_id: EventId,
    pub session_id: SessionId,
    #[serde(rename = "type")]
    pub event_type: ServerEventType,
    pub ts: f64,
    pub source: Source,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub version: String,
}

impl ServiceEnvelope {
    pub fn new(session_id: SessionId, event_type: ServerEventType, source: Source, payload: Value) -> Self {
        Self {
            event_id: EventId::new(),
            session_id,
            event_type,
            ts: now_ts(),
            source,
            payload,
            trace_id: None,
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn with_trace(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }

    /// Lifecycle notice: `state{phase, progress?, avatar_url?}`.
    pub fn state(session_id: SessionId, state: StatePayload) -> Self {
        Self::new(session_id, ServerEventType::State, Source::System, to_payload(&state))
    }

    /// Liveness echo.
    pub fn heartbeat(session_id: SessionId) -> Self {
        Self::new(
            session_id,
            ServerEventType::Heartbeat,
            Source::System,
            to_payload(&StatePayload::new(SessionPhaseName::Heartbeat)),
        )
    }

    /// Error raised by the orchestrator itself rather than an agent.
    pub fn error(session_id: SessionId, code: &str, message: impl Into<String>) -> Self {
        Self::new(
            session_id,
            ServerEventType::Error,
            Source::System,
            serde_json::json!({
                "code": code,
                "message": message.into(),
                "recoverable": false,
            }),
        )
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Phase names a `state` envelope can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhaseName {
    Initialized,
    Attached,
    Detached,
    Deleted,
    Heartbeat,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatePayload {
    pub phase: SessionPhaseName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl StatePayload {
    pub fn new(phase: SessionPhaseName) -> Self {
        Self {
            phase,
            progress: None,
            avatar_url: None,
        }
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_avatar(mut self, avatar_url: Option<String>) -> Self {
        self.avatar_url = avatar_url;
        self
    }
}

/// Serialize a payload struct; plain derived structs cannot fail here.
pub(crate) fn to_payload<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_user_message_with_defaults() {
        let env = parse_client_event(r#"{"type":"user_message","sessionId":"s1","payload":{"text":"hi"}}"#).unwrap();
        assert_eq!(env.session_id.as_str(), "s1");
        assert_eq!(env.source, "client");
        assert_eq!(env.version, PROTOCOL_VERSION);
        assert!(env.event_id.starts_with("evt_"));
        assert!(env.ts > 0.0);
        assert_eq!(
            env.payload,
            ClientPayload::UserMessage(UserMessagePayload {
                text: "hi".into(),
                attachments: None,
                metadata: None,
            })
        );
    }

    #[test]
    fn session_id_falls_back_to_payload() {
        let env = parse_client_event(r#"{"type":"heartbeat","payload":{"session_id":"s2","client_time":12.5}}"#).unwrap();
        assert_eq!(env.session_id.as_str(), "s2");
        assert_eq!(env.payload, ClientPayload::Heartbeat(HeartbeatPayload { client_time: 12.5 }));
    }

    #[test]
    fn snake_case_envelope_keys_are_accepted() {
        let env = parse_client_event(
            r#"{"type":"init_session","session_id":"s3","trace_id":"t1","payload":{"agent_id":"agent_x","user_id":"u1","plugin_config":{"a":1}}}"#,
        )
        .unwrap();
        assert_eq!(env.trace_id.as_deref(), Some("t1"));
        let ClientPayload::InitSession(init) = env.payload else { panic!("expected init_session") };
        assert_eq!(init.agent_id, Some(AgentId::from_raw("agent_x")));
        assert_eq!(init.user_id.as_deref(), Some("u1"));
        assert_eq!(init.plugin_config, Some(json!({"a": 1})));
    }

    #[test]
    fn approval_decision_defaults_to_rejected() {
        let env =
            parse_client_event(r#"{"type":"tool_approval","sessionId":"s4","payload":{"approvalId":"ap-1"}}"#).unwrap();
        let ClientPayload::ToolApproval(approval) = env.payload else { panic!("expected tool_approval") };
        assert_eq!(approval.approval_id.as_str(), "ap-1");
        assert_eq!(approval.decision, Decision::Rejected);

        let env = parse_client_event(
            r#"{"type":"tool_approval","sessionId":"s4","payload":{"approvalId":"ap-2","decision":"maybe"}}"#,
        )
        .unwrap();
        let ClientPayload::ToolApproval(approval) = env.payload else { panic!("expected tool_approval") };
        assert_eq!(approval.decision, Decision::Rejected);
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(matches!(parse_client_event("not json"), Err(ProtocolError::InvalidJson(_))));
        assert!(matches!(parse_client_event("[1,2]"), Err(ProtocolError::NotAnObject)));
        assert!(matches!(parse_client_event(r#"{"sessionId":"s"}"#), Err(ProtocolError::MissingType)));
        assert!(matches!(
            parse_client_event(r#"{"type":"reboot","sessionId":"s"}"#),
            Err(ProtocolError::UnknownType(t)) if t == "reboot"
        ));
        assert!(matches!(
            parse_client_event(r#"{"type":"user_message","payload":{"text":"x"}}"#),
            Err(ProtocolError::MissingSessionId)
        ));
    }

    #[test]
    fn outbound_envelope_uses_camel_case_keys() {
        let env = ServiceEnvelope::state(
            SessionId::from_raw("s5"),
            StatePayload::new(SessionPhaseName::Initialized)
                .with_progress(0.0)
                .with_avatar(Some("https://a/b.png".into())),
        )
        .with_trace(Some("t9".into()));
        let value: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();

        assert_eq!(value["sessionId"], "s5");
        assert_eq!(value["type"], "state");
        assert_eq!(value["source"], "system");
        assert_eq!(value["traceId"], "t9");
        assert_eq!(value["version"], "1.0");
        assert!(value["eventId"].as_str().unwrap().starts_with("evt_"));
        assert_eq!(
            value["payload"],
            json!({"phase": "initialized", "progress": 0.0, "avatar_url": "https://a/b.png"})
        );
    }

    #[test]
    fn heartbeat_reply_carries_heartbeat_phase() {
        let env = ServiceEnvelope::heartbeat(SessionId::from_raw("s6"));
        assert_eq!(env.event_type, ServerEventType::Heartbeat);
        assert_eq!(env.payload, json!({"phase": "heartbeat"}));
    }
}
