use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ApprovalId;

/// A human decision on a pending tool call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approved,
    Rejected,
}

impl Decision {
    /// Anything other than "approved" counts as a rejection.
    pub fn parse_lenient(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(s) if s.eq_ignore_ascii_case("approved") => Self::Approved,
            _ => Self::Rejected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events produced while an agent handles one request.
/// These travel through an `EventPipe` and are translated into wire envelopes
/// by the server; they carry no session or routing information themselves.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    TextDelta {
        text: String,
    },

    ThinkDelta {
        text: String,
    },

    ToolCall {
        name: String,
        arguments: Value,
    },

    ToolResult {
        name: String,
        success: bool,
        result: Value,
    },

    ApprovalRequired {
        approval_id: ApprovalId,
        name: String,
        arguments: Value,
        message: String,
        safety_assessment: Value,
    },

    ApprovalDecision {
        approval_id: ApprovalId,
        decision: Decision,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    Usage {
        prompt_tokens: u64,
        completion_tokens: u64,
        cost: f64,
    },

    Final {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        structured: Option<Value>,
    },

    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        message: String,
        #[serde(default)]
        recoverable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<Value>,
    },
}

impl AgentEvent {
    /// Event type string, also used as the event-bus topic suffix.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TextDelta { .. } => "text_delta",
            Self::ThinkDelta { .. } => "think_delta",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::ApprovalRequired { .. } => "approval_required",
            Self::ApprovalDecision { .. } => "approval_decision",
            Self::Usage { .. } => "usage",
            Self::Final { .. } => "final",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::Final { .. })
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self::Final {
            text: text.into(),
            structured: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            code: None,
            message: message.into(),
            recoverable: false,
            detail: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_with_type_tag() {
        let event = AgentEvent::TextDelta { text: "hi".into() };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v, json!({"type": "text_delta", "text": "hi"}));
    }

    #[test]
    fn approval_required_shape() {
        let event = AgentEvent::ApprovalRequired {
            approval_id: ApprovalId::from_raw("a1"),
            name: "rm".into(),
            arguments: json!({"path": "/tmp/x"}),
            message: "dangerous".into(),
            safety_assessment: json!({"risk": "high"}),
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "approval_required");
        assert_eq!(v["approval_id"], "a1");
        assert_eq!(v["safety_assessment"]["risk"], "high");
    }

    #[test]
    fn event_type_matches_serde_tag() {
        let events = vec![
            AgentEvent::ThinkDelta { text: String::new() },
            AgentEvent::ToolCall { name: "t".into(), arguments: json!({}) },
            AgentEvent::ToolResult { name: "t".into(), success: true, result: json!(1) },
            AgentEvent::ApprovalDecision {
                approval_id: ApprovalId::from_raw("a"),
                decision: Decision::Approved,
                message: None,
            },
            AgentEvent::Usage { prompt_tokens: 1, completion_tokens: 2, cost: 0.0 },
            AgentEvent::final_text("done"),
            AgentEvent::error("boom"),
        ];
        for event in events {
            let v = serde_json::to_value(&event).unwrap();
            assert_eq!(v["type"], event.event_type());
        }
    }

    #[test]
    fn only_final_is_final() {
        assert!(AgentEvent::final_text("").is_final());
        assert!(!AgentEvent::error("x").is_final());
    }

    #[test]
    fn decision_parse_defaults_to_rejected() {
        assert_eq!(Decision::parse_lenient(Some("approved")), Decision::Approved);
        assert_eq!(Decision::parse_lenient(Some(" APPROVED ")), Decision::Approved);
        assert_eq!(Decision::parse_lenient(Some("rejected")), Decision::Rejected);
        assert_eq!(Decision::parse_lenient(Some("maybe")), Decision::Rejected);
        assert_eq!(Decision::parse_lenient(None), Decision::Rejected);
    }
}
