use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ApprovalId;

/// Tool schema as advertised to the model (chat-completions `tools` entry).
pub type ToolDefinition = Value;

/// A fully accumulated tool call ready to execute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Pending,
    Completed,
}

/// What the tool backend reports for a call, approval, or rejection.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolOutcome {
    pub success: bool,
    pub result: Value,
    pub error: Option<String>,
    pub message: Option<String>,
    pub status: Option<ToolStatus>,
    pub approval_id: Option<ApprovalId>,
    /// Approval metadata: `message`, `safety_assessment`.
    pub data: Value,
}

impl ToolOutcome {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn pending(approval_id: ApprovalId, message: impl Into<String>, safety_assessment: Value) -> Self {
        Self {
            success: true,
            status: Some(ToolStatus::Pending),
            approval_id: Some(approval_id),
            data: serde_json::json!({
                "message": message.into(),
                "safety_assessment": safety_assessment,
            }),
            ..Default::default()
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == Some(ToolStatus::Pending)
    }

    /// The useful part of a successful result: `result.data` when non-empty, else `result`.
    pub fn payload(&self) -> Value {
        match self.result.get("data") {
            Some(data) if !is_empty_value(data) => data.clone(),
            _ => self.result.clone(),
        }
    }

    /// Human-readable failure text.
    pub fn error_message(&self) -> String {
        self.error
            .as_deref()
            .filter(|e| !e.is_empty())
            .or(self.message.as_deref())
            .unwrap_or("")
            .to_string()
    }

    pub fn approval_message(&self) -> String {
        self.data
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    pub fn safety_assessment(&self) -> Value {
        self.data
            .get("safety_assessment")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()))
    }
}

fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool backend unavailable: {0}")]
    Unavailable(String),

    #[error("tool backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid tool response: {0}")]
    InvalidResponse(String),

    #[error("tool call timed out after {0:?}")]
    Timeout(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_hub_pending_response() {
        let outcome: ToolOutcome = serde_json::from_value(json!({
            "success": true,
            "status": "pending",
            "approval_id": "ap-7",
            "data": {"message": "needs review", "safety_assessment": {"level": "high"}}
        }))
        .unwrap();
        assert!(outcome.is_pending());
        assert_eq!(outcome.approval_id, Some(ApprovalId::from_raw("ap-7")));
        assert_eq!(outcome.approval_message(), "needs review");
        assert_eq!(outcome.safety_assessment()["level"], "high");
    }

    #[test]
    fn payload_prefers_nested_data() {
        let outcome = ToolOutcome::ok(json!({"data": "sunny", "raw": 1}));
        assert_eq!(outcome.payload(), json!("sunny"));

        let outcome = ToolOutcome::ok(json!({"data": "", "raw": 1}));
        assert_eq!(outcome.payload(), json!({"data": "", "raw": 1}));

        let outcome = ToolOutcome::ok(json!("plain"));
        assert_eq!(outcome.payload(), json!("plain"));
    }

    #[test]
    fn error_message_falls_back_to_message() {
        let mut outcome = ToolOutcome::failed("");
        outcome.message = Some("rejected by user".into());
        assert_eq!(outcome.error_message(), "rejected by user");
        assert_eq!(ToolOutcome::failed("boom").error_message(), "boom");
    }

    #[test]
    fn safety_assessment_defaults_to_empty_object() {
        assert_eq!(ToolOutcome::ok(json!(null)).safety_assessment(), json!({}));
    }
}
