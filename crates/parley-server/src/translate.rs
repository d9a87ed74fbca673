//! Internal `AgentEvent` to outbound envelope.

use serde_json::Value;

use parley_core::events::AgentEvent;
use parley_core::ids::{RequestId, SessionId};

use crate::protocol::{ServerEventType, ServiceEnvelope, Source};

pub fn event_type(event: &AgentEvent) -> ServerEventType {
    match event {
        AgentEvent::TextDelta { .. } => ServerEventType::TextDelta,
        AgentEvent::ThinkDelta { .. } => ServerEventType::ThinkDelta,
        AgentEvent::ToolCall { .. } => ServerEventType::ToolCall,
        AgentEvent::ToolResult { .. } => ServerEventType::ToolResult,
        AgentEvent::ApprovalRequired { .. } => ServerEventType::ApprovalRequired,
        AgentEvent::ApprovalDecision { .. } => ServerEventType::ApprovalDecision,
        AgentEvent::Usage { .. } => ServerEventType::Usage,
        AgentEvent::Final { .. } => ServerEventType::Final,
        AgentEvent::Error { .. } => ServerEventType::Error,
    }
}

/// Event fields without the internal `type` tag.
pub fn event_payload(event: &AgentEvent) -> Value {
    match serde_json::to_value(event) {
        Ok(Value::Object(mut map)) => {
            map.remove("type");
            Value::Object(map)
        }
        Ok(other) => other,
        Err(e) => serde_json::json!({
            "message": format!("untranslatable {} event: {e}", event.event_type()),
        }),
    }
}

/// Wrap one pipe event for the client. The request id travels as the trace id.
pub fn to_envelope(session_id: &SessionId, request_id: &RequestId, event: &AgentEvent) -> ServiceEnvelope {
    ServiceEnvelope::new(session_id.clone(), event_type(event), Source::Agent, event_payload(event))
        .with_trace(Some(request_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::events::Decision;
    use parley_core::ids::ApprovalId;
    use serde_json::json;

    fn translate(event: AgentEvent) -> ServiceEnvelope {
        to_envelope(&SessionId::from_raw("s1"), &RequestId::from_raw("req_1"), &event)
    }

    #[test]
    fn every_event_kind_maps_to_its_wire_type() {
        let cases = vec![
            (AgentEvent::TextDelta { text: "a".into() }, "text_delta"),
            (AgentEvent::ThinkDelta { text: "b".into() }, "think_delta"),
            (
                AgentEvent::ToolCall {
                    name: "clock".into(),
                    arguments: json!({}),
                },
                "tool_call",
            ),
            (
                AgentEvent::ToolResult {
                    name: "clock".into(),
                    success: true,
                    result: json!("noon"),
                },
                "tool_result",
            ),
            (
                AgentEvent::ApprovalRequired {
                    approval_id: ApprovalId::from_raw("ap"),
                    name: "rm".into(),
                    arguments: json!({}),
                    message: "sure?".into(),
                    safety_assessment: json!({}),
                },
                "approval_required",
            ),
            (
                AgentEvent::ApprovalDecision {
                    approval_id: ApprovalId::from_raw("ap"),
                    decision: Decision::Approved,
                    message: None,
                },
                "approval_decision",
            ),
            (
                AgentEvent::Usage {
                    prompt_tokens: 1,
                    completion_tokens: 2,
                    cost: 0.0,
                },
                "usage",
            ),
            (AgentEvent::final_text("done"), "final"),
            (AgentEvent::error("boom"), "error"),
        ];
        for (event, expected) in cases {
            assert_eq!(translate(event).event_type.as_str(), expected);
        }
    }

    #[test]
    fn payload_drops_internal_tag() {
        let env = translate(AgentEvent::ToolResult {
            name: "clock".into(),
            success: false,
            result: json!({"error": "down"}),
        });
        assert_eq!(env.source, Source::Agent);
        assert_eq!(env.trace_id.as_deref(), Some("req_1"));
        assert_eq!(
            env.payload,
            json!({"name": "clock", "success": false, "result": {"error": "down"}})
        );
    }

    #[test]
    fn final_payload_keeps_structured_part() {
        let env = translate(AgentEvent::Final {
            text: "Exceeded".into(),
            structured: Some(json!({"error": "x"})),
        });
        assert_eq!(env.payload, json!({"text": "Exceeded", "structured": {"error": "x"}}));
    }
}
