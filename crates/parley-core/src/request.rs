use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::SessionId;

/// A normalized user request handed to an agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub query: String,
    pub session_id: SessionId,
    #[serde(default)]
    pub extra_info: Map<String, Value>,
}

impl AgentRequest {
    pub fn new(query: impl Into<String>, session_id: SessionId) -> Self {
        Self {
            query: query.into(),
            session_id,
            extra_info: Map::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra_info.insert(key.into(), value);
        self
    }

    /// Memory owner: `extra_info.user_id` when present, else the session id.
    pub fn user_id(&self) -> String {
        self.extra_info
            .get("user_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| self.session_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn user_id_prefers_extra_info() {
        let req = AgentRequest::new("hi", SessionId::from_raw("s1")).with_extra("user_id", json!("u9"));
        assert_eq!(req.user_id(), "u9");
    }

    #[test]
    fn user_id_falls_back_to_session() {
        let req = AgentRequest::new("hi", SessionId::from_raw("s1"));
        assert_eq!(req.user_id(), "s1");
    }
}
