use serde::{Deserialize, Serialize};

use crate::ids::AgentId;

pub const DEFAULT_MAX_TOOL_CALLS: u32 = 5;

/// Declarative description of an agent: persona, capabilities and step limits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentProfile {
    pub agent_id: AgentId,
    pub name: String,
    /// Free-form agent kind, e.g. "basic" or "fast". Used by dispatch scoring.
    pub agent_type: String,
    pub description: String,
    pub avatar_url: Option<String>,
    pub system_prompt: String,
    pub supports_tools: bool,
    pub supports_memory: bool,
    pub max_tool_calls: u32,
    pub capabilities: Vec<String>,
}

impl Default for AgentProfile {
    fn default() -> Self {
        Self {
            agent_id: AgentId::new(),
            name: "assistant".to_string(),
            agent_type: "basic".to_string(),
            description: String::new(),
            avatar_url: None,
            system_prompt: "You are {agent_name}, a helpful assistant.".to_string(),
            supports_tools: false,
            supports_memory: false,
            max_tool_calls: DEFAULT_MAX_TOOL_CALLS,
            capabilities: Vec::new(),
        }
    }
}

impl AgentProfile {
    pub fn new(agent_id: AgentId, name: impl Into<String>) -> Self {
        Self {
            agent_id,
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Step budget for the ReAct loop. A `max_tool_calls` of 0 still runs one round.
    pub fn step_budget(&self) -> u32 {
        self.max_tool_calls.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let profile: AgentProfile =
            serde_json::from_str(r#"{"agent_id":"agent_x","name":"Mika","supports_tools":true}"#).unwrap();
        assert_eq!(profile.agent_id.as_str(), "agent_x");
        assert!(profile.supports_tools);
        assert!(!profile.supports_memory);
        assert_eq!(profile.max_tool_calls, DEFAULT_MAX_TOOL_CALLS);
        assert_eq!(profile.agent_type, "basic");
    }

    #[test]
    fn step_budget_is_at_least_one() {
        let mut profile = AgentProfile::default();
        profile.max_tool_calls = 0;
        assert_eq!(profile.step_budget(), 1);
    }

    #[test]
    fn capability_lookup() {
        let mut profile = AgentProfile::default();
        profile.capabilities = vec!["memory".into()];
        assert!(profile.has_capability("memory"));
        assert!(!profile.has_capability("tool_usage"));
    }
}
