use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, instrument};

use parley_core::ids::AgentId;
use parley_core::profile::AgentProfile;
use parley_core::request::AgentRequest;

use crate::agent::Agent;
use crate::error::EngineError;
use crate::pipe::EventPipe;
use crate::react::ReactOutcome;

/// Picks an agent for a request that did not name one.
pub trait Dispatcher: Send + Sync {
    fn select(&self, request: &AgentRequest, agents: &[Arc<dyn Agent>]) -> Option<Arc<dyn Agent>>;
}

const SPEED_WORDS: &[&str] = &["快速", "fast", "quick"];

/// Capability name plus the query words that suggest it.
const CAPABILITY_WORDS: &[(&str, &[&str])] = &[
    ("tool_usage", &["工具", "调用", "执行", "tool", "call", "run"]),
    ("memory", &["记忆", "历史", "之前", "remember", "history", "before"]),
];

/// Keyword scoring over declared capabilities. Highest score wins, ties go
/// to the earliest registration, and all-zero falls back to the first agent.
#[derive(Clone, Debug, Default)]
pub struct CapabilityDispatcher;

impl CapabilityDispatcher {
    pub fn score(profile: &AgentProfile, query: &str) -> u32 {
        let query = query.to_lowercase();
        let mut score = 0;
        if profile.agent_type == "fast" && SPEED_WORDS.iter().any(|w| query.contains(w)) {
            score += 2;
        }
        for (capability, words) in CAPABILITY_WORDS {
            if profile.has_capability(capability) && words.iter().any(|w| query.contains(w)) {
                score += 1;
            }
        }
        score
    }
}

impl Dispatcher for CapabilityDispatcher {
    fn select(&self, request: &AgentRequest, agents: &[Arc<dyn Agent>]) -> Option<Arc<dyn Agent>> {
        let mut best: Option<(&Arc<dyn Agent>, u32)> = None;
        for agent in agents {
            let score = Self::score(agent.profile(), &request.query);
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((agent, score));
            }
        }
        best.map(|(agent, score)| {
            debug!(agent_id = %agent.id(), score, "dispatcher selected agent");
            Arc::clone(agent)
        })
    }
}

/// Insertion-ordered agent table plus the dispatcher used when no id is given.
pub struct AgentRegistry {
    agents: RwLock<Vec<Arc<dyn Agent>>>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::with_dispatcher(Arc::new(CapabilityDispatcher))
    }

    pub fn with_dispatcher(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            agents: RwLock::new(Vec::new()),
            dispatcher,
        }
    }

    /// Add an agent, or replace the one with the same id in place.
    pub fn register_agent(&self, agent: Arc<dyn Agent>) {
        let mut agents = self.agents.write();
        match agents.iter_mut().find(|a| a.id() == agent.id()) {
            Some(existing) => {
                debug!(agent_id = %agent.id(), "agent replaced");
                *existing = agent;
            }
            None => {
                info!(agent_id = %agent.id(), agent_type = %agent.profile().agent_type, "agent registered");
                agents.push(agent);
            }
        }
    }

    pub fn get_agent(&self, agent_id: &AgentId) -> Option<Arc<dyn Agent>> {
        self.agents.read().iter().find(|a| a.id() == agent_id).cloned()
    }

    pub fn contains(&self, agent_id: &AgentId) -> bool {
        self.agents.read().iter().any(|a| a.id() == agent_id)
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.agents.read().iter().map(|a| a.id().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Route to `agent_id` when given, otherwise let the dispatcher choose.
    #[instrument(skip_all, fields(session_id = %request.session_id, agent_id = ?agent_id))]
    pub async fn process(
        &self,
        request: &AgentRequest,
        pipe: &EventPipe,
        agent_id: Option<&AgentId>,
    ) -> Result<ReactOutcome, EngineError> {
        let agent = match agent_id {
            Some(id) => self
                .get_agent(id)
                .ok_or_else(|| EngineError::AgentNotFound(id.to_string()))?,
            None => {
                let agents = self.agents.read().clone();
                if agents.is_empty() {
                    return Err(EngineError::NoAgentsRegistered);
                }
                self.dispatcher
                    .select(request, &agents)
                    .ok_or(EngineError::NoAgentsRegistered)?
            }
        };
        agent.process(request, pipe).await
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_core::ids::{RequestId, SessionId};

    struct EchoAgent {
        profile: AgentProfile,
    }

    impl EchoAgent {
        fn new(id: &str, agent_type: &str, capabilities: &[&str]) -> Arc<dyn Agent> {
            Arc::new(Self {
                profile: AgentProfile {
                    agent_type: agent_type.into(),
                    capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
                    ..AgentProfile::new(AgentId::from_raw(id), id)
                },
            })
        }
    }

    #[async_trait]
    impl Agent for EchoAgent {
        fn id(&self) -> &AgentId {
            &self.profile.agent_id
        }

        fn profile(&self) -> &AgentProfile {
            &self.profile
        }

        async fn process(&self, _request: &AgentRequest, pipe: &EventPipe) -> Result<ReactOutcome, EngineError> {
            let text = self.profile.agent_id.to_string();
            pipe.final_text(text.as_str());
            Ok(ReactOutcome::Answer(text))
        }
    }

    fn request(query: &str) -> AgentRequest {
        AgentRequest::new(query, SessionId::from_raw("sess_r"))
    }

    fn pick(registry: &AgentRegistry, query: &str) -> String {
        let agents: Vec<Arc<dyn Agent>> = registry
            .agent_ids()
            .iter()
            .filter_map(|id| registry.get_agent(id))
            .collect();
        CapabilityDispatcher
            .select(&request(query), &agents)
            .map(|a| a.id().to_string())
            .unwrap_or_default()
    }

    fn sample_registry() -> AgentRegistry {
        let registry = AgentRegistry::new();
        registry.register_agent(EchoAgent::new("basic", "basic", &[]));
        registry.register_agent(EchoAgent::new("toolish", "basic", &["tool_usage"]));
        registry.register_agent(EchoAgent::new("rememberer", "basic", &["memory"]));
        registry.register_agent(EchoAgent::new("speedy", "fast", &[]));
        registry
    }

    #[test]
    fn zero_scores_fall_back_to_first_registered() {
        assert_eq!(pick(&sample_registry(), "hello there"), "basic");
    }

    #[test]
    fn capability_keywords_route_requests() {
        let registry = sample_registry();
        assert_eq!(pick(&registry, "please run the build tool"), "toolish");
        assert_eq!(pick(&registry, "what did we discuss before?"), "rememberer");
        assert_eq!(pick(&registry, "请帮我调用工具"), "toolish");
        assert_eq!(pick(&registry, "我们之前聊过什么"), "rememberer");
    }

    #[test]
    fn fast_agent_wins_on_speed_words() {
        assert_eq!(pick(&sample_registry(), "give me a QUICK answer"), "speedy");
        assert_eq!(pick(&sample_registry(), "快速回答"), "speedy");
    }

    #[test]
    fn ties_keep_registration_order() {
        let registry = AgentRegistry::new();
        registry.register_agent(EchoAgent::new("first", "basic", &["tool_usage"]));
        registry.register_agent(EchoAgent::new("second", "basic", &["tool_usage"]));
        assert_eq!(pick(&registry, "call the api"), "first");
    }

    #[test]
    fn register_replaces_same_id_in_place() {
        let registry = sample_registry();
        registry.register_agent(EchoAgent::new("basic", "fast", &[]));
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.agent_ids()[0].as_str(), "basic");
        assert_eq!(
            registry.get_agent(&AgentId::from_raw("basic")).unwrap().profile().agent_type,
            "fast"
        );
    }

    #[tokio::test]
    async fn process_routes_by_id_or_dispatch() {
        let registry = sample_registry();

        let pipe = EventPipe::new(RequestId::new());
        let outcome = registry
            .process(&request("hello"), &pipe, Some(&AgentId::from_raw("speedy")))
            .await
            .unwrap();
        assert_eq!(outcome.text(), "speedy");

        let pipe = EventPipe::new(RequestId::new());
        let outcome = registry.process(&request("run it"), &pipe, None).await.unwrap();
        assert_eq!(outcome.text(), "toolish");
    }

    #[tokio::test]
    async fn unknown_id_and_empty_registry_are_errors() {
        let registry = sample_registry();
        let pipe = EventPipe::new(RequestId::new());
        let err = registry
            .process(&request("hi"), &pipe, Some(&AgentId::from_raw("ghost")))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AgentNotFound(id) if id == "ghost"));

        let empty = AgentRegistry::new();
        let err = empty.process(&request("hi"), &pipe, None).await.unwrap_err();
        assert!(matches!(err, EngineError::NoAgentsRegistered));
    }
}
