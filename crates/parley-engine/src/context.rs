//! Per-request context assembly.
//!
//! Prompt, memory, tool list and history are fetched concurrently under one
//! shared deadline. A source that fails or is still running at the deadline
//! contributes nothing; sources that already answered are kept.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use parley_core::messages::ChatMessage;
use parley_core::profile::AgentProfile;
use parley_core::provider::{LlmStream, MemoryProvider, PromptProvider, ToolExecutor};
use parley_core::request::AgentRequest;
use parley_core::tools::ToolDefinition;
use parley_store::ContextStore;

pub const DEFAULT_FAN_OUT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MEMORY_LIMIT: usize = 5;

/// Backing services shared by every agent, built once at startup.
#[derive(Clone)]
pub struct AgentServices {
    pub llm: Arc<dyn LlmStream>,
    pub tools: Arc<dyn ToolExecutor>,
    pub prompts: Arc<dyn PromptProvider>,
    pub memory: Arc<dyn MemoryProvider>,
    pub store: Arc<dyn ContextStore>,
}

#[derive(Clone, Debug)]
pub struct ContextConfig {
    pub fan_out_timeout: Duration,
    pub memory_limit: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            fan_out_timeout: DEFAULT_FAN_OUT_TIMEOUT,
            memory_limit: DEFAULT_MEMORY_LIMIT,
        }
    }
}

/// Everything an agent needs to start streaming.
#[derive(Clone, Debug, Default)]
pub struct BuiltContext {
    /// `[system] + history + [user]`.
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub memory: Vec<String>,
    pub history_len: usize,
}

pub struct ContextBuilder {
    services: AgentServices,
    config: ContextConfig,
}

impl ContextBuilder {
    pub fn new(services: AgentServices, config: ContextConfig) -> Self {
        Self { services, config }
    }

    #[instrument(skip_all, fields(session_id = %request.session_id, agent_id = %profile.agent_id))]
    pub async fn build(&self, profile: &AgentProfile, request: &AgentRequest) -> BuiltContext {
        let deadline = Instant::now() + self.config.fan_out_timeout;
        let user_id = request.user_id();

        let prompt = bounded(
            deadline,
            "prompt",
            self.services.prompts.build_prompt(&request.session_id, profile),
        );
        let memory = async {
            if !profile.supports_memory {
                return None;
            }
            bounded(
                deadline,
                "memory",
                self.services
                    .memory
                    .search(&request.query, &user_id, self.config.memory_limit),
            )
            .await
        };
        let tools = async {
            if !profile.supports_tools {
                return None;
            }
            bounded(deadline, "tools", self.services.tools.list_tools()).await
        };
        let history = bounded(deadline, "history", async {
            self.services
                .store
                .snapshot(&request.session_id, &profile.agent_id, None)
        });

        let (prompt, memory, tools, history) = tokio::join!(prompt, memory, tools, history);

        let prompt = prompt.unwrap_or_default();
        let memory = memory.unwrap_or_default();
        let tools = tools.unwrap_or_default();
        let history = history.flatten().map(|v| v.messages).unwrap_or_default();

        debug!(
            memory = memory.len(),
            tools = tools.len(),
            history = history.len(),
            "context assembled"
        );

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(with_memory(prompt, &memory)));
        let history_len = history.len();
        messages.extend(history);
        messages.push(ChatMessage::user(request.query.as_str()));

        BuiltContext {
            messages,
            tools,
            memory,
            history_len,
        }
    }
}

fn with_memory(prompt: String, memory: &[String]) -> String {
    if memory.is_empty() {
        return prompt;
    }
    format!("{prompt}\n\n[Relevant Memory]: {}\n\n", memory.join("\n"))
}

async fn bounded<T, E: Display>(
    deadline: Instant,
    source: &'static str,
    fut: impl Future<Output = Result<T, E>>,
) -> Option<T> {
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!(source, error = %e, "context source failed");
            None
        }
        Err(_) => {
            warn!(source, "context source missed the deadline");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_core::ids::{AgentId, SessionId};
    use parley_core::provider::{NoopMemoryProvider, ProviderError, StaticPromptProvider};
    use parley_llm::mock::{ScriptedLlm, ScriptedToolExecutor};
    use parley_store::InMemoryContextStore;

    struct FixedMemory(Vec<String>);

    #[async_trait]
    impl MemoryProvider for FixedMemory {
        async fn search(&self, _query: &str, _user_id: &str, limit: usize) -> Result<Vec<String>, ProviderError> {
            Ok(self.0.iter().take(limit).cloned().collect())
        }
        async fn add(&self, _messages: &[ChatMessage], _user_id: &str) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    struct SlowMemory;

    #[async_trait]
    impl MemoryProvider for SlowMemory {
        async fn search(&self, _query: &str, _user_id: &str, _limit: usize) -> Result<Vec<String>, ProviderError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec!["too late".into()])
        }
        async fn add(&self, _messages: &[ChatMessage], _user_id: &str) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    struct BrokenPrompt;

    #[async_trait]
    impl PromptProvider for BrokenPrompt {
        async fn build_prompt(&self, _session_id: &SessionId, _profile: &AgentProfile) -> Result<String, ProviderError> {
            Err(ProviderError::Unavailable("prompt service down".into()))
        }
    }

    fn services(memory: Arc<dyn MemoryProvider>, store: Arc<InMemoryContextStore>) -> AgentServices {
        AgentServices {
            llm: Arc::new(ScriptedLlm::new(Vec::new())),
            tools: Arc::new(ScriptedToolExecutor::with_tool_names(&["clock", "search"])),
            prompts: Arc::new(StaticPromptProvider),
            memory,
            store,
        }
    }

    fn profile(tools: bool, memory: bool) -> AgentProfile {
        AgentProfile {
            supports_tools: tools,
            supports_memory: memory,
            ..AgentProfile::new(AgentId::from_raw("agent_a"), "Ada")
        }
    }

    #[tokio::test]
    async fn transcript_is_system_history_then_user() {
        let store = Arc::new(InMemoryContextStore::new());
        let session = SessionId::from_raw("sess_1");
        store
            .append(
                &session,
                &AgentId::from_raw("agent_a"),
                &[ChatMessage::user("earlier"), ChatMessage::assistant("reply")],
            )
            .unwrap();
        let builder = ContextBuilder::new(services(Arc::new(NoopMemoryProvider), store), ContextConfig::default());

        let ctx = builder
            .build(&profile(false, false), &AgentRequest::new("now", session))
            .await;

        assert_eq!(ctx.history_len, 2);
        assert_eq!(
            ctx.messages,
            vec![
                ChatMessage::system("You are Ada, a helpful assistant."),
                ChatMessage::user("earlier"),
                ChatMessage::assistant("reply"),
                ChatMessage::user("now"),
            ]
        );
        assert!(ctx.tools.is_empty());
    }

    #[tokio::test]
    async fn capabilities_gate_tools_and_memory() {
        let memory = Arc::new(FixedMemory(vec!["likes tea".into(), "lives in Oslo".into()]));
        let builder = ContextBuilder::new(
            services(memory, Arc::new(InMemoryContextStore::new())),
            ContextConfig::default(),
        );
        let request = AgentRequest::new("hello", SessionId::from_raw("sess_2"));

        let bare = builder.build(&profile(false, false), &request).await;
        assert!(bare.tools.is_empty());
        assert!(bare.memory.is_empty());

        let full = builder.build(&profile(true, true), &request).await;
        assert_eq!(full.tools.len(), 2);
        assert_eq!(
            full.messages[0].content(),
            "You are Ada, a helpful assistant.\n\n[Relevant Memory]: likes tea\nlives in Oslo\n\n"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_source_is_dropped_at_deadline() {
        let builder = ContextBuilder::new(
            services(Arc::new(SlowMemory), Arc::new(InMemoryContextStore::new())),
            ContextConfig {
                fan_out_timeout: Duration::from_secs(5),
                ..Default::default()
            },
        );

        let started = Instant::now();
        let ctx = builder
            .build(&profile(true, true), &AgentRequest::new("q", SessionId::from_raw("sess_3")))
            .await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(ctx.memory.is_empty());
        assert_eq!(ctx.tools.len(), 2);
    }

    #[tokio::test]
    async fn failed_prompt_leaves_empty_system_message() {
        let mut svc = services(Arc::new(NoopMemoryProvider), Arc::new(InMemoryContextStore::new()));
        svc.prompts = Arc::new(BrokenPrompt);
        let builder = ContextBuilder::new(svc, ContextConfig::default());

        let ctx = builder
            .build(&profile(false, false), &AgentRequest::new("q", SessionId::from_raw("sess_4")))
            .await;
        assert_eq!(ctx.messages.len(), 2);
        assert_eq!(ctx.messages[0], ChatMessage::system(""));
    }
}
