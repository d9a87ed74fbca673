use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use parley_core::ids::AgentId;
use parley_core::messages::ChatMessage;
use parley_core::profile::AgentProfile;
use parley_core::request::AgentRequest;

use crate::context::{AgentServices, ContextBuilder, ContextConfig};
use crate::error::EngineError;
use crate::pipe::EventPipe;
use crate::react::{self, ReactConfig, ReactExecutor, ReactOutcome, RoundEvent, RoundStream};

/// Something that can answer a request by writing events into a pipe.
///
/// Implementations must leave the pipe with a `final` event on success.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &AgentId;

    fn profile(&self) -> &AgentProfile;

    fn capabilities(&self) -> &[String] {
        &self.profile().capabilities
    }

    async fn process(&self, request: &AgentRequest, pipe: &EventPipe) -> Result<ReactOutcome, EngineError>;
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub context: ContextConfig,
    /// `None` waits until the pipe closes.
    pub approval_timeout: Option<Duration>,
    pub stream_text: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            context: ContextConfig::default(),
            approval_timeout: None,
            stream_text: true,
        }
    }
}

/// The one agent implementation. Its profile flags decide whether the tool
/// loop and the memory write-back take part.
pub struct ConfiguredAgent {
    profile: AgentProfile,
    services: AgentServices,
    builder: ContextBuilder,
    config: AgentConfig,
}

impl ConfiguredAgent {
    pub fn new(profile: AgentProfile, services: AgentServices, config: AgentConfig) -> Self {
        let builder = ContextBuilder::new(services.clone(), config.context.clone());
        Self {
            profile,
            services,
            builder,
            config,
        }
    }

    fn executor(&self) -> ReactExecutor {
        ReactExecutor::new(
            self.services.llm.clone(),
            self.services.tools.clone(),
            ReactConfig {
                max_rounds: self.profile.step_budget(),
                approval_timeout: self.config.approval_timeout,
                stream_text: self.config.stream_text,
            },
        )
    }

    /// Single streamed completion without tools.
    async fn answer_plain(&self, messages: &[ChatMessage], pipe: &EventPipe) -> Result<ReactOutcome, EngineError> {
        let chunks = match self.services.llm.chat_completion_stream(messages, &[]).await {
            Ok(chunks) => chunks,
            Err(e) => return Err(react::fail_stream(pipe, e)),
        };
        let mut stream = RoundStream::new(chunks, pipe, self.config.stream_text);
        let mut answer = String::new();
        while let Some(event) = stream.next().await {
            match event {
                Ok(RoundEvent::FinalContent(text)) => answer = text,
                Ok(RoundEvent::Usage(usage)) => {
                    pipe.usage(usage.prompt_tokens, usage.completion_tokens, 0.0);
                }
                Ok(RoundEvent::ToolCall(invocation)) => {
                    warn!(tool = %invocation.name, "tool call from a tool-less completion ignored");
                }
                Err(e) => return Err(react::fail_stream(pipe, e)),
            }
        }
        if !pipe.final_text(answer.as_str()) {
            return Ok(ReactOutcome::Abandoned);
        }
        Ok(ReactOutcome::Answer(answer))
    }

    fn persist_turn(&self, request: &AgentRequest, answer: &str) {
        let turn = [
            ChatMessage::user(request.query.as_str()),
            ChatMessage::assistant(react::strip_action_tags(answer)),
        ];
        if let Err(e) = self
            .services
            .store
            .append(&request.session_id, &self.profile.agent_id, &turn)
        {
            warn!(session_id = %request.session_id, error = %e, "failed to persist turn");
        }
    }

    async fn remember(&self, request: &AgentRequest, answer: &str) {
        let turn = [
            ChatMessage::user(request.query.as_str()),
            ChatMessage::assistant(answer),
        ];
        if let Err(e) = self.services.memory.add(&turn, &request.user_id()).await {
            warn!(session_id = %request.session_id, error = %e, "memory write failed");
        }
    }
}

#[async_trait]
impl Agent for ConfiguredAgent {
    fn id(&self) -> &AgentId {
        &self.profile.agent_id
    }

    fn profile(&self) -> &AgentProfile {
        &self.profile
    }

    #[instrument(skip_all, fields(agent_id = %self.profile.agent_id, session_id = %request.session_id, request_id = %pipe.request_id()))]
    async fn process(&self, request: &AgentRequest, pipe: &EventPipe) -> Result<ReactOutcome, EngineError> {
        let context = self.builder.build(&self.profile, request).await;
        let mut messages = context.messages;

        let outcome = if self.profile.supports_tools && !context.tools.is_empty() {
            self.executor().run(&mut messages, &context.tools, pipe).await?
        } else {
            self.answer_plain(&messages, pipe).await?
        };

        // A torn-down request may belong to a deleted session.
        if outcome == ReactOutcome::Abandoned || pipe.is_shut_down() {
            info!("request abandoned, nothing persisted");
            return Ok(outcome);
        }

        self.persist_turn(request, outcome.text());
        if self.profile.supports_memory {
            self.remember(request, outcome.text()).await;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parley_core::events::AgentEvent;
    use parley_core::ids::{RequestId, SessionId};
    use parley_core::provider::{NoopMemoryProvider, StaticPromptProvider};
    use parley_llm::mock::{MockReply, ScriptedLlm, ScriptedToolExecutor};
    use parley_store::{ContextStore, InMemoryContextStore};
    use serde_json::json;
    use futures::StreamExt;

    fn agent(
        profile: AgentProfile,
        llm: Arc<ScriptedLlm>,
        tools: Arc<ScriptedToolExecutor>,
        store: Arc<InMemoryContextStore>,
    ) -> ConfiguredAgent {
        ConfiguredAgent::new(
            profile,
            AgentServices {
                llm,
                tools,
                prompts: Arc::new(StaticPromptProvider),
                memory: Arc::new(NoopMemoryProvider),
                store,
            },
            AgentConfig::default(),
        )
    }

    #[tokio::test]
    async fn plain_agent_answers_and_persists_turn() {
        let llm = Arc::new(ScriptedLlm::new(vec![MockReply::text("[smile] Hi!")]));
        let tools = Arc::new(ScriptedToolExecutor::with_tool_names(&["clock"]));
        let store = Arc::new(InMemoryContextStore::new());
        let profile = AgentProfile::new(AgentId::from_raw("agent_p"), "Pat");
        let agent = agent(profile, llm.clone(), tools, store.clone());

        let session = SessionId::from_raw("sess_p");
        let pipe = EventPipe::new(RequestId::new());
        let outcome = agent
            .process(&AgentRequest::new("hi", session.clone()), &pipe)
            .await
            .unwrap();

        assert_eq!(outcome.text(), "[smile] Hi!");
        assert_eq!(llm.tool_counts(), vec![0]);
        assert_eq!(pipe.final_value().as_deref(), Some("[smile] Hi!"));

        let saved = store
            .snapshot(&session, &AgentId::from_raw("agent_p"), None)
            .unwrap()
            .unwrap();
        assert_eq!(saved.messages, vec![ChatMessage::user("hi"), ChatMessage::assistant("Hi!")]);
    }

    #[tokio::test]
    async fn tool_agent_runs_react_loop() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            MockReply::tool_call("call_1", "clock", json!({})),
            MockReply::text("Noon."),
        ]));
        let tools = Arc::new(ScriptedToolExecutor::with_tool_names(&["clock"]));
        let profile = AgentProfile {
            supports_tools: true,
            ..AgentProfile::new(AgentId::from_raw("agent_t"), "Tia")
        };
        let agent = agent(profile, llm.clone(), tools.clone(), Arc::new(InMemoryContextStore::new()));

        let pipe = EventPipe::new(RequestId::new());
        let outcome = agent
            .process(&AgentRequest::new("time?", SessionId::from_raw("sess_t")), &pipe)
            .await
            .unwrap();

        assert_eq!(outcome.text(), "Noon.");
        assert_eq!(tools.calls().len(), 1);
        assert_eq!(llm.tool_counts(), vec![1, 1]);

        let events: Vec<AgentEvent> = pipe.reader().collect().await;
        assert!(events.iter().any(|e| matches!(e, AgentEvent::ToolCall { .. })));
    }

    #[tokio::test]
    async fn history_carries_into_next_request() {
        let llm = Arc::new(ScriptedLlm::new(vec![MockReply::text("First."), MockReply::text("Second.")]));
        let tools = Arc::new(ScriptedToolExecutor::new(Vec::new()));
        let agent = agent(
            AgentProfile::new(AgentId::from_raw("agent_h"), "Hal"),
            llm.clone(),
            tools,
            Arc::new(InMemoryContextStore::new()),
        );
        let session = SessionId::from_raw("sess_h");

        for query in ["one", "two"] {
            let pipe = EventPipe::new(RequestId::new());
            agent
                .process(&AgentRequest::new(query, session.clone()), &pipe)
                .await
                .unwrap();
        }

        let second = &llm.transcripts()[1];
        let roles: Vec<&str> = second.iter().map(ChatMessage::role).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(second[2].content(), "First.");
    }

    #[tokio::test(start_paused = true)]
    async fn torn_down_request_persists_nothing() {
        let llm = Arc::new(ScriptedLlm::new(vec![MockReply::delayed(
            Duration::from_millis(300),
            MockReply::text("late answer"),
        )]));
        let tools = Arc::new(ScriptedToolExecutor::new(Vec::new()));
        let store = Arc::new(InMemoryContextStore::new());
        let agent = agent(
            AgentProfile::new(AgentId::from_raw("agent_d"), "Dee"),
            llm,
            tools,
            store.clone(),
        );
        let session = SessionId::from_raw("sess_d");
        let pipe = Arc::new(EventPipe::new(RequestId::new()));

        let closer = {
            let pipe = Arc::clone(&pipe);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                pipe.close(None);
            })
        };
        let outcome = agent
            .process(&AgentRequest::new("secret", session.clone()), &pipe)
            .await
            .unwrap();
        closer.await.unwrap();

        assert_eq!(outcome, ReactOutcome::Abandoned);
        assert_eq!(pipe.final_value().as_deref(), Some(""));
        assert!(store
            .snapshot(&session, &AgentId::from_raw("agent_d"), None)
            .unwrap()
            .is_none());
    }
}
