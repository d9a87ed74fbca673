//! Collaborator contracts consumed by the engine.
//!
//! Each backing service sits behind a narrow `async_trait` so deployments plug in
//! real HTTP clients and tests plug in scripted fakes.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::errors::LlmError;
use crate::ids::{ApprovalId, SessionId};
use crate::messages::ChatMessage;
use crate::profile::AgentProfile;
use crate::stream::ChatChunk;
use crate::tools::{ToolDefinition, ToolError, ToolInvocation, ToolOutcome};

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, LlmError>> + Send>>;

/// Streaming chat-completion backend.
#[async_trait]
pub trait LlmStream: Send + Sync {
    async fn chat_completion_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChunkStream, LlmError>;

    /// Single non-streaming completion; returns the assistant content.
    async fn chat_completion(&self, messages: &[ChatMessage]) -> Result<String, LlmError>;
}

/// Tool backend with a human-approval side channel.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolError>;
    async fn call_tool(&self, call: &ToolInvocation) -> Result<ToolOutcome, ToolError>;
    async fn approve_tool(&self, approval_id: &ApprovalId) -> Result<ToolOutcome, ToolError>;
    async fn reject_tool(&self, approval_id: &ApprovalId) -> Result<ToolOutcome, ToolError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Backend(String),
}

#[async_trait]
pub trait PromptProvider: Send + Sync {
    async fn build_prompt(
        &self,
        session_id: &SessionId,
        profile: &AgentProfile,
    ) -> Result<String, ProviderError>;
}

#[async_trait]
pub trait MemoryProvider: Send + Sync {
    async fn search(&self, query: &str, user_id: &str, limit: usize) -> Result<Vec<String>, ProviderError>;
    async fn add(&self, messages: &[ChatMessage], user_id: &str) -> Result<(), ProviderError>;
}

/// Renders the profile's own system prompt, substituting `{agent_name}`.
#[derive(Clone, Debug, Default)]
pub struct StaticPromptProvider;

#[async_trait]
impl PromptProvider for StaticPromptProvider {
    async fn build_prompt(
        &self,
        _session_id: &SessionId,
        profile: &AgentProfile,
    ) -> Result<String, ProviderError> {
        Ok(profile.system_prompt.replace("{agent_name}", &profile.name))
    }
}

/// Memory backend that remembers nothing.
#[derive(Clone, Debug, Default)]
pub struct NoopMemoryProvider;

#[async_trait]
impl MemoryProvider for NoopMemoryProvider {
    async fn search(&self, _query: &str, _user_id: &str, _limit: usize) -> Result<Vec<String>, ProviderError> {
        Ok(Vec::new())
    }

    async fn add(&self, _messages: &[ChatMessage], _user_id: &str) -> Result<(), ProviderError> {
        Ok(())
    }
}
