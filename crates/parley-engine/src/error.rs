use parley_core::errors::LlmError;
use parley_core::tools::ToolError;
use parley_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("llm error: {0}")]
    Llm(#[from] LlmError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("no agents registered")]
    NoAgentsRegistered,

    #[error("event pipe already closed")]
    PipeClosed,

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Short code used for the wire `error.code`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Llm(e) => e.error_kind(),
            Self::Store(_) => "store_error",
            Self::Tool(_) => "tool_error",
            Self::AgentNotFound(_) => "agent_not_found",
            Self::NoAgentsRegistered => "no_agents",
            Self::PipeClosed => "pipe_closed",
            Self::Internal(_) => "internal_error",
        }
    }
}
