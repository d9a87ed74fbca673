pub mod accumulator;
pub mod agent;
pub mod context;
pub mod error;
pub mod pipe;
pub mod react;
pub mod registry;

pub use accumulator::{CallState, ToolCallAccumulator};
pub use agent::{Agent, AgentConfig, ConfiguredAgent};
pub use context::{AgentServices, BuiltContext, ContextBuilder, ContextConfig};
pub use error::EngineError;
pub use pipe::{EventPipe, Resolution, REQUEST_CANCELLED};
pub use react::{ReactConfig, ReactExecutor, ReactOutcome, EXHAUSTED_FINAL_TEXT};
pub use registry::{AgentRegistry, CapabilityDispatcher, Dispatcher};
