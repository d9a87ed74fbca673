pub mod mock;
pub mod openai;
pub mod sse;
pub mod tool_hub;

pub use mock::{MockReply, ScriptedLlm, ScriptedToolExecutor};
pub use openai::{OpenAiClient, OpenAiConfig};
pub use tool_hub::{ToolHubClient, ToolHubConfig};
