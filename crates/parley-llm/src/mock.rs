use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use serde_json::{json, Value};

use parley_core::errors::LlmError;
use parley_core::ids::ApprovalId;
use parley_core::messages::ChatMessage;
use parley_core::provider::{ChunkStream, LlmStream, ToolExecutor};
use parley_core::stream::{ChatChunk, ToolCallDelta};
use parley_core::tools::{ToolDefinition, ToolError, ToolInvocation, ToolOutcome};

/// Pre-programmed model behavior for deterministic tests without network calls.
#[derive(Clone, Debug)]
pub enum MockReply {
    /// Yield these chunks, then end the stream.
    Chunks(Vec<ChatChunk>),
    /// Yield these chunks, then a transport error.
    BrokenStream(Vec<ChatChunk>, LlmError),
    /// Fail the call itself.
    Error(LlmError),
    /// Wait, then behave like the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    /// Plain answer streamed as one content fragment per word.
    pub fn text(text: &str) -> Self {
        let mut chunks = vec![ChatChunk {
            role: Some("assistant".into()),
            ..Default::default()
        }];
        let mut rest = text;
        while !rest.is_empty() {
            let cut = rest
                .char_indices()
                .skip(1)
                .find(|(_, c)| c.is_whitespace())
                .map_or(rest.len(), |(i, _)| i);
            chunks.push(ChatChunk::text(&rest[..cut]));
            rest = &rest[cut..];
        }
        chunks.push(ChatChunk::done());
        Self::Chunks(chunks)
    }

    /// One tool call whose JSON arguments arrive split in two fragments.
    pub fn tool_call(id: &str, name: &str, arguments: Value) -> Self {
        let args = arguments.to_string();
        let mid = args.len() / 2;
        let mid = (mid..=args.len()).find(|i| args.is_char_boundary(*i)).unwrap_or(args.len());
        Self::Chunks(vec![
            ChatChunk::tool_fragment(ToolCallDelta::start(id, name, &args[..mid])),
            ChatChunk::tool_fragment(ToolCallDelta::part(id, &args[mid..])),
            ChatChunk::done(),
        ])
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock LLM that replays scripted replies in order and records every transcript it saw.
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<MockReply>>,
    fallback: Option<MockReply>,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
    seen_tools: Mutex<Vec<usize>>,
}

impl ScriptedLlm {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: None,
            seen: Mutex::new(Vec::new()),
            seen_tools: Mutex::new(Vec::new()),
        }
    }

    /// Answers every call with the same reply, forever.
    pub fn repeating(reply: MockReply) -> Self {
        let mut llm = Self::new(Vec::new());
        llm.fallback = Some(reply);
        llm
    }

    pub fn call_count(&self) -> usize {
        self.seen.lock().len()
    }

    /// Transcripts passed to each call, in call order.
    pub fn transcripts(&self) -> Vec<Vec<ChatMessage>> {
        self.seen.lock().clone()
    }

    /// Number of tool definitions offered on each streaming call.
    pub fn tool_counts(&self) -> Vec<usize> {
        self.seen_tools.lock().clone()
    }

    fn next_reply(&self, messages: &[ChatMessage]) -> Result<MockReply, LlmError> {
        self.seen.lock().push(messages.to_vec());
        let idx = self.seen.lock().len() - 1;
        self.replies
            .lock()
            .pop_front()
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| LlmError::InvalidRequest(format!("ScriptedLlm: no reply configured for call {idx}")))
    }
}

/// Resolve a reply, unrolling nested delays iteratively.
async fn resolve(mut reply: MockReply) -> Result<Vec<Result<ChatChunk, LlmError>>, LlmError> {
    loop {
        match reply {
            MockReply::Chunks(chunks) => return Ok(chunks.into_iter().map(Ok).collect()),
            MockReply::BrokenStream(chunks, error) => {
                let mut items: Vec<_> = chunks.into_iter().map(Ok).collect();
                items.push(Err(error));
                return Ok(items);
            }
            MockReply::Error(e) => return Err(e),
            MockReply::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                reply = *inner;
            }
        }
    }
}

#[async_trait]
impl LlmStream for ScriptedLlm {
    async fn chat_completion_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChunkStream, LlmError> {
        self.seen_tools.lock().push(tools.len());
        let reply = self.next_reply(messages)?;
        let items = resolve(reply).await?;
        Ok(Box::pin(stream::iter(items)))
    }

    async fn chat_completion(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let reply = self.next_reply(messages)?;
        let mut text = String::new();
        for item in resolve(reply).await? {
            if let Some(content) = item?.content {
                text.push_str(&content);
            }
        }
        Ok(text)
    }
}

/// Mock tool backend: queued outcomes per call, plus a log of every call,
/// approval and rejection it received.
pub struct ScriptedToolExecutor {
    tools: Vec<ToolDefinition>,
    outcomes: Mutex<VecDeque<Result<ToolOutcome, String>>>,
    calls: Mutex<Vec<ToolInvocation>>,
    approved: Mutex<Vec<ApprovalId>>,
    rejected: Mutex<Vec<ApprovalId>>,
}

impl ScriptedToolExecutor {
    pub fn new(tools: Vec<ToolDefinition>) -> Self {
        Self {
            tools,
            outcomes: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            approved: Mutex::new(Vec::new()),
            rejected: Mutex::new(Vec::new()),
        }
    }

    /// Executor advertising one function tool per name.
    pub fn with_tool_names(names: &[&str]) -> Self {
        Self::new(
            names
                .iter()
                .map(|name| {
                    json!({
                        "type": "function",
                        "function": {"name": name, "parameters": {"type": "object"}}
                    })
                })
                .collect(),
        )
    }

    /// Queue the outcome for the next `call_tool`. Without one, calls succeed with `"ok"`.
    pub fn push_outcome(&self, outcome: ToolOutcome) {
        self.outcomes.lock().push_back(Ok(outcome));
    }

    /// Queue a transport failure for the next `call_tool`.
    pub fn push_failure(&self, message: &str) {
        self.outcomes.lock().push_back(Err(message.to_string()));
    }

    pub fn calls(&self) -> Vec<ToolInvocation> {
        self.calls.lock().clone()
    }

    pub fn approved(&self) -> Vec<ApprovalId> {
        self.approved.lock().clone()
    }

    pub fn rejected(&self) -> Vec<ApprovalId> {
        self.rejected.lock().clone()
    }
}

#[async_trait]
impl ToolExecutor for ScriptedToolExecutor {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolError> {
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, call: &ToolInvocation) -> Result<ToolOutcome, ToolError> {
        self.calls.lock().push(call.clone());
        match self.outcomes.lock().pop_front() {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(message)) => Err(ToolError::Unavailable(message)),
            None => Ok(ToolOutcome::ok(json!("ok"))),
        }
    }

    async fn approve_tool(&self, approval_id: &ApprovalId) -> Result<ToolOutcome, ToolError> {
        self.approved.lock().push(approval_id.clone());
        Ok(ToolOutcome::ok(json!({"data": "approved action executed"})))
    }

    async fn reject_tool(&self, approval_id: &ApprovalId) -> Result<ToolOutcome, ToolError> {
        self.rejected.lock().push(approval_id.clone());
        Ok(ToolOutcome::failed("rejected by user"))
    }
}
