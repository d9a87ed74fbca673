//! Bounded reason-then-act loop over a token-streaming model.
//!
//! Each round streams one completion. Tool calls are executed the moment
//! their arguments parse, while the rest of the stream keeps draining.
//! A round without any tool call ends the loop with its text as the answer;
//! running out of rounds ends it with a sentinel result instead.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::StreamExt;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use parley_core::errors::LlmError;
use parley_core::events::Decision;
use parley_core::messages::{ChatMessage, FunctionCall, ToolCallRecord};
use parley_core::profile::DEFAULT_MAX_TOOL_CALLS;
use parley_core::provider::{ChunkStream, LlmStream, ToolExecutor};
use parley_core::stream::{ChatChunk, TokenUsage};
use parley_core::tools::{ToolDefinition, ToolInvocation, ToolOutcome};

use crate::accumulator::ToolCallAccumulator;
use crate::error::EngineError;
use crate::pipe::EventPipe;

/// Final text written when the round budget runs out.
pub const EXHAUSTED_FINAL_TEXT: &str = "Exceeded max ReAct steps!!";

/// Structured sentinel attached to the exhausted final event.
pub fn exhausted_sentinel() -> Value {
    json!({"error": "Exceeded max ReAct steps"})
}

/// What one round's stream yields to the executor.
#[derive(Clone, Debug, PartialEq)]
pub enum RoundEvent {
    ToolCall(ToolInvocation),
    /// Concatenated content of the round; emitted once, when the stream finishes.
    FinalContent(String),
    Usage(TokenUsage),
}

/// Turns raw chunks into [`RoundEvent`]s. Text and reasoning fragments go
/// straight to the pipe as side-channel deltas.
pub struct RoundStream<'a> {
    chunks: ChunkStream,
    pipe: &'a EventPipe,
    accumulator: ToolCallAccumulator,
    buffer: String,
    queue: VecDeque<RoundEvent>,
    stream_text: bool,
    finished: bool,
}

impl<'a> RoundStream<'a> {
    pub fn new(chunks: ChunkStream, pipe: &'a EventPipe, stream_text: bool) -> Self {
        Self {
            chunks,
            pipe,
            accumulator: ToolCallAccumulator::new(),
            buffer: String::new(),
            queue: VecDeque::new(),
            stream_text,
            finished: false,
        }
    }

    /// Next event, `None` once the round is over. A transport error ends the round.
    pub async fn next(&mut self) -> Option<Result<RoundEvent, LlmError>> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Some(Ok(event));
            }
            if self.finished {
                return None;
            }
            match self.chunks.next().await {
                Some(Ok(chunk)) => self.absorb(chunk),
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                None => self.finish(),
            }
        }
    }

    fn absorb(&mut self, chunk: ChatChunk) {
        if let Some(reasoning) = chunk.reasoning.filter(|r| !r.is_empty()) {
            self.pipe.think_delta(reasoning);
        }
        if let Some(content) = chunk.content.filter(|c| !c.is_empty()) {
            self.buffer.push_str(&content);
            if self.stream_text {
                self.pipe.text_delta(content);
            }
        }
        for delta in &chunk.tool_calls {
            if let Some(invocation) = self.accumulator.push(delta) {
                self.queue.push_back(RoundEvent::ToolCall(invocation));
            }
        }
        if let Some(usage) = chunk.usage {
            self.queue.push_back(RoundEvent::Usage(usage));
        }
        if chunk.finished {
            self.finish();
        }
    }

    fn finish(&mut self) {
        let pending = self.accumulator.pending();
        if !pending.is_empty() {
            warn!(tool_call_ids = ?pending, "round ended with unparsed tool call arguments");
        }
        self.queue
            .push_back(RoundEvent::FinalContent(std::mem::take(&mut self.buffer)));
        self.finished = true;
    }
}

#[derive(Clone, Debug)]
pub struct ReactConfig {
    /// Round budget. Zero is treated as one round.
    pub max_rounds: u32,
    /// `None` waits for a decision until the pipe closes.
    pub approval_timeout: Option<Duration>,
    pub stream_text: bool,
}

impl Default for ReactConfig {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_TOOL_CALLS,
            approval_timeout: None,
            stream_text: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ReactOutcome {
    /// A round finished without tool calls.
    Answer(String),
    /// Every round asked for more tools.
    Exhausted { rounds: u32 },
    /// The pipe was closed before the loop could finish.
    Abandoned,
}

impl ReactOutcome {
    pub fn text(&self) -> &str {
        match self {
            Self::Answer(text) => text,
            Self::Exhausted { .. } => EXHAUSTED_FINAL_TEXT,
            Self::Abandoned => "",
        }
    }
}

pub struct ReactExecutor {
    llm: Arc<dyn LlmStream>,
    tools: Arc<dyn ToolExecutor>,
    config: ReactConfig,
}

impl ReactExecutor {
    pub fn new(llm: Arc<dyn LlmStream>, tools: Arc<dyn ToolExecutor>, config: ReactConfig) -> Self {
        Self { llm, tools, config }
    }

    pub fn config(&self) -> &ReactConfig {
        &self.config
    }

    /// Drive rounds until an answer, exhaustion, or a closed pipe.
    ///
    /// `messages` is extended in place with every assistant tool call, tool
    /// result, failure note and the final answer.
    #[instrument(skip_all, fields(request_id = %pipe.request_id(), max_rounds = self.config.max_rounds))]
    pub async fn run(
        &self,
        messages: &mut Vec<ChatMessage>,
        tools: &[ToolDefinition],
        pipe: &EventPipe,
    ) -> Result<ReactOutcome, EngineError> {
        let max_rounds = self.config.max_rounds.max(1);
        let mut abandoned = false;

        for round in 1..=max_rounds {
            if pipe.is_closed() {
                debug!(round, "pipe closed, abandoning loop");
                return Ok(ReactOutcome::Abandoned);
            }

            let chunks = match self.llm.chat_completion_stream(messages.as_slice(), tools).await {
                Ok(chunks) => chunks,
                Err(e) => return Err(fail_stream(pipe, e)),
            };
            let mut stream = RoundStream::new(chunks, pipe, self.config.stream_text);

            let mut called_tool = false;
            let mut candidate = String::new();
            while let Some(event) = stream.next().await {
                match event {
                    Ok(RoundEvent::ToolCall(invocation)) => {
                        called_tool = true;
                        if abandoned || pipe.is_closed() {
                            abandoned = true;
                            debug!(round, tool = %invocation.name, tool_call_id = %invocation.id, "pipe closed, tool call skipped");
                            continue;
                        }
                        self.handle_tool_call(&invocation, messages, pipe).await;
                        abandoned = pipe.is_closed();
                    }
                    Ok(RoundEvent::FinalContent(text)) => candidate = text,
                    Ok(RoundEvent::Usage(usage)) => {
                        pipe.usage(usage.prompt_tokens, usage.completion_tokens, 0.0);
                    }
                    Err(e) => return Err(fail_stream(pipe, e)),
                }
            }

            if abandoned {
                debug!(round, "pipe closed during round, abandoning loop");
                return Ok(ReactOutcome::Abandoned);
            }
            if !called_tool {
                if !pipe.final_text(candidate.as_str()) {
                    debug!(round, "pipe closed before answer, abandoning loop");
                    return Ok(ReactOutcome::Abandoned);
                }
                info!(round, chars = candidate.len(), "react loop answered");
                messages.push(ChatMessage::assistant(strip_action_tags(&candidate)));
                return Ok(ReactOutcome::Answer(candidate));
            }
            debug!(round, "tool calls made, starting next round");
        }

        if !pipe.final_structured(EXHAUSTED_FINAL_TEXT, exhausted_sentinel()) {
            return Ok(ReactOutcome::Abandoned);
        }
        warn!(rounds = max_rounds, "react loop exhausted its round budget");
        Ok(ReactOutcome::Exhausted { rounds: max_rounds })
    }

    async fn handle_tool_call(&self, invocation: &ToolInvocation, messages: &mut Vec<ChatMessage>, pipe: &EventPipe) {
        pipe.tool_call(invocation.name.as_str(), invocation.arguments.clone());

        let outcome = match self.tools.call_tool(invocation).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(tool = %invocation.name, tool_call_id = %invocation.id, error = %e, "tool call failed");
                ToolOutcome::failed(e.to_string())
            }
        };
        let outcome = if outcome.is_pending() {
            self.settle_approval(invocation, outcome, pipe).await
        } else {
            outcome
        };

        if !outcome.success {
            let error = outcome.error_message();
            pipe.tool_result(invocation.name.as_str(), false, json!({"error": error}));
            messages.push(ChatMessage::user(format!(
                "Tool call {} failed: {error}",
                invocation.id
            )));
            return;
        }

        let payload = outcome.payload();
        pipe.tool_result(invocation.name.as_str(), true, payload.clone());
        messages.push(ChatMessage::assistant_tool_call(
            "",
            ToolCallRecord {
                id: invocation.id.clone(),
                kind: invocation.kind.clone(),
                function: FunctionCall {
                    name: invocation.name.clone(),
                    arguments: invocation.arguments.to_string(),
                },
            },
        ));
        messages.push(ChatMessage::tool_result(invocation.id.as_str(), render_payload(&payload)));
    }

    /// Ask the client, wait for the decision, then run the matching backend path.
    async fn settle_approval(&self, invocation: &ToolInvocation, pending: ToolOutcome, pipe: &EventPipe) -> ToolOutcome {
        let Some(approval_id) = pending.approval_id.clone() else {
            warn!(tool = %invocation.name, "pending tool result without approval id");
            return ToolOutcome::failed("approval required but no approval id was issued");
        };

        pipe.approval_required(
            approval_id.clone(),
            invocation.name.as_str(),
            invocation.arguments.clone(),
            pending.approval_message(),
            pending.safety_assessment(),
        );
        info!(tool = %invocation.name, approval_id = %approval_id, "waiting for approval");

        let decision = pipe
            .wait_for_approval(&approval_id, self.config.approval_timeout)
            .await;
        debug!(approval_id = %approval_id, %decision, "approval settled");

        let result = match decision {
            Decision::Approved => self.tools.approve_tool(&approval_id).await,
            Decision::Rejected => self.tools.reject_tool(&approval_id).await,
        };
        result.unwrap_or_else(|e| {
            warn!(approval_id = %approval_id, error = %e, "approval follow-up failed");
            ToolOutcome::failed(e.to_string())
        })
    }
}

/// Report a broken stream as the request's one error and end the pipe.
pub(crate) fn fail_stream(pipe: &EventPipe, error: LlmError) -> EngineError {
    warn!(request_id = %pipe.request_id(), error = %error, "model stream failed");
    pipe.error_with_code(error.error_kind(), error.to_string(), error.is_retryable());
    pipe.close(None);
    EngineError::Llm(error)
}

fn render_payload(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn action_tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[.*?\]|\{.*?\}").expect("valid regex"))
}

/// Remove inline `[...]` and `{...}` action markers from an answer.
pub fn strip_action_tags(text: &str) -> String {
    action_tag_regex().replace_all(text, "").trim().to_string()
}
