use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Future, Stream};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use parley_core::errors::LlmError;
use parley_core::messages::ChatMessage;
use parley_core::provider::{ChunkStream, LlmStream};
use parley_core::stream::ChatChunk;
use parley_core::tools::ToolDefinition;

use crate::sse::{self, SseFrame};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    /// Base URL up to and including the version segment, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub idle_timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_tokens: None,
            idle_timeout: SSE_IDLE_TIMEOUT,
        }
    }
}

/// Chat-completions client for any OpenAI-compatible endpoint.
pub struct OpenAiClient {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| LlmError::InvalidRequest(format!("http client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn build_body(&self, messages: &[ChatMessage], tools: &[ToolDefinition], stream: bool) -> Value {
        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": self.config.temperature,
            "stream": stream,
        });
        if stream {
            body["stream_options"] = json!({"include_usage": true});
        }
        if let Some(max_tokens) = self.config.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, LlmError> {
        let mut req = self.client.post(self.endpoint()).json(body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| LlmError::NetworkError(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status, body));
        }
        Ok(resp)
    }
}

#[async_trait]
impl LlmStream for OpenAiClient {
    #[instrument(skip(self, messages, tools), fields(model = %self.config.model, messages = messages.len()))]
    async fn chat_completion_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChunkStream, LlmError> {
        let body = self.build_body(messages, tools, true);
        let resp = self.send(&body).await?;
        debug!("stream opened");
        Ok(Box::pin(SseStream::with_idle_timeout(
            resp.bytes_stream(),
            self.config.idle_timeout,
        )))
    }

    #[instrument(skip(self, messages), fields(model = %self.config.model, messages = messages.len()))]
    async fn chat_completion(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let body = self.build_body(messages, &[], false);
        let resp = self.send(&body).await?;
        let value: Value = resp
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        value
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| LlmError::InvalidResponse("missing choices[0].message.content".into()))
    }
}

/// Wraps a byte stream from reqwest and yields decoded chunks.
/// If no data arrives within `idle_duration`, yields a `StreamInterrupted` error.
struct SseStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    buffer: String,
    pending: VecDeque<Result<ChatChunk, LlmError>>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    /// The finishing chunk, held back until `[DONE]` so trailing usage can be merged in.
    held: Option<ChatChunk>,
    done: bool,
}

impl SseStream {
    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            buffer: String::new(),
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            held: None,
            done: false,
        }
    }

    fn absorb(&mut self, block: &str) {
        for data in sse::parse_sse_lines(block) {
            match sse::parse_frame(&data) {
                Ok(SseFrame::Chunk(chunk)) => match self.held.as_mut() {
                    Some(held) => {
                        if chunk.usage.is_some() {
                            held.usage = chunk.usage;
                        }
                    }
                    None if chunk.finished => self.held = Some(chunk),
                    None => self.pending.push_back(Ok(chunk)),
                },
                Ok(SseFrame::Done) => {
                    self.release_held();
                    self.done = true;
                }
                Err(e) => {
                    self.pending.push_back(Err(e));
                    self.done = true;
                }
            }
        }
    }

    /// Emit the finishing chunk, synthesizing one if the server never sent a finish reason.
    fn release_held(&mut self) {
        let last = self.held.take().unwrap_or_else(ChatChunk::done);
        self.pending.push_back(Ok(last));
    }
}

impl Stream for SseStream {
    type Item = Result<ChatChunk, LlmError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Poll::Ready(Some(item));
            }
            if self.done {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(deadline);

                    let text = String::from_utf8_lossy(&bytes);
                    self.buffer.push_str(&text);

                    while let Some(pos) = self.buffer.find("\n\n") {
                        let block: String = self.buffer.drain(..pos + 2).collect();
                        self.absorb(&block);
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(LlmError::StreamInterrupted(e.to_string()))));
                }
                Poll::Ready(None) => {
                    if !self.buffer.is_empty() {
                        let remaining = std::mem::take(&mut self.buffer);
                        self.absorb(&remaining);
                    }
                    if !self.done && self.held.is_some() {
                        self.release_held();
                    }
                    self.done = true;
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.done = true;
                        return Poll::Ready(Some(Err(LlmError::StreamInterrupted(format!(
                            "idle timeout after {}s",
                            self.idle_duration.as_secs()
                        )))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
