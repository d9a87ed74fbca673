use serde::Deserialize;

use parley_core::errors::LlmError;
use parley_core::stream::{ChatChunk, TokenUsage, ToolCallDelta};

/// One decoded `data:` payload from a chat-completions stream.
#[derive(Debug, PartialEq)]
pub enum SseFrame {
    Chunk(ChatChunk),
    Done,
}

/// Extract `data:` payloads from a block of SSE text.
/// Comment lines and other fields are ignored; multi-line data is joined with `\n`.
pub fn parse_sse_lines(raw: &str) -> Vec<String> {
    let mut payloads = Vec::new();
    let mut current: Option<String> = None;

    for line in raw.lines() {
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.strip_prefix(' ').unwrap_or(data);
            match current.as_mut() {
                Some(buf) => {
                    buf.push('\n');
                    buf.push_str(data);
                }
                None => current = Some(data.to_string()),
            }
        } else if line.is_empty() {
            if let Some(buf) = current.take() {
                payloads.push(buf);
            }
        }
    }

    // Trailing event without blank line
    if let Some(buf) = current {
        payloads.push(buf);
    }

    payloads
}

/// Decode one `data:` payload into a chunk.
pub fn parse_frame(data: &str) -> Result<SseFrame, LlmError> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseFrame::Done);
    }

    let raw: RawChunk = serde_json::from_str(data)
        .map_err(|e| LlmError::InvalidResponse(format!("bad stream chunk: {e}")))?;

    let mut chunk = ChatChunk {
        usage: raw.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        }),
        ..Default::default()
    };

    if let Some(choice) = raw.choices.into_iter().next() {
        let delta = choice.delta.unwrap_or_default();
        chunk.role = delta.role;
        chunk.content = delta.content.filter(|c| !c.is_empty());
        chunk.reasoning = delta.reasoning_content.filter(|c| !c.is_empty());
        chunk.tool_calls = delta
            .tool_calls
            .into_iter()
            .map(|tc| {
                let function = tc.function.unwrap_or_default();
                ToolCallDelta {
                    index: tc.index,
                    id: tc.id.filter(|s| !s.is_empty()),
                    kind: tc.kind,
                    name: function.name.filter(|s| !s.is_empty()),
                    arguments: function.arguments,
                }
            })
            .collect();
        chunk.finished = choice.finish_reason.is_some();
    }

    Ok(SseFrame::Chunk(chunk))
}

// --- Deserialization types for chat-completions stream chunks ---

#[derive(Deserialize)]
struct RawChunk {
    #[serde(default)]
    choices: Vec<RawChoice>,
    #[serde(default)]
    usage: Option<RawUsage>,
}

#[derive(Deserialize)]
struct RawChoice {
    #[serde(default)]
    delta: Option<RawDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct RawDelta {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<RawToolCall>,
}

#[derive(Deserialize)]
struct RawToolCall {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    function: Option<RawFunction>,
}

#[derive(Default, Deserialize)]
struct RawFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct RawUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sse_lines_basic() {
        let raw = "data: {\"a\":1}\n\n: keep-alive\n\ndata: [DONE]\n\n";
        assert_eq!(parse_sse_lines(raw), vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn parse_sse_lines_trailing_without_blank() {
        assert_eq!(parse_sse_lines("data:{}"), vec!["{}".to_string()]);
    }

    #[test]
    fn done_marker() {
        assert_eq!(parse_frame(" [DONE] ").unwrap(), SseFrame::Done);
    }

    #[test]
    fn content_delta() {
        let frame = parse_frame(
            r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":"Hel"},"finish_reason":null}]}"#,
        )
        .unwrap();
        let SseFrame::Chunk(chunk) = frame else { panic!("expected chunk") };
        assert_eq!(chunk.role.as_deref(), Some("assistant"));
        assert_eq!(chunk.content.as_deref(), Some("Hel"));
        assert!(!chunk.finished);
    }

    #[test]
    fn tool_call_fragment() {
        let frame = parse_frame(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"weather","arguments":"{\"ci"}}]}}]}"#,
        )
        .unwrap();
        let SseFrame::Chunk(chunk) = frame else { panic!("expected chunk") };
        let tc = &chunk.tool_calls[0];
        assert_eq!(tc.id.as_deref(), Some("call_1"));
        assert_eq!(tc.name.as_deref(), Some("weather"));
        assert_eq!(tc.arguments.as_deref(), Some("{\"ci"));
    }

    #[test]
    fn finish_reason_marks_finished() {
        let frame = parse_frame(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#).unwrap();
        let SseFrame::Chunk(chunk) = frame else { panic!("expected chunk") };
        assert!(chunk.finished);
    }

    #[test]
    fn usage_only_chunk() {
        let frame = parse_frame(r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":3}}"#).unwrap();
        let SseFrame::Chunk(chunk) = frame else { panic!("expected chunk") };
        assert_eq!(chunk.usage, Some(TokenUsage { prompt_tokens: 12, completion_tokens: 3 }));
        assert!(!chunk.finished);
    }

    #[test]
    fn malformed_chunk_is_invalid_response() {
        assert!(matches!(parse_frame("{not json"), Err(LlmError::InvalidResponse(_))));
    }
}
