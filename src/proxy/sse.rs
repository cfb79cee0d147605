// SSE synthesis - turn a buffered upstream JSON reply into an event stream
//
// Some upstreams cannot stream (notably chat-completions sites when the
// request carries tools), but the client asked for `stream=true` and is
// already holding an SSE parser against the socket. The synthesizers here
// convert the full upstream JSON into the exact chunk sequence a strict
// parser expects:
//
//   data: {role chunk, delta always carries "content"}   (tool_calls ride
//   data: {terminal chunk with finish_reason + usage}     on the first)
//   data: [DONE]
//
// Upstream 4xx errors become one SSE event carrying the error envelope,
// then [DONE] - never a silently closed stream.
//
// If the upstream turns out to speak SSE after all (`data: ` prefix on the
// first bytes), both synthesizers degrade to passthrough.

use chrono::Utc;
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Streaming upstream content types that are forwarded verbatim.
pub fn is_streaming_content_type(headers: &reqwest::header::HeaderMap) -> bool {
    headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("text/event-stream") || ct.contains("application/x-ndjson"))
        .unwrap_or(false)
}

/// Whether a request body asks for streaming. Accepts the boolean form and
/// the string spellings some clients send.
pub fn body_wants_stream(body: &Value) -> bool {
    match body.get("stream") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => {
            !matches!(s.trim().to_ascii_lowercase().as_str(), "" | "0" | "false" | "no")
        }
        _ => false,
    }
}

/// Mutates streaming response chunks on their way to the client.
///
/// `process` is fed upstream chunks as they arrive and returns the bytes to
/// forward now (possibly empty while buffering); `flush` runs once after the
/// upstream closes.
pub trait ChunkTransformer: Send {
    fn process(&mut self, chunk: &[u8]) -> Vec<u8>;
    fn flush(&mut self) -> Vec<u8>;
}

// ============================================================================
// Chat Completions synthesis
// ============================================================================

/// Buffers a non-streaming chat-completion JSON reply and emits it as
/// `chat.completion.chunk` SSE events the moment the JSON is complete, so
/// slow upstreams do not push the first client byte past its read timeout.
#[derive(Default)]
pub struct ChatSseSynthesizer {
    buffer: Vec<u8>,
    passthrough: bool,
    done: bool,
}

impl ChatSseSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChunkTransformer for ChatSseSynthesizer {
    fn process(&mut self, chunk: &[u8]) -> Vec<u8> {
        if self.passthrough {
            return chunk.to_vec();
        }
        self.buffer.extend_from_slice(chunk);

        // Upstream is already streaming SSE: hand the buffer over verbatim
        let head = String::from_utf8_lossy(&self.buffer);
        if head.trim_start().starts_with("data:") || head.trim_start().starts_with("event:") {
            self.passthrough = true;
            return std::mem::take(&mut self.buffer);
        }

        match serde_json::from_slice::<Value>(&self.buffer) {
            Ok(upstream) => {
                self.done = true;
                self.buffer.clear();
                synthesize_chat_chunks(&upstream)
            }
            Err(_) => Vec::new(), // JSON not complete yet
        }
    }

    fn flush(&mut self) -> Vec<u8> {
        if self.done || self.passthrough || self.buffer.is_empty() {
            return Vec::new();
        }
        match serde_json::from_slice::<Value>(&self.buffer) {
            Ok(upstream) => {
                self.done = true;
                synthesize_chat_chunks(&upstream)
            }
            // Whatever we buffered was never valid JSON; forward it raw so
            // the client at least sees the upstream bytes
            Err(_) => std::mem::take(&mut self.buffer),
        }
    }
}

/// Build the full synthesized SSE byte sequence for one upstream reply.
pub fn synthesize_chat_chunks(upstream: &Value) -> Vec<u8> {
    let id = upstream
        .get("id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("chatcmpl-{}", Uuid::new_v4().simple()));
    // One timestamp reused across every chunk of this request
    let created = upstream
        .get("created")
        .and_then(|v| v.as_i64())
        .unwrap_or_else(|| Utc::now().timestamp());
    let model = upstream.get("model").cloned().unwrap_or(Value::Null);
    let usage = upstream.get("usage").filter(|u| u.is_object()).cloned();

    let chunk = |delta: Value, finish_reason: Value, usage: Option<&Value>, extra: Option<(&str, Value)>| {
        let mut payload = json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }]
        });
        if let Some(usage) = usage {
            payload["usage"] = usage.clone();
        }
        if let Some((key, value)) = extra {
            payload[key] = value;
        }
        format!("data: {}\n\n", payload)
    };

    let mut out = String::new();

    if let Some(error) = upstream.get("error").filter(|e| e.is_object()) {
        // Validation errors become one visible event, never a silent close
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Upstream error")
            .to_string();
        out.push_str(&chunk(
            json!({"content": message}),
            json!("error"),
            None,
            Some(("error", error.clone())),
        ));
    } else {
        let choices = upstream.get("choices").and_then(|c| c.as_array());
        let first = choices
            .and_then(|c| c.first())
            .cloned()
            .unwrap_or_else(|| json!({}));
        let message = first.get("message").filter(|m| m.is_object());

        let role = message
            .and_then(|m| m.get("role"))
            .and_then(|r| r.as_str())
            .unwrap_or("assistant");
        let content = message.and_then(|m| m.get("content"));
        let tool_calls = message
            .and_then(|m| m.get("tool_calls"))
            .and_then(|t| t.as_array())
            .filter(|t| !t.is_empty());

        // Every delta carries a "content" key, "" when the upstream sent
        // null or nothing - some clients hang waiting for the field
        let mut delta = Map::new();
        delta.insert("role".to_string(), json!(role));
        delta.insert("content".to_string(), json!(flatten_content(content)));
        if let Some(calls) = tool_calls {
            delta.insert("tool_calls".to_string(), Value::Array(calls.clone()));
        }

        let finish_reason = if tool_calls.is_some() {
            json!("tool_calls")
        } else {
            first
                .get("finish_reason")
                .filter(|f| f.is_string())
                .cloned()
                .unwrap_or(json!("stop"))
        };

        out.push_str(&chunk(Value::Object(delta), Value::Null, None, None));
        out.push_str(&chunk(json!({}), finish_reason, usage.as_ref(), None));
    }

    out.push_str("data: [DONE]\n\n");
    out.into_bytes()
}

/// Collapse a message content value into plain text: strings pass through,
/// part arrays are joined, null and anything else become "".
fn flatten_content(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(text) => Some(text.as_str()),
                Value::Object(map) => map.get("text").and_then(|t| t.as_str()),
                _ => None,
            })
            .collect(),
        _ => String::new(),
    }
}

// ============================================================================
// Responses synthesis
// ============================================================================

/// Converts a buffered chat-completion JSON reply into a Responses-style
/// SSE stream (`response.created` / `response.output_item.done` /
/// `response.completed` / done).
#[derive(Default)]
pub struct ResponsesSynthesizer {
    buffer: Vec<u8>,
}

impl ResponsesSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChunkTransformer for ResponsesSynthesizer {
    fn process(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.buffer.extend_from_slice(chunk);
        Vec::new()
    }

    fn flush(&mut self) -> Vec<u8> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        let Ok(upstream) = serde_json::from_slice::<Value>(&self.buffer) else {
            return std::mem::take(&mut self.buffer);
        };
        synthesize_responses_events(&upstream)
    }
}

pub fn synthesize_responses_events(upstream: &Value) -> Vec<u8> {
    let error = upstream.get("error").filter(|e| e.is_object());
    let message = upstream
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|m| m.get("content"))
        .map(|content| flatten_content(Some(content)))
        .or_else(|| {
            error
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_default();

    let response_id = upstream
        .get("id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("resp-{}", Uuid::new_v4().simple()));
    let created = upstream
        .get("created")
        .and_then(|v| v.as_i64())
        .unwrap_or_else(|| Utc::now().timestamp());
    let usage = upstream.get("usage").cloned().unwrap_or(json!({}));
    let item_id = format!("item-{}", Uuid::new_v4().simple());

    let output_item = json!({
        "id": item_id,
        "type": "message",
        "status": "completed",
        "role": "assistant",
        "content": [{"type": "output_text", "text": message, "annotations": []}]
    });

    let base = json!({
        "id": response_id,
        "object": "response",
        "created": created,
        "created_at": created,
        "model": upstream.get("model").cloned().unwrap_or(Value::Null),
        "status": "in_progress",
        "output": [],
        "output_text": "",
        "usage": usage,
    });

    let mut completed = base.clone();
    completed["status"] = json!(if error.is_some() { "failed" } else { "completed" });
    completed["output"] = json!([output_item]);
    completed["output_text"] = json!(message);
    if let Some(error) = error {
        completed["error"] = error.clone();
    }

    let event = |name: &str, payload: Value| format!("event: {}\ndata: {}\n\n", name, payload);

    let mut out = String::new();
    out.push_str(&event(
        "response.created",
        json!({"type": "response.created", "response": base}),
    ));
    out.push_str(&event(
        "response.output_item.done",
        json!({"type": "response.output_item.done", "output_index": 0, "item": output_item}),
    ));
    out.push_str(&event(
        "response.completed",
        json!({"type": "response.completed", "response": completed}),
    ));
    out.push_str("event: done\ndata: [DONE]\n\n");
    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_payloads(raw: &[u8]) -> Vec<Value> {
        String::from_utf8_lossy(raw)
            .lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .filter(|data| *data != "[DONE]")
            .map(|data| serde_json::from_str(data).unwrap())
            .collect()
    }

    #[test]
    fn null_content_with_tool_calls_synthesizes_empty_content() {
        let upstream = json!({
            "id": "chatcmpl-abc",
            "model": "m",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "c1",
                        "type": "function",
                        "function": {"name": "f", "arguments": "{}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let raw = synthesize_chat_chunks(&upstream);
        let text = String::from_utf8_lossy(&raw);
        assert!(text.ends_with("data: [DONE]\n\n"));

        let chunks = data_payloads(&raw);
        assert_eq!(chunks.len(), 2);

        let delta = &chunks[0]["choices"][0]["delta"];
        assert_eq!(delta["role"], "assistant");
        assert_eq!(delta["content"], "");
        assert_eq!(delta["tool_calls"][0]["id"], "c1");
        assert_eq!(chunks[1]["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(chunks[0]["id"], "chatcmpl-abc");
    }

    #[test]
    fn text_reply_synthesizes_stop_with_usage() {
        let upstream = json!({
            "created": 1700000000,
            "model": "m",
            "choices": [{
                "message": {"role": "assistant", "content": "hello"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 4, "completion_tokens": 2, "total_tokens": 6}
        });
        let raw = synthesize_chat_chunks(&upstream);
        let chunks = data_payloads(&raw);
        assert_eq!(chunks[0]["choices"][0]["delta"]["content"], "hello");
        assert_eq!(chunks[0]["created"], 1700000000);
        assert_eq!(chunks[1]["created"], 1700000000);
        assert_eq!(chunks[1]["choices"][0]["finish_reason"], "stop");
        assert_eq!(chunks[1]["usage"]["total_tokens"], 6);
    }

    #[test]
    fn missing_id_mints_chatcmpl_prefix() {
        let raw = synthesize_chat_chunks(&json!({"choices": []}));
        let chunks = data_payloads(&raw);
        let id = chunks[0]["id"].as_str().unwrap();
        assert!(id.starts_with("chatcmpl-"));
    }

    #[test]
    fn upstream_error_becomes_one_event_then_done() {
        let upstream = json!({
            "error": {"message": "invalid model", "type": "invalid_request_error"}
        });
        let raw = synthesize_chat_chunks(&upstream);
        let text = String::from_utf8_lossy(&raw);
        assert!(text.ends_with("data: [DONE]\n\n"));

        let chunks = data_payloads(&raw);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0]["choices"][0]["delta"]["content"], "invalid model");
        assert_eq!(chunks[0]["error"]["type"], "invalid_request_error");
    }

    #[test]
    fn array_content_is_flattened() {
        let upstream = json!({
            "choices": [{
                "message": {"role": "assistant", "content": [
                    {"type": "text", "text": "a"}, "b"
                ]},
                "finish_reason": "stop"
            }]
        });
        let chunks = data_payloads(&synthesize_chat_chunks(&upstream));
        assert_eq!(chunks[0]["choices"][0]["delta"]["content"], "ab");
    }

    #[test]
    fn synthesizer_emits_once_json_is_complete() {
        let mut synth = ChatSseSynthesizer::new();
        let body = json!({"choices": [{"message": {"role": "assistant", "content": "x"}}]});
        let bytes = serde_json::to_vec(&body).unwrap();
        let (head, tail) = bytes.split_at(bytes.len() / 2);

        assert!(synth.process(head).is_empty());
        let out = synth.process(tail);
        assert!(!out.is_empty());
        // Nothing left to flush afterwards
        assert!(synth.flush().is_empty());
    }

    #[test]
    fn sse_upstream_passes_through_untouched() {
        let mut synth = ChatSseSynthesizer::new();
        let chunk = b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n";
        assert_eq!(synth.process(chunk), chunk.to_vec());
        // Subsequent chunks stay in passthrough mode
        let next = b"data: [DONE]\n\n";
        assert_eq!(synth.process(next), next.to_vec());
        assert!(synth.flush().is_empty());
    }

    #[test]
    fn responses_synthesis_emits_lifecycle_events() {
        let upstream = json!({
            "id": "cmpl-1",
            "model": "m",
            "choices": [{"message": {"role": "assistant", "content": "answer"}}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1}
        });
        let raw = synthesize_responses_events(&upstream);
        let text = String::from_utf8_lossy(&raw);
        assert!(text.contains("event: response.created\n"));
        assert!(text.contains("event: response.output_item.done\n"));
        assert!(text.contains("event: response.completed\n"));
        assert!(text.ends_with("event: done\ndata: [DONE]\n\n"));
        assert!(text.contains("\"output_text\":\"answer\""));
    }

    #[test]
    fn body_wants_stream_handles_string_spellings() {
        assert!(body_wants_stream(&json!({"stream": true})));
        assert!(body_wants_stream(&json!({"stream": "1"})));
        assert!(!body_wants_stream(&json!({"stream": "false"})));
        assert!(!body_wants_stream(&json!({})));
    }
}
