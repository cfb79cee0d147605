//! Legacy family adapter - OpenAI Chat Completions upstream
//!
//! Canonical path is `/v1/chat/completions`. The interesting part is the
//! streaming decision: several legacy upstreams reject `stream=true` when
//! the request carries tools, so those requests go upstream as plain JSON
//! and the reply is synthesized back into SSE for the streaming client.
//!
//! A per-config tri-state `streaming` field overrides the client
//! preference (force on / force off / follow client), and
//! `tool_calls_streaming = true` opts a site back into streaming with
//! tools. Responses-shaped payloads posted to `/responses` are mapped to
//! chat completions and answered with a synthesized Responses stream.
//!
//! Tool-result message bodies are treated as opaque strings and forwarded
//! as-is; the proxy never interprets their content.

use super::{set_default, set_forced, FamilyAdapter, StreamPlan, SynthesisKind};
use crate::config::{SystemSettings, UpstreamConfig};
use crate::family::Family;
use axum::http::{header, HeaderMap};
use serde_json::{json, Map, Value};

pub struct LegacyAdapter;

impl FamilyAdapter for LegacyAdapter {
    fn family(&self) -> Family {
        Family::Legacy
    }

    fn normalize(&self, path: &str, body: Option<Value>) -> (String, Option<Value>) {
        let trimmed = path.trim_matches('/').to_ascii_lowercase();
        if trimmed == "responses" || trimmed == "v1/responses" {
            return (
                "/v1/chat/completions".to_string(),
                body.map(responses_to_chat),
            );
        }
        if trimmed == "chat/completions" {
            return ("/v1/chat/completions".to_string(), body);
        }
        (path.to_string(), body)
    }

    fn backfill(
        &self,
        canonical_path: &str,
        client_path: &str,
        body: &mut Option<Value>,
        config: &UpstreamConfig,
        _system: &SystemSettings,
        client_wants_stream: bool,
    ) -> StreamPlan {
        let from_responses = client_path
            .trim_matches('/')
            .to_ascii_lowercase()
            .ends_with("responses");
        if from_responses {
            // The converted body already carries stream=false; the client
            // gets a synthesized Responses event stream.
            if let Some(Value::Object(map)) = body {
                map.insert("stream".to_string(), json!(false));
            }
            return StreamPlan {
                upstream_stream: false,
                client_stream: true,
                synthesize: Some(SynthesisKind::Responses),
            };
        }

        if !canonical_path.ends_with("chat/completions") {
            return StreamPlan::passthrough(client_wants_stream);
        }

        let has_tools = body
            .as_ref()
            .and_then(|b| b.get("tools"))
            .and_then(|t| t.as_array())
            .is_some_and(|t| !t.is_empty());
        // Tools force a JSON round-trip unless the site explicitly allows
        // streaming tool calls.
        let tools_block_stream = has_tools && config.tool_calls_streaming != Some(true);

        let client_stream = match config.streaming {
            Some(forced) => forced,
            None => client_wants_stream,
        };
        let upstream_stream = client_stream && !tools_block_stream;

        if let Some(Value::Object(map)) = body {
            map.insert("stream".to_string(), json!(upstream_stream));
        }

        StreamPlan {
            upstream_stream,
            client_stream,
            // The synthesizer passes real SSE through untouched, so it is
            // safe to install whenever the client expects a stream.
            synthesize: client_stream.then_some(SynthesisKind::ChatCompletions),
        }
    }

    fn apply_headers(&self, headers: &mut HeaderMap, _plan: &StreamPlan) {
        set_default(headers, header::CONTENT_TYPE, "application/json");
        set_default(headers, header::USER_AGENT, "cli-proxy-legacy/1.0");
        // Always ask the upstream for JSON; SSE for the client is our job
        set_forced(headers, header::ACCEPT, "application/json");
    }
}

/// Map a Responses-shaped payload onto chat completions: input blocks (or
/// a prompt string) become messages, tool machinery is flattened away.
fn responses_to_chat(body: Value) -> Value {
    let Value::Object(map) = body else {
        return body;
    };

    let mut messages = convert_input_blocks(map.get("input"));
    if messages.is_empty() {
        if let Some(Value::Array(existing)) = map.get("messages") {
            messages = existing.clone();
        }
    }
    if messages.is_empty() {
        if let Some(prompt) = map.get("prompt").and_then(|p| p.as_str()) {
            messages.push(json!({"role": "user", "content": prompt}));
        }
    }
    let messages = flatten_tool_messages(messages);

    let mut out = Map::new();
    for key in ["model", "temperature", "top_p"] {
        if let Some(value) = map.get(key).filter(|v| !v.is_null()) {
            out.insert(key.to_string(), value.clone());
        }
    }
    out.insert("messages".to_string(), Value::Array(messages));
    out.insert("stream".to_string(), json!(false));
    Value::Object(out)
}

/// Convert Responses `input` blocks into chat messages, joining
/// `input_text` parts per block.
fn convert_input_blocks(input: Option<&Value>) -> Vec<Value> {
    let Some(Value::Array(blocks)) = input else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter_map(|block| {
            let map = block.as_object()?;
            let role = map.get("role").and_then(|r| r.as_str()).unwrap_or("user");
            let text = match map.get("content") {
                Some(Value::String(text)) => text.clone(),
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(text) => Some(text.as_str()),
                        Value::Object(part) => match part.get("type").and_then(|t| t.as_str()) {
                            Some("input_text") | Some("text") | None => {
                                part.get("text").and_then(|t| t.as_str())
                            }
                            _ => None,
                        },
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
                _ => String::new(),
            };
            if text.trim().is_empty() {
                return None;
            }
            Some(json!({"role": role, "content": text}))
        })
        .collect()
}

/// Strip tool-call plumbing for upstreams that only understand plain chat:
/// assistant tool_calls keep any text they carried, tool results become
/// user turns with their content passed through opaquely.
fn flatten_tool_messages(messages: Vec<Value>) -> Vec<Value> {
    let mut flattened: Vec<Value> = Vec::new();
    for message in messages {
        let Some(map) = message.as_object() else {
            continue;
        };
        match map.get("role").and_then(|r| r.as_str()) {
            Some("assistant") if map.contains_key("tool_calls") => {
                if let Some(text) = map.get("content").and_then(|c| c.as_str()) {
                    if !text.trim().is_empty() {
                        flattened.push(json!({"role": "assistant", "content": text}));
                    }
                }
            }
            Some("tool") => {
                let content = match map.get("content") {
                    Some(Value::String(text)) => text.clone(),
                    Some(Value::Array(parts)) => parts
                        .iter()
                        .filter_map(|part| match part {
                            Value::String(text) => Some(text.as_str()),
                            Value::Object(p) => p.get("text").and_then(|t| t.as_str()),
                            _ => None,
                        })
                        .collect::<Vec<_>>()
                        .join("\n"),
                    _ => String::new(),
                };
                flattened.push(json!({"role": "user", "content": content}));
            }
            _ => {
                let mut cleaned = map.clone();
                cleaned.remove("tool_calls");
                flattened.push(Value::Object(cleaned));
            }
        }
    }
    if flattened.is_empty() {
        flattened.push(json!({"role": "user", "content": ""}));
    }
    flattened
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(value: Value) -> UpstreamConfig {
        serde_json::from_value(value).unwrap()
    }

    fn plain_config() -> UpstreamConfig {
        config(json!({"base_url": "https://a", "auth_token": "t"}))
    }

    fn plan_for(body: &mut Option<Value>, cfg: &UpstreamConfig, wants: bool) -> StreamPlan {
        LegacyAdapter.backfill(
            "/v1/chat/completions",
            "/v1/chat/completions",
            body,
            cfg,
            &SystemSettings::default(),
            wants,
        )
    }

    #[test]
    fn tools_force_json_upstream_and_synthesized_sse() {
        let mut body = Some(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "go"}],
            "stream": true,
            "tools": [{"type": "function", "function": {"name": "f"}}]
        }));
        let plan = plan_for(&mut body, &plain_config(), true);
        assert!(!plan.upstream_stream);
        assert!(plan.client_stream);
        assert_eq!(plan.synthesize, Some(SynthesisKind::ChatCompletions));
        assert_eq!(body.unwrap()["stream"], false);
    }

    #[test]
    fn tool_calls_streaming_true_lets_tools_stream() {
        let cfg = config(json!({
            "base_url": "https://a", "auth_token": "t", "tool_calls_streaming": true
        }));
        let mut body = Some(json!({
            "model": "m", "stream": true,
            "tools": [{"type": "function", "function": {"name": "f"}}]
        }));
        let plan = plan_for(&mut body, &cfg, true);
        assert!(plan.upstream_stream);
        assert_eq!(body.unwrap()["stream"], true);
    }

    #[test]
    fn streaming_force_off_collects_json() {
        let cfg = config(json!({
            "base_url": "https://a", "auth_token": "t", "streaming": false
        }));
        let mut body = Some(json!({"model": "m", "stream": true}));
        let plan = plan_for(&mut body, &cfg, true);
        assert!(!plan.upstream_stream);
        assert!(!plan.client_stream);
        assert_eq!(plan.synthesize, None);
        assert_eq!(body.unwrap()["stream"], false);
    }

    #[test]
    fn streaming_force_on_overrides_client() {
        let cfg = config(json!({
            "base_url": "https://a", "auth_token": "t", "streaming": true
        }));
        let mut body = Some(json!({"model": "m"}));
        let plan = plan_for(&mut body, &cfg, false);
        assert!(plan.client_stream);
        assert!(plan.upstream_stream);
        assert_eq!(plan.synthesize, Some(SynthesisKind::ChatCompletions));
    }

    #[test]
    fn auto_mode_follows_client() {
        let mut body = Some(json!({"model": "m", "stream": false}));
        let plan = plan_for(&mut body, &plain_config(), false);
        assert!(!plan.client_stream);
        assert_eq!(plan.synthesize, None);
    }

    #[test]
    fn bare_chat_completions_gets_v1_prefix() {
        let (path, _) = LegacyAdapter.normalize("/chat/completions", None);
        assert_eq!(path, "/v1/chat/completions");
    }

    #[test]
    fn responses_path_converts_to_chat_with_synthesis() {
        let body = json!({
            "model": "m",
            "input": [
                {"role": "user", "content": [{"type": "input_text", "text": "hello"}]}
            ],
            "temperature": 0.2
        });
        let (path, converted) = LegacyAdapter.normalize("/responses", Some(body));
        assert_eq!(path, "/v1/chat/completions");
        let converted = converted.unwrap();
        assert_eq!(converted["messages"][0]["content"], "hello");
        assert_eq!(converted["stream"], false);
        assert_eq!(converted["temperature"], 0.2);

        let mut body = Some(converted);
        let plan = LegacyAdapter.backfill(
            "/v1/chat/completions",
            "/responses",
            &mut body,
            &plain_config(),
            &SystemSettings::default(),
            true,
        );
        assert_eq!(plan.synthesize, Some(SynthesisKind::Responses));
        assert!(!plan.upstream_stream);
    }

    #[test]
    fn tool_messages_flatten_to_plain_chat() {
        let messages = vec![
            json!({"role": "assistant", "content": "thinking", "tool_calls": [{"id": "c1"}]}),
            json!({"role": "tool", "tool_call_id": "c1", "content": "[object Object]"}),
            json!({"role": "user", "content": "next"}),
        ];
        let flattened = flatten_tool_messages(messages);
        assert_eq!(flattened.len(), 3);
        assert_eq!(flattened[0]["content"], "thinking");
        assert!(flattened[0].get("tool_calls").is_none());
        // Opaque tool-result bodies pass through untouched as user turns
        assert_eq!(flattened[1]["role"], "user");
        assert_eq!(flattened[1]["content"], "[object Object]");
    }
}
