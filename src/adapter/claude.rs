//! Claude family adapter - Anthropic Messages upstream
//!
//! Canonical path is `/v1/messages`. Clients speaking the OpenAI chat
//! shape can call `/v1/chat/completions` and get rewritten transparently.
//! Every outgoing body carries a stable `metadata.user_id`, matching what
//! the Claude CLI itself sends.

use super::{set_default, set_forced, FamilyAdapter, StreamPlan};
use crate::config::{SystemSettings, UpstreamConfig};
use crate::family::Family;
use axum::http::{header, HeaderMap, HeaderName};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use uuid::Uuid;

const DEFAULT_MAX_TOKENS: u64 = 4096;

pub struct ClaudeAdapter;

impl FamilyAdapter for ClaudeAdapter {
    fn family(&self) -> Family {
        Family::Claude
    }

    fn normalize(&self, path: &str, body: Option<Value>) -> (String, Option<Value>) {
        let trimmed = path.trim_matches('/').to_ascii_lowercase();
        if trimmed == "v1/chat/completions" || trimmed == "chat/completions" {
            let converted = body.map(chat_to_messages);
            return ("/v1/messages".to_string(), converted);
        }
        (path.to_string(), body)
    }

    fn backfill(
        &self,
        _canonical_path: &str,
        _client_path: &str,
        body: &mut Option<Value>,
        _config: &UpstreamConfig,
        _system: &SystemSettings,
        client_wants_stream: bool,
    ) -> StreamPlan {
        if let Some(Value::Object(map)) = body {
            inject_user_id(map);
        }
        StreamPlan::passthrough(client_wants_stream)
    }

    fn apply_headers(&self, headers: &mut HeaderMap, plan: &StreamPlan) {
        set_forced(headers, header::USER_AGENT, "claude-cli/2.0.0 (external, cli)");
        set_forced(headers, HeaderName::from_static("x-app"), "cli");
        set_forced(headers, HeaderName::from_static("x-stainless-lang"), "js");
        set_forced(headers, HeaderName::from_static("x-stainless-runtime"), "node");
        set_forced(
            headers,
            HeaderName::from_static("x-stainless-package-version"),
            "0.60.0",
        );
        set_default(
            headers,
            HeaderName::from_static("anthropic-version"),
            "2023-06-01",
        );
        set_default(headers, header::CONTENT_TYPE, "application/json");
        set_default(headers, header::ACCEPT, "application/json");
        if plan.client_stream {
            set_forced(
                headers,
                HeaderName::from_static("x-stainless-helper-method"),
                "stream",
            );
        }
    }
}

/// Ensure `metadata.user_id` is present and shaped like the CLI's own:
/// `user_<hex>_cli_proxy_account__session_<hex>`. The value is stable for
/// the lifetime of the process.
fn inject_user_id(body: &mut Map<String, Value>) {
    let metadata = body
        .entry("metadata".to_string())
        .or_insert_with(|| json!({}));
    let Some(metadata) = metadata.as_object_mut() else {
        return;
    };
    let present = metadata
        .get("user_id")
        .and_then(|v| v.as_str())
        .is_some_and(|s| !s.is_empty());
    if !present {
        metadata.insert("user_id".to_string(), json!(stable_user_id()));
    }
}

fn stable_user_id() -> &'static str {
    static USER_ID: OnceLock<String> = OnceLock::new();
    USER_ID.get_or_init(|| {
        let mut hasher = Sha256::new();
        hasher.update(std::process::id().to_le_bytes());
        hasher.update(Uuid::new_v4().as_bytes());
        let account = format!("{:x}", hasher.finalize());
        let session = Uuid::new_v4().simple();
        format!("user_{}_cli_proxy_account__session_{}", account, session)
    })
}

/// Convert an OpenAI chat-completions body into the Anthropic Messages
/// shape. System messages collapse into the `system` field; tool-role
/// messages are folded into user turns as plain text.
fn chat_to_messages(body: Value) -> Value {
    let Value::Object(map) = body else {
        return body;
    };

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    if let Some(Value::Array(incoming)) = map.get("messages") {
        for message in incoming {
            let role = message.get("role").and_then(|r| r.as_str()).unwrap_or("user");
            let text = flatten_text(message.get("content"));
            match role {
                "system" => {
                    if !text.is_empty() {
                        system_parts.push(text);
                    }
                }
                "assistant" => messages.push(json!({"role": "assistant", "content": text})),
                // Tool results and anything else arrive as user turns
                _ => messages.push(json!({"role": "user", "content": text})),
            }
        }
    }
    if messages.is_empty() {
        messages.push(json!({"role": "user", "content": ""}));
    }

    let mut out = Map::new();
    if let Some(model) = map.get("model") {
        out.insert("model".to_string(), model.clone());
    }
    let max_tokens = map
        .get("max_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_MAX_TOKENS);
    out.insert("max_tokens".to_string(), json!(max_tokens));
    out.insert("messages".to_string(), Value::Array(messages));
    if !system_parts.is_empty() {
        out.insert("system".to_string(), json!(system_parts.join("\n\n")));
    }
    for key in ["stream", "temperature", "top_p", "stop_sequences"] {
        if let Some(value) = map.get(key).filter(|v| !v.is_null()) {
            out.insert(key.to_string(), value.clone());
        }
    }
    Value::Object(out)
}

fn flatten_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(text) => Some(text.as_str()),
                Value::Object(map) => map.get("text").and_then(|t| t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn chat_completions_path_rewrites_to_messages() {
        let adapter = ClaudeAdapter;
        let body = json!({
            "model": "claude-opus-4",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"}
            ],
            "stream": true,
            "temperature": 0.5
        });
        let (path, converted) = adapter.normalize("/v1/chat/completions", Some(body));
        assert_eq!(path, "/v1/messages");

        let converted = converted.unwrap();
        assert_eq!(converted["model"], "claude-opus-4");
        assert_eq!(converted["system"], "be brief");
        assert_eq!(converted["messages"][0]["role"], "user");
        assert_eq!(converted["messages"][0]["content"], "hi");
        assert_eq!(converted["max_tokens"], 4096);
        assert_eq!(converted["stream"], true);
        assert_eq!(converted["temperature"], 0.5);
        assert!(converted.get("system").is_some());
    }

    #[test]
    fn canonical_path_is_untouched() {
        let adapter = ClaudeAdapter;
        let body = json!({"model": "m"});
        let (path, out) = adapter.normalize("/v1/messages", Some(body.clone()));
        assert_eq!(path, "/v1/messages");
        assert_eq!(out, Some(body));
    }

    #[test]
    fn user_id_is_injected_and_stable() {
        let adapter = ClaudeAdapter;
        let config = serde_json::from_value(json!({"base_url": "https://a", "auth_token": "t"})).unwrap();
        let system = SystemSettings::default();

        let mut body = Some(json!({"model": "m", "messages": []}));
        adapter.backfill("/v1/messages", "/v1/messages", &mut body, &config, &system, true);
        let first = body.as_ref().unwrap()["metadata"]["user_id"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(first.starts_with("user_"));
        assert!(first.contains("_cli_proxy_account__session_"));

        let mut body2 = Some(json!({"model": "m"}));
        adapter.backfill("/v1/messages", "/v1/messages", &mut body2, &config, &system, false);
        let second = body2.as_ref().unwrap()["metadata"]["user_id"]
            .as_str()
            .unwrap()
            .to_string();
        assert_eq!(first, second);
    }

    #[test]
    fn existing_user_id_is_preserved() {
        let adapter = ClaudeAdapter;
        let config = serde_json::from_value(json!({"base_url": "https://a", "auth_token": "t"})).unwrap();
        let mut body = Some(json!({"metadata": {"user_id": "user_custom"}}));
        adapter.backfill(
            "/v1/messages",
            "/v1/messages",
            &mut body,
            &config,
            &SystemSettings::default(),
            true,
        );
        assert_eq!(body.unwrap()["metadata"]["user_id"], "user_custom");
    }

    #[test]
    fn headers_are_canonical() {
        let adapter = ClaudeAdapter;
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static("SomeClient/1.0"));
        adapter.apply_headers(&mut headers, &StreamPlan::passthrough(true));

        assert_eq!(
            headers.get(header::USER_AGENT).unwrap(),
            "claude-cli/2.0.0 (external, cli)"
        );
        assert_eq!(headers.get("x-app").unwrap(), "cli");
        assert_eq!(headers.get("anthropic-version").unwrap(), "2023-06-01");
        assert_eq!(headers.get("x-stainless-helper-method").unwrap(), "stream");
    }

    #[test]
    fn client_anthropic_version_wins() {
        let adapter = ClaudeAdapter;
        let mut headers = HeaderMap::new();
        headers.insert("anthropic-version", HeaderValue::from_static("2024-01-01"));
        adapter.apply_headers(&mut headers, &StreamPlan::passthrough(false));
        assert_eq!(headers.get("anthropic-version").unwrap(), "2024-01-01");
    }
}
