//! Codex family adapter - OpenAI Responses upstream
//!
//! Canonical path is `/v1/responses`. Some clients (Droid, Factory) post a
//! chat-completions-shaped payload or omit fields the Responses API
//! requires, so the adapter force-fills the body: `store=false`,
//! `stream=true`, a guaranteed instructions block, reasoning and verbosity
//! defaults from system settings, and an allow-list prune of fields
//! upstreams are known to reject (`max_output_tokens`, `service_tier`, ...).

use super::{join_url, set_default, set_forced, FamilyAdapter, StreamPlan};
use crate::config::{SystemSettings, UpstreamConfig};
use crate::family::Family;
use axum::http::{header, HeaderMap, HeaderName};
use serde_json::{json, Map, Value};

/// The identity header line every instructions block must start with.
pub const PRIMARY_INSTRUCTION: &str = "You are Codex, based on GPT-5. You are running as a coding agent in the Codex CLI on a user's computer.";

/// Fields the Responses upstreams accept; everything else is pruned.
const ALLOWED_KEYS: &[&str] = &[
    "model",
    "instructions",
    "input",
    "tool_choice",
    "parallel_tool_calls",
    "reasoning",
    "store",
    "stream",
    "include",
    "prompt_cache_key",
    "tools",
    "text",
];

pub struct CodexAdapter;

impl FamilyAdapter for CodexAdapter {
    fn family(&self) -> Family {
        Family::Codex
    }

    fn normalize(&self, path: &str, body: Option<Value>) -> (String, Option<Value>) {
        // Chat-completions payloads are converted to Responses input blocks
        // regardless of the path they were posted to.
        let is_chat_shape = body
            .as_ref()
            .and_then(|b| b.get("messages"))
            .is_some_and(|m| m.is_array());
        if is_chat_shape {
            return ("/v1/responses".to_string(), body.map(chat_messages_to_input));
        }
        let trimmed = path.trim_matches('/').to_ascii_lowercase();
        if trimmed == "responses" || trimmed == "v1/responses" {
            return ("/v1/responses".to_string(), body);
        }
        (path.to_string(), body)
    }

    fn backfill(
        &self,
        canonical_path: &str,
        _client_path: &str,
        body: &mut Option<Value>,
        _config: &UpstreamConfig,
        system: &SystemSettings,
        client_wants_stream: bool,
    ) -> StreamPlan {
        if !canonical_path.ends_with("responses") {
            return StreamPlan::passthrough(client_wants_stream);
        }
        if let Some(Value::Object(map)) = body {
            backfill_responses_body(map, system);
        }
        // The Codex upstream always streams; the client gets the SSE as-is.
        StreamPlan {
            upstream_stream: true,
            client_stream: true,
            synthesize: None,
        }
    }

    fn target_url(&self, base_url: &str, path: &str) -> String {
        if path.trim_matches('/').ends_with("responses") {
            if let Ok(mut url) = reqwest::Url::parse(base_url) {
                let ensured = compose_responses_path(url.path());
                url.set_path(&ensured);
                return url.to_string();
            }
        }
        join_url(base_url, path)
    }

    fn apply_headers(&self, headers: &mut HeaderMap, _plan: &StreamPlan) {
        set_forced(
            headers,
            HeaderName::from_static("openai-beta"),
            "responses=experimental",
        );
        set_forced(headers, header::ACCEPT, "text/event-stream");
        set_default(headers, header::CONTENT_TYPE, "application/json");
    }
}

/// Guarantee the CLI-style preamble is present and on the first line.
pub fn ensure_primary_instruction(text: Option<&str>) -> String {
    let stripped = text.map(str::trim).unwrap_or("");
    if stripped.is_empty() {
        return PRIMARY_INSTRUCTION.to_string();
    }
    if stripped.starts_with(PRIMARY_INSTRUCTION) {
        return stripped.to_string();
    }
    format!("{}\n\n{}", PRIMARY_INSTRUCTION, stripped)
}

/// Apply every Responses-body backfill rule in place. Shared with the
/// `/api/codex/build-body` helper endpoint.
pub fn backfill_responses_body(map: &mut Map<String, Value>, system: &SystemSettings) {
    normalize_input(map);

    let instructions = map
        .get("instructions")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    map.insert(
        "instructions".to_string(),
        json!(ensure_primary_instruction(instructions.as_deref())),
    );

    if map.get("store").map_or(true, |v| v.is_null()) {
        map.insert("store".to_string(), json!(false));
    }
    if map.get("stream").map_or(true, |v| v.is_null()) {
        map.insert("stream".to_string(), json!(true));
    }
    if map.get("tool_choice").map_or(true, |v| v.is_null()) {
        map.insert("tool_choice".to_string(), json!("auto"));
    }

    let model = map
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    // Reasoning effort + summary defaults
    let mut reasoning = match map.get("reasoning") {
        Some(Value::Object(r)) => r.clone(),
        _ => Map::new(),
    };
    reasoning.insert("effort".to_string(), json!(system.default_effort(&model)));
    let summary = match reasoning.get("summary").and_then(|v| v.as_str()) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Some("auto".to_string()),
            "detailed" => Some("detailed".to_string()),
            _ => None,
        },
        None => None,
    };
    match summary.or_else(|| {
        let default = system.default_summary(&model);
        (!default.is_empty()).then(|| default.to_string())
    }) {
        Some(value) => {
            reasoning.insert("summary".to_string(), json!(value));
        }
        None => {
            reasoning.remove("summary");
        }
    }
    map.insert("reasoning".to_string(), Value::Object(reasoning));

    // Text output settings
    let mut text = match map.get("text") {
        Some(Value::Object(t)) => t.clone(),
        _ => Map::new(),
    };
    text.insert("format".to_string(), json!({"type": "text"}));
    let verbosity = system.default_verbosity(&model);
    if !verbosity.is_empty() {
        text.insert("verbosity".to_string(), json!(verbosity));
    }
    map.insert("text".to_string(), Value::Object(text));

    // Prune fields the upstream rejects
    map.retain(|key, _| ALLOWED_KEYS.contains(&key.as_str()));
}

/// Coerce the `input` field into a list of role/content blocks.
fn normalize_input(map: &mut Map<String, Value>) {
    let normalized = match map.get("input") {
        Some(Value::String(text)) if !text.trim().is_empty() => Some(json!([{
            "role": "user",
            "content": [{"type": "input_text", "text": text}]
        }])),
        Some(Value::Object(block)) => Some(json!([Value::Object(block.clone())])),
        Some(Value::Array(items)) => {
            let converted: Vec<Value> = items
                .iter()
                .filter_map(|item| match item {
                    Value::String(text) => Some(json!({
                        "role": "user",
                        "content": [{"type": "input_text", "text": text}]
                    })),
                    Value::Object(_) => Some(item.clone()),
                    _ => None,
                })
                .collect();
            Some(Value::Array(converted))
        }
        _ => None,
    };
    if let Some(value) = normalized {
        map.insert("input".to_string(), value);
    }
}

/// Convert a chat-completions payload into a Responses one: each message
/// becomes an input block of `input_text` parts.
fn chat_messages_to_input(body: Value) -> Value {
    let Value::Object(mut map) = body else {
        return body;
    };
    let messages = match map.remove("messages") {
        Some(Value::Array(messages)) => messages,
        _ => Vec::new(),
    };

    let input: Vec<Value> = messages
        .into_iter()
        .filter_map(|message| {
            let map = message.as_object()?;
            let role = map.get("role").and_then(|r| r.as_str()).unwrap_or("user");
            let mut parts: Vec<Value> = Vec::new();
            match map.get("content") {
                Some(Value::String(text)) => {
                    parts.push(json!({"type": "input_text", "text": text}))
                }
                Some(Value::Array(items)) => {
                    for item in items {
                        match item {
                            Value::String(text) => {
                                parts.push(json!({"type": "input_text", "text": text}))
                            }
                            Value::Object(part) => {
                                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                                    parts.push(json!({"type": "input_text", "text": text}));
                                }
                            }
                            _ => {}
                        }
                    }
                }
                Some(other) if !other.is_null() => {
                    parts.push(json!({"type": "input_text", "text": other.to_string()}))
                }
                _ => {}
            }
            if parts.is_empty() {
                parts.push(json!({"type": "input_text", "text": ""}));
            }
            Some(json!({"role": role, "content": parts}))
        })
        .collect();

    map.insert("input".to_string(), Value::Array(input));
    Value::Object(map)
}

/// Ensure the upstream path ends in `/v1/responses`, respecting a base URL
/// that already carries a path prefix (e.g. `https://host/codex/v1`).
fn compose_responses_path(base_path: &str) -> String {
    let base = base_path.trim_end_matches('/');
    let base = if base.is_empty() || base.starts_with('/') {
        base.to_string()
    } else {
        format!("/{}", base)
    };
    if base.is_empty() {
        return "/v1/responses".to_string();
    }
    if base.ends_with("/v1/responses") {
        return base;
    }
    if base.ends_with("/v1") {
        return format!("{}/responses", base);
    }
    format!("{}/v1/responses", base)
}
