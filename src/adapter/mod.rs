// Family adapters - the per-family slice of the request pipeline
//
// The pipeline itself is family-agnostic: accept, transform, select,
// admit, forward, stream, record. Everything protocol-shaped lives behind
// this trait: canonical paths, alternate-endpoint rewrites, body backfill,
// header normalization, and the streaming plan.

pub mod claude;
pub mod codex;
pub mod legacy;

pub use claude::ClaudeAdapter;
pub use codex::CodexAdapter;
pub use legacy::LegacyAdapter;

use crate::config::{Credential, SystemSettings, UpstreamConfig};
use crate::family::Family;
use axum::http::{header, HeaderMap, HeaderValue};
use serde_json::Value;
use std::sync::Arc;

/// Which synthesizer (if any) shapes the response for the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisKind {
    /// OpenAI `chat.completion.chunk` events from buffered JSON.
    ChatCompletions,
    /// OpenAI Responses lifecycle events from buffered JSON.
    Responses,
}

/// How a request's response travels: whether the upstream is asked to
/// stream, whether the client receives a stream, and whether that stream
/// is synthesized from buffered JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPlan {
    pub upstream_stream: bool,
    pub client_stream: bool,
    pub synthesize: Option<SynthesisKind>,
}

impl StreamPlan {
    /// Plain passthrough: stream iff the client asked for it.
    pub fn passthrough(stream: bool) -> Self {
        Self {
            upstream_stream: stream,
            client_stream: stream,
            synthesize: None,
        }
    }
}

pub trait FamilyAdapter: Send + Sync {
    fn family(&self) -> Family;

    /// Rewrite an alternate endpoint to the family's canonical one,
    /// adapting the body shape along the way. Returns the canonical path
    /// and the (possibly rebuilt) body.
    fn normalize(&self, path: &str, body: Option<Value>) -> (String, Option<Value>);

    /// Family-specific body backfill, applied after model rewriting.
    /// Decides the streaming plan for the request.
    fn backfill(
        &self,
        canonical_path: &str,
        client_path: &str,
        body: &mut Option<Value>,
        config: &UpstreamConfig,
        system: &SystemSettings,
        client_wants_stream: bool,
    ) -> StreamPlan;

    /// Compose the upstream URL for a normalized path.
    fn target_url(&self, base_url: &str, path: &str) -> String {
        join_url(base_url, path)
    }

    /// Family-canonical header set, applied after the incoming headers are
    /// copied over.
    fn apply_headers(&self, headers: &mut HeaderMap, plan: &StreamPlan);
}

pub fn adapter_for(family: Family) -> Arc<dyn FamilyAdapter> {
    match family {
        Family::Claude => Arc::new(ClaudeAdapter),
        Family::Codex => Arc::new(CodexAdapter),
        Family::Legacy => Arc::new(LegacyAdapter),
    }
}

/// Join a base URL and a path without doubling slashes.
pub fn join_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

/// Install the selected config's credential, dropping whatever the client
/// sent. Exactly one of Authorization / x-api-key goes upstream.
pub fn apply_credentials(headers: &mut HeaderMap, config: &UpstreamConfig) {
    headers.remove(header::AUTHORIZATION);
    headers.remove("x-api-key");
    match config.credential() {
        Some(Credential::AuthToken(token)) => {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(header::AUTHORIZATION, value);
            }
        }
        Some(Credential::ApiKey(key)) => {
            if let Ok(value) = HeaderValue::from_str(&key) {
                headers.insert("x-api-key", value);
            }
        }
        None => {}
    }
}

/// Set a header only when the incoming request did not already carry it.
pub(crate) fn set_default(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    if !headers.contains_key(&name) {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name, value);
        }
    }
}

/// Force a header to the family-canonical value.
pub(crate) fn set_forced(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}
