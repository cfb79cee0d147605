// Proxy pipeline - accept, transform, select, admit, forward, stream, record
//
// One handler serves every route of a family service. Canonical API POSTs
// run the full transform (path normalization, model rewrite, family
// backfill, redaction filter); anything else is forwarded as-is through
// the same select/admit/forward tail.
//
// STREAMING: upstream bytes are forwarded to the client as they arrive
// while a capped copy is teed off for the request log and the usage
// parser. When the plan says "synthesize", the upstream JSON is buffered
// by a chunk transformer and re-emitted as SSE.

pub mod error;
pub mod sse;

use crate::adapter::{apply_credentials, FamilyAdapter, SynthesisKind};
use crate::config::{ConfigDoc, ConfigStore};
use crate::events::generate_request_id;
use crate::family::Family;
use crate::filter::FilterEngine;
use crate::limiter::RateLimiter;
use crate::parser::extract_usage;
use crate::pool::{UpstreamOutcome, UpstreamPool};
use crate::storage::{RequestLog, RequestRecord, RequestStatus, MAX_CAPTURED_RESPONSE};
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, Method, Request, Response, StatusCode},
    response::IntoResponse,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::StreamExt;
use self::error::{ProxyError, ERR_CLIENT_DISCONNECT, ERR_RATE_WAIT_CANCEL, ERR_UPSTREAM_IO};
use self::sse::{
    body_wants_stream, is_streaming_content_type, ChatSseSynthesizer, ChunkTransformer,
    ResponsesSynthesizer,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Maximum request body size (50 MB).
const MAX_REQUEST_BODY_SIZE: usize = 50 * 1024 * 1024;

/// Shared state for one family service.
#[derive(Clone)]
pub struct ProxyState {
    pub family: Family,
    pub client: reqwest::Client,
    pub store: Arc<ConfigStore>,
    pub pool: Arc<UpstreamPool>,
    pub limiter: Arc<RateLimiter>,
    pub log: Arc<RequestLog>,
    pub adapter: Arc<dyn FamilyAdapter>,
}

impl ProxyState {
    pub fn new(family: Family, store: Arc<ConfigStore>) -> anyhow::Result<Self> {
        // Streams may run for minutes: connect is bounded, reads are not.
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            // Force HTTP/1.1 to avoid HTTP/2 connection resets with some providers
            .http1_only()
            .build()?;

        let hub = Arc::new(crate::events::RealtimeHub::new(family.service_name()));
        let pool = Arc::new(UpstreamPool::new(family, store.clone(), hub.clone()));
        let log = RequestLog::new(family, store.clone(), hub)?;

        Ok(Self {
            family,
            client,
            store,
            pool,
            limiter: Arc::new(RateLimiter::new()),
            log,
            adapter: crate::adapter::adapter_for(family),
        })
    }
}

/// Main proxy handler: everything that is not /health or /ws/realtime.
pub async fn proxy_handler(
    State(state): State<ProxyState>,
    req: Request<Body>,
) -> Response<Body> {
    match handle(state, req).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle(state: ProxyState, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
    let started = Instant::now();
    let request_id = generate_request_id();

    let (parts, body) = req.into_parts();
    let method = parts.method;
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(str::to_string);
    let headers = parts.headers;

    tracing::debug!("Proxying {} {} ({})", method, path, request_id);

    let body_bytes = axum::body::to_bytes(body, MAX_REQUEST_BODY_SIZE)
        .await
        .map_err(|err| ProxyError::BadRequest(format!("failed to read request body: {}", err)))?;

    let mut record = RequestRecord::new(
        request_id.clone(),
        state.family,
        method.to_string(),
        path.clone(),
    );
    if !body_bytes.is_empty() {
        record.original_body = Some(BASE64.encode(&body_bytes));
    }

    // ── Transform ────────────────────────────────────────────────────────
    let parsed: Option<Value> = if is_api_request(&method, &path) && !body_bytes.is_empty() {
        match serde_json::from_slice(&body_bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                return Err(fail_early(
                    &state,
                    record,
                    started,
                    ProxyError::BadRequest(err.to_string()),
                ));
            }
        }
    } else {
        None
    };

    let (canonical_path, mut body_json) = state.adapter.normalize(&path, parsed);

    let route = state.store.route_table();
    let model_original = body_json
        .as_ref()
        .and_then(|b| b.get("model"))
        .and_then(|m| m.as_str())
        .map(str::to_string);
    record.model_original = model_original.clone();

    let pinned = model_original
        .as_deref()
        .and_then(|model| route.config_for_model(state.family, model))
        .map(str::to_string);

    // ── Select ───────────────────────────────────────────────────────────
    let selection = match state.pool.select(pinned.as_deref()) {
        Ok(selection) => selection,
        Err(err) => return Err(fail_early(&state, record, started, ProxyError::from(err))),
    };
    record.channel = selection.name.clone();

    // Model rewrite runs after selection so config-source rules can match
    // the chosen config name.
    if let Some(model) = model_original.as_deref() {
        if let Some(target) = route.rewrite_model(state.family, model, Some(&selection.name)) {
            tracing::debug!("Model mapping: {} -> {}", model, target);
            if let Some(body) = body_json.as_mut() {
                body["model"] = Value::String(target.clone());
            }
            record.model_final = Some(target);
        }
    }
    if record.model_final.is_none() {
        record.model_final = record.model_original.clone();
    }

    let system = state.store.system();
    let client_wants_stream = body_json
        .as_ref()
        .map(body_wants_stream)
        .unwrap_or(false)
        || accept_is_stream(&headers);
    let plan = state.adapter.backfill(
        &canonical_path,
        &path,
        &mut body_json,
        &selection.config,
        &system,
        client_wants_stream,
    );

    // Filter runs last: redacted values may be rewritten model names
    let serialized = match &body_json {
        Some(value) => serde_json::to_vec(value)
            .map_err(|err| ProxyError::BadRequest(err.to_string()))?,
        None => body_bytes.to_vec(),
    };
    let filter = FilterEngine::from_doc(&state.store.get(ConfigDoc::Filter));
    let outgoing = filter.apply(&serialized);
    if !outgoing.is_empty() {
        record.filtered_body = Some(BASE64.encode(&outgoing));
    }

    // ── Forward setup ────────────────────────────────────────────────────
    let mut target_url = state
        .adapter
        .target_url(&selection.config.base_url, &canonical_path);
    if let Some(query) = query {
        target_url = format!("{}?{}", target_url, query);
    }

    let mut out_headers = forwardable_headers(&headers);
    state.adapter.apply_headers(&mut out_headers, &plan);
    if plan.upstream_stream || plan.client_stream {
        // Compressed SSE would have to be buffered to decode; refuse it
        out_headers.insert(
            header::ACCEPT_ENCODING,
            header::HeaderValue::from_static("identity"),
        );
    }
    apply_credentials(&mut out_headers, &selection.config);

    state.log.hub().request_started(
        &request_id,
        &selection.name,
        method.as_str(),
        &path,
        &target_url,
    );

    // From here, a dropped future (client gone) must still finalize the
    // record; the guard does that unless the stream task takes over.
    let mut guard = FinalizeGuard::new(state.clone(), record, started, ERR_RATE_WAIT_CANCEL);

    // ── Admit ────────────────────────────────────────────────────────────
    {
        let live: std::collections::HashSet<String> =
            state.store.upstreams(state.family).keys().cloned().collect();
        state.limiter.retain(&live);
    }
    let waited = state
        .limiter
        .acquire(&selection.name, selection.config.effective_rpm())
        .await;
    if !waited.is_zero() {
        tracing::debug!("Rate limiter held {} for {:?}", selection.name, waited);
    }
    guard.set_kind(ERR_CLIENT_DISCONNECT);

    // ── Forward ──────────────────────────────────────────────────────────
    let send = state
        .client
        .request(method.clone(), &target_url)
        .headers(out_headers)
        .body(outgoing)
        .send()
        .await;

    let response = match send {
        Ok(response) => response,
        Err(err) => {
            state
                .pool
                .record_result(&selection.name, UpstreamOutcome::TransportError);
            let record = guard.disarm();
            let err = ProxyError::UpstreamIo(err.to_string());
            return Err(fail_early(&state, record, started, err));
        }
    };

    let status = response.status();
    state
        .pool
        .record_result(&selection.name, UpstreamOutcome::Status(status.as_u16()));

    let mut record = guard.disarm();
    record.status_code = Some(status.as_u16());
    record.response_headers = header_map_to_btree(response.headers());

    // ── Stream / buffer ──────────────────────────────────────────────────
    let upstream_is_stream = is_streaming_content_type(response.headers());
    if !plan.client_stream && !upstream_is_stream {
        return buffered_response(state, record, response, started, request_id).await;
    }

    let transformer: Option<Box<dyn ChunkTransformer>> = match plan.synthesize {
        Some(SynthesisKind::ChatCompletions) => Some(Box::new(ChatSseSynthesizer::new())),
        Some(SynthesisKind::Responses) => Some(Box::new(ResponsesSynthesizer::new())),
        None => None,
    };
    Ok(stream_response(
        state,
        record,
        response,
        transformer,
        started,
        request_id,
    ))
}

/// Forward a streaming response, teeing a capped copy for the log and the
/// usage parser. The spawned task owns record finalization.
fn stream_response(
    state: ProxyState,
    mut record: RequestRecord,
    response: reqwest::Response,
    mut transformer: Option<Box<dyn ChunkTransformer>>,
    started: Instant,
    request_id: String,
) -> Response<Body> {
    let status = response.status();
    let synthesized = transformer.is_some();

    // Build the client response head before consuming the body
    let mut builder = Response::builder();
    if synthesized {
        // Synthesis always answers 200 SSE, even for an upstream 4xx whose
        // error envelope rides the first event.
        builder = builder
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache");
    } else {
        builder = builder.status(status);
        for (name, value) in response.headers() {
            if matches!(
                name.as_str(),
                "transfer-encoding" | "connection" | "content-length"
            ) {
                continue;
            }
            builder = builder.header(name, value);
        }
    }

    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(64);

    tokio::spawn(async move {
        let mut captured: Vec<u8> = Vec::new();
        let mut total_bytes = 0usize;
        let mut truncated = false;
        let mut first_chunk = true;
        let mut failure: Option<&'static str> = None;
        let mut byte_stream = response.bytes_stream();

        'read: while let Some(chunk) = byte_stream.next().await {
            match chunk {
                Ok(chunk) => {
                    let out = match transformer.as_mut() {
                        Some(t) => t.process(&chunk),
                        None => chunk.to_vec(),
                    };
                    if out.is_empty() {
                        continue;
                    }
                    total_bytes += out.len();
                    capture(&mut captured, &mut truncated, &out);
                    if truncated {
                        state.log.hub().mark_truncated(&request_id);
                    }
                    let elapsed = started.elapsed().as_millis() as u64;
                    if first_chunk {
                        record.advance(RequestStatus::Streaming);
                        state.log.hub().request_streaming(&request_id, elapsed);
                        first_chunk = false;
                    }
                    state.log.hub().response_chunk(
                        &request_id,
                        &String::from_utf8_lossy(&out),
                        elapsed,
                    );
                    if tx.send(Ok(Bytes::from(out))).await.is_err() {
                        // Client went away: stop reading the upstream. Not
                        // an upstream fault, so no failure accounting.
                        failure = Some(ERR_CLIENT_DISCONNECT);
                        break 'read;
                    }
                }
                Err(err) => {
                    tracing::error!("Upstream read error: {}", err);
                    state
                        .pool
                        .record_result(&record.channel, UpstreamOutcome::TransportError);
                    record.error_message = Some(err.to_string());
                    failure = Some(ERR_UPSTREAM_IO);
                    break 'read;
                }
            }
        }

        // Trailing synthesized bytes (buffered JSON that never completed
        // during process calls)
        if failure.is_none() {
            if let Some(tail) = transformer.as_mut().map(|t| t.flush()) {
                if !tail.is_empty() {
                    total_bytes += tail.len();
                    capture(&mut captured, &mut truncated, &tail);
                    let elapsed = started.elapsed().as_millis() as u64;
                    if first_chunk {
                        record.advance(RequestStatus::Streaming);
                        state.log.hub().request_streaming(&request_id, elapsed);
                    }
                    state.log.hub().response_chunk(
                        &request_id,
                        &String::from_utf8_lossy(&tail),
                        elapsed,
                    );
                    let _ = tx.send(Ok(Bytes::from(tail))).await;
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        record.duration_ms = duration_ms;
        record.timestamp_end = Some(chrono::Utc::now());
        record.truncated = truncated;
        record.usage = extract_usage(state.family, &captured);
        if !captured.is_empty() {
            record.response_content = Some(BASE64.encode(&captured));
        }

        let error = match failure {
            Some(kind) => {
                record.advance(RequestStatus::Failed);
                let message = record.error_message.clone().unwrap_or_else(|| kind.to_string());
                record.error_message = Some(message.clone());
                Some(message)
            }
            None if status.as_u16() < 400 => {
                record.advance(RequestStatus::Completed);
                None
            }
            None => {
                // Upstream error bodies pass through; the record still
                // counts the request as failed.
                record.advance(RequestStatus::Failed);
                let message = format!("HTTP {}", status.as_u16());
                record.error_message = Some(message.clone());
                Some(message)
            }
        };

        state.log.hub().request_finished(
            &request_id,
            Some(status.as_u16()),
            duration_ms,
            error.as_deref(),
        );
        state.log.append(record);

        tracing::debug!(
            "Stream finished: {} bytes in {}ms",
            total_bytes,
            duration_ms
        );
    });

    let stream = ReceiverStream::new(rx);
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Non-streaming tail: collect the full upstream body and answer once.
async fn buffered_response(
    state: ProxyState,
    mut record: RequestRecord,
    response: reqwest::Response,
    started: Instant,
    request_id: String,
) -> Result<Response<Body>, ProxyError> {
    let status = response.status();
    let response_headers = response.headers().clone();

    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            state
                .pool
                .record_result(&record.channel, UpstreamOutcome::TransportError);
            let err = ProxyError::UpstreamIo(err.to_string());
            return Err(fail_early(&state, record, started, err));
        }
    };

    let duration_ms = started.elapsed().as_millis() as u64;
    let mut captured = Vec::new();
    let mut truncated = false;
    capture(&mut captured, &mut truncated, &bytes);

    record.duration_ms = duration_ms;
    record.timestamp_end = Some(chrono::Utc::now());
    record.truncated = truncated;
    record.usage = extract_usage(state.family, &captured);
    if !captured.is_empty() {
        record.response_content = Some(BASE64.encode(&captured));
    }

    let error = if status.as_u16() < 400 {
        record.advance(RequestStatus::Completed);
        None
    } else {
        record.advance(RequestStatus::Failed);
        let message = format!("HTTP {}", status.as_u16());
        record.error_message = Some(message.clone());
        Some(message)
    };
    state
        .log
        .hub()
        .request_finished(&request_id, Some(status.as_u16()), duration_ms, error.as_deref());
    state.log.append(record);

    let mut builder = Response::builder().status(status);
    for (name, value) in response_headers.iter() {
        if matches!(name.as_str(), "transfer-encoding" | "connection") {
            continue;
        }
        builder = builder.header(name, value);
    }
    Ok(builder
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

/// Append to the capped capture buffer, flagging truncation.
fn capture(captured: &mut Vec<u8>, truncated: &mut bool, chunk: &[u8]) {
    if captured.len() >= MAX_CAPTURED_RESPONSE {
        *truncated = true;
        return;
    }
    let remaining = MAX_CAPTURED_RESPONSE - captured.len();
    if chunk.len() > remaining {
        captured.extend_from_slice(&chunk[..remaining]);
        *truncated = true;
    } else {
        captured.extend_from_slice(chunk);
    }
}

/// Finalize a record for a request that failed before the streaming task
/// took over, then surface the error to the client.
fn fail_early(
    state: &ProxyState,
    mut record: RequestRecord,
    started: Instant,
    err: ProxyError,
) -> ProxyError {
    record.duration_ms = started.elapsed().as_millis() as u64;
    record.timestamp_end = Some(chrono::Utc::now());
    record.status_code = Some(err.status().as_u16());
    record.advance(RequestStatus::Failed);
    record.error_message = Some(format!("{}: {}", err.kind(), err));
    if !record.channel.is_empty() {
        state.log.hub().request_finished(
            &record.request_id,
            record.status_code,
            record.duration_ms,
            record.error_message.as_deref(),
        );
    }
    state.log.append(record);
    err
}

/// Finalizes the request record if the handler future is dropped between
/// admission and the stream task taking over (client disconnect during a
/// rate-limit wait or upstream connect).
struct FinalizeGuard {
    inner: Option<(ProxyState, RequestRecord, Instant)>,
    kind: &'static str,
}

impl FinalizeGuard {
    fn new(state: ProxyState, record: RequestRecord, started: Instant, kind: &'static str) -> Self {
        Self {
            inner: Some((state, record, started)),
            kind,
        }
    }

    fn set_kind(&mut self, kind: &'static str) {
        self.kind = kind;
    }

    fn disarm(mut self) -> RequestRecord {
        let (_, record, _) = self.inner.take().expect("guard already disarmed");
        record
    }
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        let Some((state, mut record, started)) = self.inner.take() else {
            return;
        };
        record.duration_ms = started.elapsed().as_millis() as u64;
        record.timestamp_end = Some(chrono::Utc::now());
        record.advance(RequestStatus::Failed);
        record.error_message = Some(self.kind.to_string());
        state.log.hub().request_finished(
            &record.request_id,
            None,
            record.duration_ms,
            record.error_message.as_deref(),
        );
        state.log.append(record);
    }
}

/// POSTs to the API surface get the full transform; anything else is
/// forwarded raw.
fn is_api_request(method: &Method, path: &str) -> bool {
    if method != Method::POST {
        return false;
    }
    let path = path.trim_matches('/').to_ascii_lowercase();
    path.ends_with("messages") || path.ends_with("chat/completions") || path.ends_with("responses")
}

/// Streaming intent carried in headers rather than the body.
fn accept_is_stream(headers: &HeaderMap) -> bool {
    let header_contains = |name: &str, needle: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains(needle))
    };
    header_contains("accept", "text/event-stream")
        || header_contains("content-type", "application/x-ndjson")
        || header_contains("x-stainless-helper-method", "stream")
}

/// Copy client headers worth forwarding; hop-by-hop and length headers are
/// recomputed, credentials are replaced later.
fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if matches!(
            name.as_str(),
            "host" | "content-length" | "connection" | "transfer-encoding" | "expect" | "accept-encoding"
        ) {
            continue;
        }
        out.insert(name.clone(), value.clone());
    }
    out
}

fn header_map_to_btree(headers: &reqwest::header::HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}
