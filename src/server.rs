//! Per-family HTTP service setup
//!
//! Each family binds 127.0.0.1 on its compiled-in port and serves:
//! - the proxy catch-all (canonical API routes and everything else)
//! - GET /health with the active config name
//! - GET /ws/realtime streaming request lifecycle events as JSON
//! - the Codex helper endpoints (build-body, quick-send)

use crate::adapter::{apply_credentials, codex, FamilyAdapter};
use crate::config::ConfigStore;
use crate::family::Family;
use crate::proxy::error::ProxyError;
use crate::proxy::{proxy_handler, ProxyState};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Start one family service. Runs until the shutdown signal fires.
pub async fn run_family(
    family: Family,
    store: Arc<ConfigStore>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let state = ProxyState::new(family, store)?;

    let mut app = Router::new()
        .route("/health", get(health))
        .route("/ws/realtime", get(ws_realtime));
    if family == Family::Codex {
        app = app
            .route("/api/codex/build-body", post(codex_build_body))
            .route("/api/codex/quick-send", post(codex_quick_send));
    }
    let app = app.fallback(proxy_handler).with_state(state);

    let addr = format!("127.0.0.1:{}", family.port());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {} service to {}", family, addr))?;
    tracing::info!("{} proxy listening on http://{}", family, addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .await
        .with_context(|| format!("{} service failed", family))?;

    tracing::info!("{} proxy shut down", family);
    Ok(())
}

async fn health(State(state): State<ProxyState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "pid": std::process::id(),
        "active_config": state.store.active_upstream(state.family),
    }))
}

/// Websocket endpoint for realtime request events. The subscriber gets a
/// ring snapshot on connect, then live events as they happen. Incoming
/// messages are only read to keep the connection alive.
async fn ws_realtime(
    ws: WebSocketUpgrade,
    State(state): State<ProxyState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_realtime(socket, state))
}

async fn handle_realtime(socket: WebSocket, state: ProxyState) {
    let mut events = state.log.subscribe();
    let (mut sender, mut receiver) = socket.split();

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut recv_task => send_task.abort(),
        _ = &mut send_task => recv_task.abort(),
    }
    tracing::debug!("Realtime subscriber disconnected");
}

/// Helper: show what the Codex backfill would send upstream for a given
/// payload, without sending it.
async fn codex_build_body(
    State(state): State<ProxyState>,
    Json(payload): Json<Value>,
) -> Json<Value> {
    let mut map = payload.as_object().cloned().unwrap_or_default();
    codex::backfill_responses_body(&mut map, &state.store.system());

    let plan = crate::adapter::StreamPlan {
        upstream_stream: true,
        client_stream: true,
        synthesize: None,
    };
    let mut headers = axum::http::HeaderMap::new();
    state.adapter.apply_headers(&mut headers, &plan);
    headers.insert(
        axum::http::header::ACCEPT_ENCODING,
        axum::http::HeaderValue::from_static("identity"),
    );

    let header_obj: serde_json::Map<String, Value> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), json!(v)))
        })
        .collect();

    Json(json!({
        "json": Value::Object(map),
        "headers": Value::Object(header_obj),
    }))
}

/// Helper: send a backfilled payload to the currently selected upstream
/// and return the status plus the first lines of the response.
async fn codex_quick_send(
    State(state): State<ProxyState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ProxyError> {
    const MAX_LINES: usize = 50;

    let mut map = payload.as_object().cloned().unwrap_or_default();
    codex::backfill_responses_body(&mut map, &state.store.system());

    let selection = state.pool.select(None).map_err(ProxyError::from)?;
    let url = state
        .adapter
        .target_url(&selection.config.base_url, "/v1/responses");

    let plan = crate::adapter::StreamPlan {
        upstream_stream: true,
        client_stream: true,
        synthesize: None,
    };
    let mut headers = axum::http::HeaderMap::new();
    state.adapter.apply_headers(&mut headers, &plan);
    headers.insert(
        axum::http::header::ACCEPT_ENCODING,
        axum::http::HeaderValue::from_static("identity"),
    );
    apply_credentials(&mut headers, &selection.config);

    let response = state
        .client
        .post(&url)
        .headers(headers)
        .json(&Value::Object(map))
        .send()
        .await
        .map_err(|err| ProxyError::UpstreamIo(err.to_string()))?;

    let status_code = response.status().as_u16();
    let text = response
        .text()
        .await
        .map_err(|err| ProxyError::UpstreamIo(err.to_string()))?;
    let lines: Vec<&str> = text.lines().take(MAX_LINES).collect();

    Ok(Json(json!({
        "status_code": status_code,
        "lines": lines,
    })))
}
