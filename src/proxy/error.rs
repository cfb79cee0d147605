//! Proxy error types and client-facing responses
//!
//! Every kind maps to a fixed HTTP status and a stable `kind` string that
//! clients can match on. Upstream non-2xx responses are not errors here -
//! they pass through unchanged, body included.

use crate::pool::SelectionError;
use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

/// Error kind recorded when the client goes away mid-stream. Never sent as
/// a response (the socket is gone); it only appears in request records.
pub const ERR_CLIENT_DISCONNECT: &str = "ERR_CLIENT_DISCONNECT";

/// Error kind recorded for transport failures, shared with the response
/// path below.
pub const ERR_UPSTREAM_IO: &str = "ERR_UPSTREAM_IO";

/// Error kind recorded when a rate-limit wait is cancelled by the client.
pub const ERR_RATE_WAIT_CANCEL: &str = "ERR_RATE_WAIT_CANCEL";

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("request body is not valid JSON: {0}")]
    BadRequest(String),

    #[error("active-first mode has no active upstream config")]
    NoActive,

    #[error("all eligible upstream configs are excluded")]
    UpstreamUnavailable,

    #[error("upstream transport error: {0}")]
    UpstreamIo(String),

    #[error("rate limit admission cancelled")]
    RateWaitCancelled,
}

impl ProxyError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::BadRequest(_) => "ERR_BAD_REQUEST",
            ProxyError::NoActive => "ERR_NO_ACTIVE",
            ProxyError::UpstreamUnavailable => "ERR_UPSTREAM_UNAVAIL",
            ProxyError::UpstreamIo(_) => ERR_UPSTREAM_IO,
            ProxyError::RateWaitCancelled => ERR_RATE_WAIT_CANCEL,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::NoActive => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamIo(_) => StatusCode::BAD_GATEWAY,
            // Nginx's "client closed request"
            ProxyError::RateWaitCancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        }
    }
}

impl From<SelectionError> for ProxyError {
    fn from(err: SelectionError) -> Self {
        match err {
            SelectionError::NoActiveUpstream => ProxyError::NoActive,
            SelectionError::UpstreamUnavailable => ProxyError::UpstreamUnavailable,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        tracing::warn!("Proxy error {}: {}", self.kind(), self);
        let body = json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_fixed_statuses() {
        assert_eq!(ProxyError::BadRequest("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ProxyError::NoActive.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ProxyError::UpstreamUnavailable.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ProxyError::UpstreamIo("t".into()).status(), StatusCode::BAD_GATEWAY);
        assert_eq!(ProxyError::RateWaitCancelled.status().as_u16(), 499);
    }

    #[test]
    fn selection_errors_convert() {
        assert_eq!(
            ProxyError::from(SelectionError::NoActiveUpstream).kind(),
            "ERR_NO_ACTIVE"
        );
        assert_eq!(
            ProxyError::from(SelectionError::UpstreamUnavailable).kind(),
            "ERR_UPSTREAM_UNAVAIL"
        );
    }
}
