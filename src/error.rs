//! Error types for the gateway.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Main error type for gateway operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Limiter snapshot encoding or storage errors
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Redis errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Outbound HTTP errors
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Outbound WebSocket errors
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// Transaction log errors
    #[error("Transaction log error: {0}")]
    TxLog(String),

    /// WAF endpoint errors
    #[error("WAF error: {0}")]
    Waf(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Terminal outcomes that stop a request before (or instead of) forwarding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("malformed JSON-RPC request: {0}")]
    MalformedRequest(String),

    #[error("request body too large")]
    BodyTooLarge,

    #[error("too many requests ({window})")]
    RateLimited { window: String },

    #[error("batch cost {cost} exceeds ceiling {ceiling}")]
    BatchTooExpensive { cost: u64, ceiling: u64 },

    #[error("gateway is saturated")]
    GatewayBusy,

    #[error("upstream unavailable")]
    UpstreamUnavailable,

    #[error("forbidden")]
    Forbidden,

    #[error("websocket upgrade not allowed on this route")]
    WebSocketNotAllowed,
}

impl Rejection {
    /// HTTP status the rejection is reported with.
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            Rejection::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Rejection::RateLimited { .. }
            | Rejection::BatchTooExpensive { .. }
            | Rejection::GatewayBusy => StatusCode::TOO_MANY_REQUESTS,
            Rejection::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            Rejection::Forbidden => StatusCode::FORBIDDEN,
            Rejection::WebSocketNotAllowed => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match self {
            // Only the size cap carries a body.
            Rejection::BodyTooLarge => {
                (self.status(), "Request body too large").into_response()
            }
            other => other.status().into_response(),
        }
    }
}
