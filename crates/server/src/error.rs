use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Failure classes a gateway client can hit. Variants follow the stream
/// lifecycle rather than generic REST categories; each knows its HTTP
/// status and wire code.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("stream already running")]
    AlreadyRunning,

    #[error("stream not running")]
    NotRunning,

    /// A gated request arrived without a usable credential.
    #[error("authentication required: {0}")]
    AuthRequired(String),

    #[error("invalid token: {0}")]
    TokenInvalid(String),

    #[error("token expired")]
    TokenExpired,

    #[error("API key rejected")]
    ApiKeyRejected,

    /// Token/feed or token/address mismatch.
    #[error("access denied: {0}")]
    Forbidden(String),

    #[error("unknown stream: {0}")]
    UnknownStream(String),

    /// The feed exists but its playlist has not appeared within the
    /// readiness window. Distinct code so players know to retry.
    #[error("stream not ready: {0}")]
    StreamNotReady(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::AlreadyRunning => "already_running",
            Self::NotRunning => "not_running",
            Self::AuthRequired(_) => "auth_required",
            Self::TokenInvalid(_) => "token_invalid",
            Self::TokenExpired => "token_expired",
            Self::ApiKeyRejected => "api_key_rejected",
            Self::Forbidden(_) => "forbidden",
            Self::UnknownStream(_) => "unknown_stream",
            Self::StreamNotReady(_) => "stream_not_ready",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::AlreadyRunning | Self::NotRunning => {
                StatusCode::BAD_REQUEST
            }
            Self::AuthRequired(_)
            | Self::TokenInvalid(_)
            | Self::TokenExpired
            | Self::ApiKeyRejected => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::UnknownStream(_) | Self::StreamNotReady(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": { "code": self.code(), "message": self.to_string() }
        });
        (self.status(), Json(body)).into_response()
    }
}
