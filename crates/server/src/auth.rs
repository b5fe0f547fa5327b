use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::HeaderMap;
use axum::http::request::Parts;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use streamgate_core::id::generate_viewer_id;

use crate::error::GatewayError;
use crate::state::AppState;

/// Playback token claims. `jti` doubles as the viewer identifier when a
/// heartbeat arrives without an explicit one.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StreamClaims {
    pub stream_id: String,
    pub iat: usize,
    pub exp: usize,
    pub jti: String,
    /// When set, the token only verifies against this client address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// Mint a playback token for one feed.
pub fn create_stream_token(
    stream_id: &str,
    expires_hours: i64,
    client_ip: Option<&str>,
    secret: &str,
) -> Result<String, GatewayError> {
    let now = chrono::Utc::now();
    let exp = now
        .checked_add_signed(chrono::Duration::hours(expires_hours))
        .ok_or_else(|| GatewayError::Internal("time overflow".into()))?;

    let claims = StreamClaims {
        stream_id: stream_id.to_string(),
        iat: now.timestamp() as usize,
        exp: exp.timestamp() as usize,
        jti: generate_viewer_id(),
        ip: client_ip.map(String::from),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| GatewayError::Internal(format!("token encoding failed: {e}")))
}

/// Verify a playback token against a feed and, when both sides carry one,
/// the client address. Signature/expiry failures are 401; a feed or address
/// mismatch is 403.
pub fn verify_stream_token(
    token: &str,
    stream_id: &str,
    client_ip: Option<&str>,
    secret: &str,
) -> Result<StreamClaims, GatewayError> {
    let data = decode::<StreamClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => GatewayError::TokenExpired,
        _ => GatewayError::TokenInvalid(e.to_string()),
    })?;

    let claims = data.claims;

    if claims.stream_id != stream_id {
        return Err(GatewayError::Forbidden(
            "token not valid for this stream".into(),
        ));
    }

    if let (Some(bound), Some(client)) = (claims.ip.as_deref(), client_ip) {
        if bound != client {
            return Err(GatewayError::Forbidden(
                "token not valid for this address".into(),
            ));
        }
    }

    Ok(claims)
}

/// Token from the `token` query value or a Bearer header; players use the
/// query form, API clients the header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        })
}

/// Verify access to a feed and hand back the viewer identifier (the token's
/// `jti`).
pub fn verify_stream_access(
    stream_id: &str,
    token: Option<&str>,
    client_ip: Option<&str>,
    secret: &str,
) -> Result<String, GatewayError> {
    let token = token.ok_or_else(|| {
        GatewayError::AuthRequired(
            "stream token required, request one from the token endpoint".into(),
        )
    })?;
    let claims = verify_stream_token(token, stream_id, client_ip, secret)?;
    Ok(claims.jti)
}

/// Peer address, when the server was built with connect-info. Absent under
/// test harnesses, so extraction never fails.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub Option<SocketAddr>);

impl ClientAddr {
    pub fn ip_string(&self) -> Option<String> {
        self.0.map(|addr| addr.ip().to_string())
    }
}

impl<S> FromRequestParts<S> for ClientAddr
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        Ok(ClientAddr(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        ))
    }
}

/// Management-endpoint guard: `X-API-Key` must match the configured key.
#[derive(Debug, Clone)]
pub struct ApiKeyAuth;

impl FromRequestParts<AppState> for ApiKeyAuth {
    type Rejection = GatewayError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let provided = parts
            .headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| GatewayError::AuthRequired("API key required".into()))?;

        if provided != state.api_key {
            return Err(GatewayError::ApiKeyRejected);
        }
        Ok(ApiKeyAuth)
    }
}
