use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use streamgate_db::repo::streams;
use streamgate_supervisor::SupervisorError;
use streamgate_supervisor::probe::{self, ProbeResult};

use crate::auth::{
    ApiKeyAuth, ClientAddr, bearer_token, create_stream_token, verify_stream_access,
    verify_stream_token,
};
use crate::error::GatewayError;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/hls/{stream_id}/{filename}", get(crate::hls::serve_hls))
        .nest("/api", api_router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        // Management (API key)
        .route("/streams/{id}/start", post(start_stream))
        .route("/streams/{id}/stop", post(stop_stream))
        .route("/streams/{id}/status", get(stream_status))
        .route("/streams/{id}/analyze", post(analyze_stream))
        .route("/streams/{id}/snapshot", post(capture_snapshot))
        .route("/streams/{id}/token", get(issue_stream_token))
        // Playback (stream token)
        .route("/streams/{id}/heartbeat", post(viewer_heartbeat))
        .route("/streams/{id}/disconnect", post(viewer_disconnect))
        .route("/tokens/verify", post(verify_token))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, GatewayError> {
    sqlx::query("SELECT 1")
        .execute(&state.db)
        .await
        .map_err(|e| GatewayError::Internal(format!("database check failed: {e}")))?;

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
    }))
}

// ---------------------------------------------------------------------------
// Stream control (management)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct StatusResponse {
    stream_id: String,
    status: String,
    running: bool,
    viewer_count: usize,
    uptime_seconds: Option<u64>,
    pid: Option<u32>,
    reconnect_count: u32,
}

async fn status_response(
    state: &AppState,
    stream_id: &str,
) -> Result<StatusResponse, GatewayError> {
    let row = require_stream(state, stream_id).await?;
    let snapshot = state.supervisor.get_status(stream_id).await;
    Ok(StatusResponse {
        stream_id: stream_id.to_string(),
        status: row.status,
        running: snapshot.running,
        viewer_count: snapshot.viewer_count,
        uptime_seconds: snapshot.uptime_seconds,
        pid: snapshot.pid,
        reconnect_count: snapshot.reconnect_count,
    })
}

async fn require_stream(
    state: &AppState,
    stream_id: &str,
) -> Result<streams::StreamRow, GatewayError> {
    streams::get_stream(&state.db, stream_id)
        .await
        .map_err(|e| GatewayError::Internal(format!("db error: {e}")))?
        .ok_or_else(|| GatewayError::UnknownStream(stream_id.to_string()))
}

async fn start_stream(
    _auth: ApiKeyAuth,
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> Result<Json<StatusResponse>, GatewayError> {
    require_stream(&state, &stream_id).await?;

    if state.supervisor.is_running(&stream_id).await {
        return Err(GatewayError::AlreadyRunning);
    }

    if let Err(e) = state.supervisor.start_stream(&stream_id, None).await {
        let detail = match require_stream(&state, &stream_id).await {
            Ok(row) => row.last_error.unwrap_or_else(|| e.to_string()),
            Err(_) => e.to_string(),
        };
        return Err(match e {
            SupervisorError::StreamNotFound(_) => GatewayError::UnknownStream(detail),
            _ => GatewayError::Internal(detail),
        });
    }

    Ok(Json(status_response(&state, &stream_id).await?))
}

async fn stop_stream(
    _auth: ApiKeyAuth,
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> Result<Json<StatusResponse>, GatewayError> {
    require_stream(&state, &stream_id).await?;

    if !state.supervisor.stop_stream(&stream_id).await {
        return Err(GatewayError::NotRunning);
    }

    Ok(Json(status_response(&state, &stream_id).await?))
}

async fn stream_status(
    _auth: ApiKeyAuth,
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> Result<Json<StatusResponse>, GatewayError> {
    Ok(Json(status_response(&state, &stream_id).await?))
}

// ---------------------------------------------------------------------------
// Probe / snapshot (management)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct AnalyzeResponse {
    #[serde(flatten)]
    probe: ProbeResult,
    resolution: Option<String>,
    recommended_settings: serde_json::Value,
}

async fn analyze_stream(
    _auth: ApiKeyAuth,
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> Result<Json<AnalyzeResponse>, GatewayError> {
    let row = require_stream(&state, &stream_id).await?;

    let result = probe::probe(&state.supervisor.config().ffprobe_path, &row.rtsp_url).await;

    if result.is_valid {
        streams::update_stream_info(
            &state.db,
            &stream_id,
            result.video_codec.as_deref(),
            result.audio_codec.as_deref(),
            result.resolution().as_deref(),
            result.framerate,
            result.video_bitrate,
        )
        .await
        .map_err(|e| GatewayError::Internal(format!("db error: {e}")))?;
    }

    let mut recommended = serde_json::Map::new();
    recommended.insert("use_transcode".into(), result.needs_transcode.into());
    if result.needs_transcode {
        recommended.insert("preset".into(), "ultrafast".into());
        recommended.insert("tune".into(), "zerolatency".into());
    }
    if !result.can_copy_audio && result.audio_codec.is_some() {
        recommended.insert("transcode_audio".into(), true.into());
    }

    let resolution = result.resolution();
    Ok(Json(AnalyzeResponse {
        probe: result,
        resolution,
        recommended_settings: serde_json::Value::Object(recommended),
    }))
}

#[derive(Serialize)]
struct SnapshotResponse {
    status: String,
    stream_id: String,
    thumbnail: String,
}

async fn capture_snapshot(
    _auth: ApiKeyAuth,
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> Result<Json<SnapshotResponse>, GatewayError> {
    require_stream(&state, &stream_id).await?;

    let thumbnail = state
        .supervisor
        .capture_stream_thumbnail(&stream_id)
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?
        .ok_or_else(|| GatewayError::Internal("failed to capture snapshot".to_string()))?;

    Ok(Json(SnapshotResponse {
        status: "ok".to_string(),
        stream_id,
        thumbnail,
    }))
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TokenQuery {
    expires_hours: Option<i64>,
    #[serde(default)]
    bind_ip: bool,
}

#[derive(Serialize)]
struct TokenResponse {
    token: String,
    expires_hours: i64,
    hls_url: String,
}

async fn issue_stream_token(
    _auth: ApiKeyAuth,
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    Query(query): Query<TokenQuery>,
    client: ClientAddr,
) -> Result<Json<TokenResponse>, GatewayError> {
    require_stream(&state, &stream_id).await?;

    let expires_hours = query
        .expires_hours
        .unwrap_or(state.token_expiry_hours)
        .clamp(1, 168);
    let client_ip = if query.bind_ip {
        client.ip_string()
    } else {
        None
    };

    let token = create_stream_token(
        &stream_id,
        expires_hours,
        client_ip.as_deref(),
        &state.secret_key,
    )?;
    info!(
        stream_id = %stream_id,
        expires_hours,
        bound = client_ip.is_some(),
        "playback token issued"
    );

    Ok(Json(TokenResponse {
        hls_url: format!("/hls/{stream_id}/stream.m3u8?token={token}"),
        token,
        expires_hours,
    }))
}

#[derive(Deserialize)]
struct VerifyRequest {
    token: String,
    stream_id: String,
}

#[derive(Serialize)]
struct VerifyResponse {
    valid: bool,
    stream_id: String,
    viewer_id: String,
    expires_at: usize,
}

async fn verify_token(
    State(state): State<AppState>,
    client: ClientAddr,
    Json(body): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, GatewayError> {
    let client_ip = client.ip_string();
    let claims = verify_stream_token(
        &body.token,
        &body.stream_id,
        client_ip.as_deref(),
        &state.secret_key,
    )?;

    Ok(Json(VerifyResponse {
        valid: true,
        stream_id: claims.stream_id,
        viewer_id: claims.jti,
        expires_at: claims.exp,
    }))
}

// ---------------------------------------------------------------------------
// Viewer bookkeeping (stream token)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct ViewerQuery {
    token: Option<String>,
}

#[derive(Serialize)]
struct HeartbeatResponse {
    status: String,
    running: bool,
    viewer_id: String,
}

async fn viewer_heartbeat(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    Query(query): Query<ViewerQuery>,
    client: ClientAddr,
    headers: HeaderMap,
) -> Result<Json<HeartbeatResponse>, GatewayError> {
    let viewer_id = authorize_viewer(&state, &stream_id, &query, client, &headers)?;
    require_stream(&state, &stream_id).await?;

    let running = state
        .supervisor
        .viewer_heartbeat(&stream_id, &viewer_id)
        .await
        .map_err(|e| match e {
            SupervisorError::StreamNotFound(id) => GatewayError::UnknownStream(id),
            other => GatewayError::Internal(other.to_string()),
        })?;

    Ok(Json(HeartbeatResponse {
        status: "ok".to_string(),
        running,
        viewer_id,
    }))
}

#[derive(Serialize)]
struct DisconnectResponse {
    status: String,
}

async fn viewer_disconnect(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    Query(query): Query<ViewerQuery>,
    client: ClientAddr,
    headers: HeaderMap,
) -> Result<Json<DisconnectResponse>, GatewayError> {
    let viewer_id = authorize_viewer(&state, &stream_id, &query, client, &headers)?;
    require_stream(&state, &stream_id).await?;

    state
        .supervisor
        .viewer_disconnect(&stream_id, &viewer_id)
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?;

    Ok(Json(DisconnectResponse {
        status: "ok".to_string(),
    }))
}

fn authorize_viewer(
    state: &AppState,
    stream_id: &str,
    query: &ViewerQuery,
    client: ClientAddr,
    headers: &HeaderMap,
) -> Result<String, GatewayError> {
    let token = query.token.as_deref().or_else(|| bearer_token(headers));
    verify_stream_access(
        stream_id,
        token,
        client.ip_string().as_deref(),
        &state.secret_key,
    )
}
