use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::auth::{ClientAddr, bearer_token, verify_stream_token};
use crate::error::GatewayError;
use crate::state::AppState;

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Default, Deserialize)]
pub struct HlsQuery {
    token: Option<String>,
}

/// Serve HLS files for a feed, lazily starting it when the playlist is
/// requested and missing.
///
/// Playlists require a valid playback token. Segments do not: the playlist
/// itself is gated and segment names are not guessable, which lets players
/// fetch segments without query rewriting.
///
/// GET/HEAD /hls/{stream_id}/{filename}
pub async fn serve_hls(
    State(state): State<AppState>,
    Path((stream_id, filename)): Path<(String, String)>,
    Query(query): Query<HlsQuery>,
    client: ClientAddr,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let is_playlist = filename.ends_with(".m3u8");
    let is_segment = filename.ends_with(".ts");

    let mut viewer_id = None;
    if is_playlist {
        let token = query.token.as_deref().or_else(|| bearer_token(&headers));
        let token = token
            .ok_or_else(|| GatewayError::AuthRequired("stream token required".to_string()))?;
        let client_ip = client.ip_string();
        let claims =
            verify_stream_token(token, &stream_id, client_ip.as_deref(), &state.secret_key)?;
        viewer_id = Some(claims.jti);
    } else if !is_segment {
        return Err(GatewayError::InvalidRequest("invalid file type".to_string()));
    }

    let stream = streamgate_db::repo::streams::get_stream(&state.db, &stream_id)
        .await
        .map_err(|e| GatewayError::Internal(format!("db error: {e}")))?
        .ok_or_else(|| GatewayError::UnknownStream(stream_id.clone()))?;

    let file_path = state
        .supervisor
        .config()
        .streams_dir
        .join(&stream_id)
        .join(&filename);

    if !file_path.exists() && filename == "stream.m3u8" {
        // Lazy start: the playlist request is the demand signal.
        debug!(stream_id = %stream.id, "playlist missing, starting feed on demand");
        match state
            .supervisor
            .start_stream(&stream_id, viewer_id.as_deref())
            .await
        {
            Ok(()) => wait_for_file(&file_path, state.supervisor.config().startup_timeout).await,
            Err(e) => warn!(stream_id = %stream.id, error = %e, "lazy start failed"),
        }
    }

    if !file_path.exists() {
        return Err(GatewayError::StreamNotReady(
            "please wait a moment and retry".to_string(),
        ));
    }

    serve_file(&file_path, is_playlist).await
}

/// Poll for the transcoder's first playlist write.
async fn wait_for_file(path: &std::path::Path, timeout_secs: u64) {
    let attempts = timeout_secs * 1000 / READY_POLL_INTERVAL.as_millis() as u64;
    for _ in 0..attempts {
        tokio::time::sleep(READY_POLL_INTERVAL).await;
        if path.exists() {
            return;
        }
    }
}

async fn serve_file(
    path: &std::path::Path,
    is_playlist: bool,
) -> Result<Response, GatewayError> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| GatewayError::Internal(format!("file open error: {e}")))?;
    let size = file
        .metadata()
        .await
        .map_err(|e| GatewayError::Internal(format!("file metadata error: {e}")))?
        .len();

    let content_type = if is_playlist {
        PLAYLIST_CONTENT_TYPE
    } else {
        SEGMENT_CONTENT_TYPE
    };
    let stream = tokio_util::io::ReaderStream::new(file);

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", content_type)
        .header("Content-Length", size.to_string())
        .header("Cache-Control", "no-cache, no-store, must-revalidate")
        .header("Access-Control-Allow-Origin", "*")
        .body(Body::from_stream(stream))
        .unwrap())
}
