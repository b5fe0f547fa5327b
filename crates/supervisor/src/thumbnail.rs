use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, warn};

use streamgate_db::repo::streams;

use crate::SupervisorError;
use crate::manager::Supervisor;

const THUMB_WIDTH: u32 = 320;
const THUMB_HEIGHT: u32 = 180;
const RTSP_CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);
const HLS_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);
const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Grab one frame straight from the RTSP source. Slow path: opens a fresh
/// connection to the camera.
pub async fn capture_from_source(ffmpeg_path: &Path, rtsp_url: &str) -> Option<String> {
    let scale = format!("scale={THUMB_WIDTH}:{THUMB_HEIGHT}");
    let args = [
        "-rtsp_transport",
        "tcp",
        "-i",
        rtsp_url,
        "-vframes",
        "1",
        "-vf",
        scale.as_str(),
        "-f",
        "image2",
        "-c:v",
        "mjpeg",
        "-q:v",
        "5",
        "-y",
        "pipe:1",
    ];
    capture_frame(ffmpeg_path, &args, RTSP_CAPTURE_TIMEOUT).await
}

/// Grab one frame from the newest HLS segment of a running feed. Cheap
/// path: never touches the camera.
pub async fn capture_from_hls(
    ffmpeg_path: &Path,
    streams_dir: &Path,
    stream_id: &str,
) -> Option<String> {
    let segment = latest_segment(&streams_dir.join(stream_id))?;
    let input = segment.to_string_lossy().into_owned();
    let scale = format!("scale={THUMB_WIDTH}:{THUMB_HEIGHT}");
    let args = [
        "-i",
        input.as_str(),
        "-vframes",
        "1",
        "-vf",
        scale.as_str(),
        "-f",
        "image2",
        "-c:v",
        "mjpeg",
        "-q:v",
        "5",
        "-y",
        "pipe:1",
    ];
    capture_frame(ffmpeg_path, &args, HLS_CAPTURE_TIMEOUT).await
}

async fn capture_frame(ffmpeg_path: &Path, args: &[&str], wall: Duration) -> Option<String> {
    let child = tokio::process::Command::new(ffmpeg_path)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .ok()?;

    let output = match tokio::time::timeout(wall, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            debug!(error = %e, "thumbnail capture failed");
            return None;
        }
        Err(_) => {
            debug!("thumbnail capture timed out");
            return None;
        }
    };

    if output.status.success() && !output.stdout.is_empty() {
        Some(to_data_url(&output.stdout))
    } else {
        None
    }
}

/// Most recently written `.ts` file in a stream directory.
fn latest_segment(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .flatten()
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("ts"))
        .filter_map(|e| {
            let mtime = e.metadata().ok()?.modified().ok()?;
            Some((mtime, e.path()))
        })
        .max_by_key(|(mtime, _)| *mtime)
        .map(|(_, path)| path)
}

fn to_data_url(jpeg: &[u8]) -> String {
    format!("data:image/jpeg;base64,{}", STANDARD.encode(jpeg))
}

impl Supervisor {
    /// Capture and persist a thumbnail for a feed: HLS segment when the
    /// feed is running, fresh RTSP connection otherwise.
    pub async fn capture_stream_thumbnail(
        &self,
        stream_id: &str,
    ) -> Result<Option<String>, SupervisorError> {
        let ffmpeg = self.config().ffmpeg_path.clone();

        if self.is_running(stream_id).await {
            if let Some(thumb) =
                capture_from_hls(&ffmpeg, &self.config().streams_dir, stream_id).await
            {
                streams::update_thumbnail(self.pool(), stream_id, &thumb).await?;
                return Ok(Some(thumb));
            }
        }

        let stream = streams::get_stream(self.pool(), stream_id)
            .await?
            .ok_or_else(|| SupervisorError::StreamNotFound(stream_id.to_string()))?;

        if let Some(thumb) = capture_from_source(&ffmpeg, &stream.rtsp_url).await {
            streams::update_thumbnail(self.pool(), stream_id, &thumb).await?;
            return Ok(Some(thumb));
        }
        Ok(None)
    }

    /// Best-effort thumbnail refresh for every registered feed, once a
    /// minute, until cancelled.
    pub async fn run_thumbnail_refresh(self: Arc<Self>) {
        loop {
            tokio::time::sleep(REFRESH_INTERVAL).await;
            for stream_id in self.registered_ids().await {
                let thumb = capture_from_hls(
                    &self.config().ffmpeg_path,
                    &self.config().streams_dir,
                    &stream_id,
                )
                .await;
                if let Some(thumb) = thumb {
                    if let Err(e) =
                        streams::update_thumbnail(self.pool(), &stream_id, &thumb).await
                    {
                        warn!(stream_id = %stream_id, error = %e, "failed to persist thumbnail");
                    } else {
                        debug!(stream_id = %stream_id, "thumbnail refreshed");
                    }
                }
            }
        }
    }
}
