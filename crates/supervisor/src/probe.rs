use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

/// Socket timeout handed to ffprobe. The wall clock allows 5 extra seconds
/// before the child is killed.
const PROBE_TIMEOUT_SECS: u64 = 15;

/// Codecs HLS players accept without re-encoding.
const HLS_VIDEO_CODECS: &[&str] = &["h264", "avc", "hevc", "h265"];
const HLS_AUDIO_CODECS: &[&str] = &["aac", "mp3", "ac3"];

/// Everything learned from one ffprobe pass over a source, plus the
/// copy/transcode verdict derived from it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeResult {
    // Video
    pub video_codec: Option<String>,
    pub video_codec_name: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub framerate: Option<f64>,
    pub video_bitrate: Option<i64>,
    pub profile: Option<String>,
    pub level: Option<i64>,
    pub pix_fmt: Option<String>,

    // Audio
    pub audio_codec: Option<String>,
    pub audio_codec_name: Option<String>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u32>,
    pub audio_bitrate: Option<i64>,

    pub is_valid: bool,
    pub error: Option<String>,

    // Verdict
    pub can_copy_video: bool,
    pub can_copy_audio: bool,
    pub needs_transcode: bool,
    pub transcode_reason: Option<String>,
}

impl ProbeResult {
    pub fn resolution(&self) -> Option<String> {
        match (self.width, self.height) {
            (Some(w), Some(h)) => Some(format!("{w}x{h}")),
            _ => None,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            error: Some(message),
            ..Self::default()
        }
    }
}

/// Inspect an RTSP source with ffprobe and classify its HLS compatibility.
///
/// Never returns an `Err`: probe failures are reported through
/// `ProbeResult::error` so callers can persist the human-readable cause.
pub async fn probe(ffprobe_path: &Path, rtsp_url: &str) -> ProbeResult {
    let socket_timeout_us = (PROBE_TIMEOUT_SECS * 1_000_000).to_string();
    let mut cmd = tokio::process::Command::new(ffprobe_path);
    cmd.args([
        "-v",
        "error",
        "-print_format",
        "json",
        "-show_format",
        "-show_streams",
        "-rtsp_transport",
        "tcp",
        "-rtsp_flags",
        "prefer_tcp",
        "-timeout",
        socket_timeout_us.as_str(),
        "-analyzeduration",
        "5000000",
        "-probesize",
        "5000000",
        rtsp_url,
    ])
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    info!(url = rtsp_url, "probing source");

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return ProbeResult::failed(format!(
                "ffprobe not found at '{}'",
                ffprobe_path.display()
            ));
        }
        Err(e) => return ProbeResult::failed(format!("failed to launch ffprobe: {e}")),
    };

    // Hard wall clock; on breach the dropped handle kills the child.
    let wall = Duration::from_secs(PROBE_TIMEOUT_SECS + 5);
    let output = match tokio::time::timeout(wall, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return ProbeResult::failed(format!("ffprobe failed: {e}")),
        Err(_) => {
            return ProbeResult::failed(
                "connection timeout, camera may be offline or unreachable".to_string(),
            );
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let raw = if !stderr.trim().is_empty() {
            stderr.trim()
        } else {
            stdout.trim()
        };
        error!(url = rtsp_url, error = raw, "ffprobe exited abnormally");
        if raw.is_empty() {
            return ProbeResult::failed(format!(
                "ffprobe failed with exit code {}",
                output.status.code().unwrap_or(-1)
            ));
        }
        return ProbeResult::failed(classify_error(raw));
    }

    let raw: serde_json::Value = match serde_json::from_slice(&output.stdout) {
        Ok(v) => v,
        Err(e) => return ProbeResult::failed(format!("failed to parse stream info: {e}")),
    };

    let mut info = parse_probe_output(&raw);
    if info.video_codec.is_none() && info.audio_codec.is_none() {
        return ProbeResult::failed("no video/audio streams found in source".to_string());
    }

    analyze_compatibility(&mut info);
    info.is_valid = true;
    debug!(
        url = rtsp_url,
        video = info.video_codec.as_deref().unwrap_or("none"),
        audio = info.audio_codec.as_deref().unwrap_or("none"),
        "probe complete"
    );
    info
}

fn parse_probe_output(raw: &serde_json::Value) -> ProbeResult {
    let mut info = ProbeResult::default();

    let streams = raw
        .get("streams")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    for s in &streams {
        let codec_type = s.get("codec_type").and_then(|v| v.as_str()).unwrap_or("");
        let codec = s
            .get("codec_name")
            .and_then(|v| v.as_str())
            .map(|c| c.to_ascii_lowercase());

        match codec_type {
            "video" if info.video_codec.is_none() => {
                info.video_codec = codec;
                info.video_codec_name = s
                    .get("codec_long_name")
                    .and_then(|v| v.as_str())
                    .map(String::from);
                info.width = s.get("width").and_then(|v| v.as_u64()).map(|w| w as u32);
                info.height = s.get("height").and_then(|v| v.as_u64()).map(|h| h as u32);
                info.profile = s
                    .get("profile")
                    .and_then(|v| v.as_str())
                    .map(String::from);
                info.level = s.get("level").and_then(|v| v.as_i64());
                info.pix_fmt = s
                    .get("pix_fmt")
                    .and_then(|v| v.as_str())
                    .map(String::from);

                let fps = s
                    .get("avg_frame_rate")
                    .and_then(|v| v.as_str())
                    .filter(|f| !f.is_empty() && *f != "0/0")
                    .or_else(|| s.get("r_frame_rate").and_then(|v| v.as_str()));
                info.framerate = fps.and_then(parse_fraction);

                info.video_bitrate = s
                    .get("bit_rate")
                    .and_then(|v| v.as_str())
                    .and_then(|b| b.parse().ok());
            }
            "audio" if info.audio_codec.is_none() => {
                info.audio_codec = codec;
                info.audio_codec_name = s
                    .get("codec_long_name")
                    .and_then(|v| v.as_str())
                    .map(String::from);
                info.sample_rate = s
                    .get("sample_rate")
                    .and_then(|v| v.as_str())
                    .and_then(|r| r.parse().ok());
                info.channels = s
                    .get("channels")
                    .and_then(|v| v.as_u64())
                    .map(|c| c as u32);
                info.audio_bitrate = s
                    .get("bit_rate")
                    .and_then(|v| v.as_str())
                    .and_then(|b| b.parse().ok());
            }
            _ => {}
        }
    }

    info
}

/// Parse a framerate like "30/1" or "29.97". A zero denominator is treated
/// as unknown.
fn parse_fraction(s: &str) -> Option<f64> {
    if let Some((num, den)) = s.split_once('/') {
        let n: f64 = num.parse().ok()?;
        let d: f64 = den.parse().ok()?;
        if d > 0.0 {
            Some((n / d * 100.0).round() / 100.0)
        } else {
            None
        }
    } else {
        s.parse::<f64>().ok().map(|f| (f * 100.0).round() / 100.0)
    }
}

/// Fill in the copy/transcode verdict.
fn analyze_compatibility(info: &mut ProbeResult) {
    let mut reasons = Vec::new();

    match info.video_codec.as_deref() {
        Some(codec) if HLS_VIDEO_CODECS.contains(&codec) => info.can_copy_video = true,
        Some(codec) => {
            info.can_copy_video = false;
            reasons.push(format!("video codec '{codec}' not HLS-compatible"));
        }
        None => {
            info.can_copy_video = false;
            reasons.push("no video stream detected".to_string());
        }
    }

    match info.audio_codec.as_deref() {
        Some(codec) if HLS_AUDIO_CODECS.contains(&codec) => info.can_copy_audio = true,
        Some(codec) => {
            info.can_copy_audio = false;
            reasons.push(format!("audio codec '{codec}' needs transcoding to AAC"));
        }
        // No audio is fine.
        None => info.can_copy_audio = true,
    }

    info.needs_transcode = !info.can_copy_video;
    if !reasons.is_empty() {
        info.transcode_reason = Some(reasons.join("; "));
    }
}

/// Map raw ffmpeg/ffprobe stderr to a human-readable cause. Shared by the
/// probe and the exit monitor.
pub fn classify_error(raw: &str) -> String {
    let lower = raw.to_ascii_lowercase();

    if lower.contains("unable to open rtsp for listening")
        || lower.contains("cannot assign requested address")
    {
        return "RTSP connection failed, camera may only allow one connection at a time".to_string();
    }
    if lower.contains("connection refused") {
        return "connection refused, camera offline or port blocked".to_string();
    }
    if lower.contains("unauthorized") || lower.contains("401") {
        return "authentication failed, check RTSP credentials".to_string();
    }
    if lower.contains("forbidden") || lower.contains("403") {
        return "access forbidden, check camera permissions".to_string();
    }
    if lower.contains("not found") || lower.contains("404") {
        return "stream not found, check RTSP URL path".to_string();
    }
    if lower.contains("timed out") || lower.contains("timeout") {
        return "connection timeout, network issue or camera offline".to_string();
    }
    if lower.contains("no route to host") {
        return "no route to host, check IP address and network connectivity".to_string();
    }
    if lower.contains("name or service not known") {
        return "DNS resolution failed, check hostname".to_string();
    }
    if lower.contains("invalid data") {
        return "invalid stream data, incompatible format or wrong URL".to_string();
    }
    if lower.contains("codec not currently supported") {
        return "codec not supported, try enabling transcoding".to_string();
    }

    // Fall back to the raw output, truncated.
    let trimmed = raw.trim();
    if trimmed.len() > 200 {
        let mut cut = 200;
        while !trimmed.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &trimmed[..cut])
    } else {
        trimmed.to_string()
    }
}
