use std::path::Path;

use serde_json::{Map, Value};
use tracing::warn;

use streamgate_core::types::LatencyMode;
use streamgate_db::repo::streams::StreamRow;

use crate::probe::ProbeResult;

/// Stable-mode segmentation fallbacks taken from the runtime settings.
#[derive(Debug, Clone, Copy)]
pub struct HlsDefaults {
    pub hls_time: u32,
    pub hls_list_size: u32,
}

/// A planned transcoder invocation, kept in segments so per-feed override
/// arrays can be appended to the right place.
#[derive(Debug, Clone)]
pub struct TranscodeCommand {
    pub input_args: Vec<String>,
    pub input_url: String,
    pub video_args: Vec<String>,
    pub audio_args: Vec<String>,
    pub output_args: Vec<String>,
    pub output_path: String,
}

impl TranscodeCommand {
    /// Flatten into the argument list handed to the transcoder binary
    /// (program name excluded).
    pub fn build(&self) -> Vec<String> {
        let mut args = Vec::new();
        args.extend(self.input_args.iter().cloned());
        args.push("-i".to_string());
        args.push(self.input_url.clone());
        args.extend(self.video_args.iter().cloned());
        args.extend(self.audio_args.iter().cloned());
        args.extend(self.output_args.iter().cloned());
        args.push(self.output_path.clone());
        args
    }

    /// Full command line for logging.
    pub fn to_display(&self, ffmpeg_path: &Path) -> String {
        let mut parts = vec![ffmpeg_path.display().to_string()];
        parts.extend(self.build());
        parts.join(" ")
    }
}

/// Plan the RTSP→HLS transcoder invocation for a feed.
pub fn build_hls_command(
    stream: &StreamRow,
    probe: Option<&ProbeResult>,
    out_dir: &Path,
    hls: &HlsDefaults,
) -> TranscodeCommand {
    let overrides = parse_overrides(stream);
    let latency = LatencyMode::parse(&stream.latency_mode);
    let low_latency = ov_bool(&overrides, "low_latency").unwrap_or(latency == LatencyMode::Low);

    TranscodeCommand {
        input_args: build_input_args(&overrides, low_latency),
        input_url: stream.rtsp_url.clone(),
        video_args: build_video_args(stream, probe, &overrides, latency),
        audio_args: build_audio_args(probe, &overrides),
        output_args: build_output_args(&overrides, low_latency, hls, out_dir),
        output_path: out_dir.join("stream.m3u8").to_string_lossy().into_owned(),
    }
}

fn parse_overrides(stream: &StreamRow) -> Map<String, Value> {
    let Some(raw) = stream.ffmpeg_overrides.as_deref() else {
        return Map::new();
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => {
            warn!(stream_id = %stream.id, "invalid ffmpeg_overrides JSON, ignoring");
            Map::new()
        }
    }
}

fn build_input_args(overrides: &Map<String, Value>, low_latency: bool) -> Vec<String> {
    let mut args = Vec::new();

    // Strip buffering when chasing latency.
    if low_latency {
        args.extend(arg_pairs(&[
            ("-fflags", "nobuffer+flush_packets"),
            ("-flags", "low_delay"),
            ("-max_delay", "0"),
            ("-avioflags", "direct"),
        ]));
    }

    // TCP is far more reliable than UDP for RTSP cameras.
    let transport = ov_string(overrides, "rtsp_transport").unwrap_or_else(|| "tcp".to_string());
    args.push("-rtsp_transport".to_string());
    args.push(transport);

    // Client mode, never listen mode.
    args.push("-rtsp_flags".to_string());
    args.push("prefer_tcp".to_string());

    let buffer_size = ov_string(overrides, "buffer_size")
        .unwrap_or_else(|| if low_latency { "512000" } else { "1024000" }.to_string());
    args.push("-buffer_size".to_string());
    args.push(buffer_size);

    // Connection timeout in microseconds.
    let timeout = ov_string(overrides, "timeout").unwrap_or_else(|| "5000000".to_string());
    args.push("-timeout".to_string());
    args.push(timeout);

    args.push("-y".to_string());

    args.extend(ov_args(overrides, "input_args"));
    args
}

fn build_video_args(
    stream: &StreamRow,
    probe: Option<&ProbeResult>,
    overrides: &Map<String, Value>,
    latency: LatencyMode,
) -> Vec<String> {
    let mut args = Vec::new();

    let force_transcode =
        stream.use_transcode || ov_bool(overrides, "transcode_video").unwrap_or(false);
    let can_copy = probe.map(|p| p.can_copy_video).unwrap_or(true);

    if force_transcode || !can_copy {
        args.push("-c:v".to_string());
        args.push("libx264".to_string());

        let preset = ov_string(overrides, "preset").unwrap_or_else(|| "ultrafast".to_string());
        args.push("-preset".to_string());
        args.push(preset);

        let tune = ov_string(overrides, "tune").unwrap_or_else(|| "zerolatency".to_string());
        args.push("-tune".to_string());
        args.push(tune);

        let profile = ov_string(overrides, "profile").unwrap_or_else(|| "baseline".to_string());
        args.push("-profile:v".to_string());
        args.push(profile);

        let crf = ov_string(overrides, "crf").unwrap_or_else(|| "23".to_string());
        args.push("-crf".to_string());
        args.push(crf);

        // Force keyframes on the segment cadence so every segment starts
        // clean.
        let keyframe_interval = match latency {
            LatencyMode::Low => 1,
            LatencyMode::Stable => 3,
        };
        args.push("-force_key_frames".to_string());
        args.push(format!("expr:gte(t,n_forced*{keyframe_interval})"));

        if let Some(bitrate) = ov_string(overrides, "video_bitrate") {
            args.push("-b:v".to_string());
            args.push(bitrate.clone());
            args.push("-maxrate".to_string());
            args.push(bitrate);
            args.push("-bufsize".to_string());
            args.push(ov_string(overrides, "bufsize").unwrap_or_else(|| "2M".to_string()));
        }

        if let Some(scale) = ov_string(overrides, "scale") {
            args.push("-vf".to_string());
            args.push(format!("scale={scale}"));
        }
    } else {
        args.push("-c:v".to_string());
        args.push("copy".to_string());
    }

    args.extend(ov_args(overrides, "video_args"));
    args
}

fn build_audio_args(probe: Option<&ProbeResult>, overrides: &Map<String, Value>) -> Vec<String> {
    let has_audio = probe.map(|p| p.audio_codec.is_some()).unwrap_or(true);
    if ov_bool(overrides, "no_audio").unwrap_or(false) || !has_audio {
        return vec!["-an".to_string()];
    }

    let mut args = Vec::new();
    let force_transcode = ov_bool(overrides, "transcode_audio").unwrap_or(false);
    let can_copy = probe.map(|p| p.can_copy_audio).unwrap_or(true);

    if force_transcode || !can_copy {
        args.push("-c:a".to_string());
        args.push("aac".to_string());
        args.push("-b:a".to_string());
        args.push(ov_string(overrides, "audio_bitrate").unwrap_or_else(|| "128k".to_string()));
        args.push("-ac".to_string());
        args.push(ov_string(overrides, "audio_channels").unwrap_or_else(|| "2".to_string()));
    } else {
        args.push("-c:a".to_string());
        args.push("copy".to_string());
    }

    args.extend(ov_args(overrides, "audio_args"));
    args
}

fn build_output_args(
    overrides: &Map<String, Value>,
    low_latency: bool,
    hls: &HlsDefaults,
    out_dir: &Path,
) -> Vec<String> {
    let mut args = Vec::new();

    args.push("-f".to_string());
    args.push("hls".to_string());

    // Low latency: 1 s segments, short playlist (2-4 s end-to-end).
    // Stable: 3 s segments, longer playlist, fewer gaps on jittery links.
    let (hls_time, hls_list_size, hls_flags) = if low_latency {
        (
            ov_u32(overrides, "hls_time").unwrap_or(1),
            ov_u32(overrides, "hls_list_size").unwrap_or(4),
            ov_string(overrides, "hls_flags")
                .unwrap_or_else(|| "delete_segments+append_list+omit_endlist+split_by_time".into()),
        )
    } else {
        (
            ov_u32(overrides, "hls_time").unwrap_or(hls.hls_time),
            ov_u32(overrides, "hls_list_size").unwrap_or(hls.hls_list_size),
            ov_string(overrides, "hls_flags")
                .unwrap_or_else(|| "delete_segments+append_list+omit_endlist".into()),
        )
    };

    args.push("-hls_time".to_string());
    args.push(hls_time.to_string());
    args.push("-hls_list_size".to_string());
    args.push(hls_list_size.to_string());
    args.push("-hls_flags".to_string());
    args.push(hls_flags);

    args.push("-hls_segment_filename".to_string());
    args.push(
        out_dir
            .join("segment_%03d.ts")
            .to_string_lossy()
            .into_owned(),
    );

    args.push("-start_number".to_string());
    args.push("0".to_string());

    args.extend(ov_args(overrides, "output_args"));
    args
}

fn arg_pairs(pairs: &[(&str, &str)]) -> Vec<String> {
    pairs
        .iter()
        .flat_map(|(k, v)| [k.to_string(), v.to_string()])
        .collect()
}

fn ov_string(overrides: &Map<String, Value>, key: &str) -> Option<String> {
    match overrides.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn ov_bool(overrides: &Map<String, Value>, key: &str) -> Option<bool> {
    overrides.get(key).and_then(|v| v.as_bool())
}

fn ov_u32(overrides: &Map<String, Value>, key: &str) -> Option<u32> {
    match overrides.get(key)? {
        Value::Number(n) => n.as_u64().map(|n| n as u32),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Verbatim pass-through argument arrays (`input_args`, `video_args`, …).
fn ov_args(overrides: &Map<String, Value>, key: &str) -> Vec<String> {
    overrides
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_stream(overrides: Option<&str>) -> StreamRow {
        StreamRow {
            id: "abcdefgh12345678".to_string(),
            name: "cam".to_string(),
            rtsp_url: "rtsp://cam.local/stream1".to_string(),
            mode: "on_demand".to_string(),
            status: "stopped".to_string(),
            video_codec: None,
            audio_codec: None,
            resolution: None,
            framerate: None,
            bitrate: None,
            ffmpeg_overrides: overrides.map(String::from),
            viewer_count: 0,
            last_viewer_ts: None,
            last_error: None,
            pid: None,
            keep_alive_seconds: 60,
            use_transcode: false,
            latency_mode: "stable".to_string(),
            thumbnail: None,
            thumbnail_ts: None,
            created_ts: 0,
            updated_ts: 0,
        }
    }

    fn copyable_probe() -> ProbeResult {
        ProbeResult {
            video_codec: Some("h264".to_string()),
            audio_codec: Some("aac".to_string()),
            is_valid: true,
            can_copy_video: true,
            can_copy_audio: true,
            ..ProbeResult::default()
        }
    }

    fn defaults() -> HlsDefaults {
        HlsDefaults {
            hls_time: 3,
            hls_list_size: 8,
        }
    }

    fn has_pair(args: &[String], key: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == key && w[1] == value)
    }

    #[test]
    fn copy_mode_when_probe_allows() {
        let stream = test_stream(None);
        let probe = copyable_probe();
        let cmd = build_hls_command(&stream, Some(&probe), &PathBuf::from("/tmp/out"), &defaults());

        assert!(has_pair(&cmd.video_args, "-c:v", "copy"));
        assert!(has_pair(&cmd.audio_args, "-c:a", "copy"));
        assert!(has_pair(&cmd.input_args, "-rtsp_transport", "tcp"));
        assert!(has_pair(&cmd.input_args, "-buffer_size", "1024000"));
        assert!(has_pair(&cmd.input_args, "-timeout", "5000000"));
        assert!(has_pair(&cmd.output_args, "-hls_time", "3"));
        assert!(has_pair(&cmd.output_args, "-hls_list_size", "8"));
        assert_eq!(cmd.output_path, "/tmp/out/stream.m3u8");
        assert!(
            has_pair(
                &cmd.output_args,
                "-hls_segment_filename",
                "/tmp/out/segment_%03d.ts"
            )
        );
    }

    #[test]
    fn transcode_when_codec_incompatible() {
        let stream = test_stream(None);
        let probe = ProbeResult {
            video_codec: Some("mpeg4".to_string()),
            can_copy_video: false,
            can_copy_audio: true,
            audio_codec: Some("aac".to_string()),
            needs_transcode: true,
            is_valid: true,
            ..ProbeResult::default()
        };
        let cmd = build_hls_command(&stream, Some(&probe), &PathBuf::from("/tmp/out"), &defaults());

        assert!(has_pair(&cmd.video_args, "-c:v", "libx264"));
        assert!(has_pair(&cmd.video_args, "-preset", "ultrafast"));
        assert!(has_pair(&cmd.video_args, "-tune", "zerolatency"));
        assert!(has_pair(&cmd.video_args, "-profile:v", "baseline"));
        assert!(has_pair(&cmd.video_args, "-crf", "23"));
        // Stable mode forces a keyframe every 3 s.
        assert!(has_pair(
            &cmd.video_args,
            "-force_key_frames",
            "expr:gte(t,n_forced*3)"
        ));
    }

    #[test]
    fn use_transcode_flag_forces_encode() {
        let mut stream = test_stream(None);
        stream.use_transcode = true;
        let probe = copyable_probe();
        let cmd = build_hls_command(&stream, Some(&probe), &PathBuf::from("/tmp/out"), &defaults());
        assert!(has_pair(&cmd.video_args, "-c:v", "libx264"));
    }

    #[test]
    fn low_latency_profile() {
        let mut stream = test_stream(None);
        stream.latency_mode = "low".to_string();
        stream.use_transcode = true;
        let cmd = build_hls_command(&stream, None, &PathBuf::from("/tmp/out"), &defaults());

        assert!(has_pair(&cmd.input_args, "-fflags", "nobuffer+flush_packets"));
        assert!(has_pair(&cmd.input_args, "-flags", "low_delay"));
        assert!(has_pair(&cmd.input_args, "-avioflags", "direct"));
        assert!(has_pair(&cmd.input_args, "-buffer_size", "512000"));
        assert!(has_pair(&cmd.output_args, "-hls_time", "1"));
        assert!(has_pair(&cmd.output_args, "-hls_list_size", "4"));
        assert!(has_pair(
            &cmd.output_args,
            "-hls_flags",
            "delete_segments+append_list+omit_endlist+split_by_time"
        ));
        // 1 s keyframe cadence when chasing latency.
        assert!(has_pair(
            &cmd.video_args,
            "-force_key_frames",
            "expr:gte(t,n_forced*1)"
        ));
    }

    #[test]
    fn no_audio_when_probe_finds_none() {
        let stream = test_stream(None);
        let probe = ProbeResult {
            video_codec: Some("h264".to_string()),
            can_copy_video: true,
            can_copy_audio: true,
            is_valid: true,
            ..ProbeResult::default()
        };
        let cmd = build_hls_command(&stream, Some(&probe), &PathBuf::from("/tmp/out"), &defaults());
        assert_eq!(cmd.audio_args, vec!["-an".to_string()]);
    }

    #[test]
    fn audio_transcoded_when_not_copyable() {
        let stream = test_stream(None);
        let probe = ProbeResult {
            video_codec: Some("h264".to_string()),
            audio_codec: Some("pcm_mulaw".to_string()),
            can_copy_video: true,
            can_copy_audio: false,
            is_valid: true,
            ..ProbeResult::default()
        };
        let cmd = build_hls_command(&stream, Some(&probe), &PathBuf::from("/tmp/out"), &defaults());
        assert!(has_pair(&cmd.audio_args, "-c:a", "aac"));
        assert!(has_pair(&cmd.audio_args, "-b:a", "128k"));
        assert!(has_pair(&cmd.audio_args, "-ac", "2"));
    }

    #[test]
    fn overrides_respected_and_appended() {
        let stream = test_stream(Some(
            r#"{
                "rtsp_transport": "udp",
                "transcode_video": true,
                "video_bitrate": "2M",
                "scale": "1280:720",
                "hls_time": 5,
                "input_args": ["-use_wallclock_as_timestamps", "1"],
                "output_args": ["-master_pl_name", "master.m3u8"]
            }"#,
        ));
        let cmd = build_hls_command(&stream, None, &PathBuf::from("/tmp/out"), &defaults());

        assert!(has_pair(&cmd.input_args, "-rtsp_transport", "udp"));
        assert!(has_pair(&cmd.video_args, "-b:v", "2M"));
        assert!(has_pair(&cmd.video_args, "-maxrate", "2M"));
        assert!(has_pair(&cmd.video_args, "-bufsize", "2M"));
        assert!(has_pair(&cmd.video_args, "-vf", "scale=1280:720"));
        assert!(has_pair(&cmd.output_args, "-hls_time", "5"));
        // Pass-through arrays land at the tail of their segment.
        let n = cmd.input_args.len();
        assert_eq!(cmd.input_args[n - 2], "-use_wallclock_as_timestamps");
        assert_eq!(cmd.input_args[n - 1], "1");
        let n = cmd.output_args.len();
        assert_eq!(cmd.output_args[n - 2], "-master_pl_name");
        assert_eq!(cmd.output_args[n - 1], "master.m3u8");
    }

    #[test]
    fn build_flattens_in_order() {
        let stream = test_stream(None);
        let cmd = build_hls_command(&stream, None, &PathBuf::from("/tmp/out"), &defaults());
        let args = cmd.build();

        let i_pos = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i_pos + 1], "rtsp://cam.local/stream1");
        assert_eq!(args.last().unwrap(), "/tmp/out/stream.m3u8");

        let display = cmd.to_display(&PathBuf::from("/usr/bin/ffmpeg"));
        assert!(display.starts_with("/usr/bin/ffmpeg "));
    }

    #[test]
    fn invalid_overrides_ignored() {
        let stream = test_stream(Some("not json at all"));
        let cmd = build_hls_command(&stream, None, &PathBuf::from("/tmp/out"), &defaults());
        assert!(has_pair(&cmd.input_args, "-rtsp_transport", "tcp"));
    }
}
