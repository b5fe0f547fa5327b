pub mod command;
pub mod gc;
pub mod manager;
pub mod probe;
pub mod thumbnail;

use std::path::PathBuf;

use streamgate_db::repo::settings::RuntimeSettings;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("stream not found: {0}")]
    StreamNotFound(String),
    #[error("probe failed: {0}")]
    ProbeFailed(String),
    #[error("transcoder spawn failed: {0}")]
    SpawnFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Boot-time supervisor configuration. The five knobs in
/// `runtime_defaults` can be overridden per-read through the settings
/// table; the rest are fixed for the process lifetime.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub streams_dir: PathBuf,
    pub runtime_defaults: RuntimeSettings,
    /// Seconds to wait for the playlist to appear after a lazy start.
    pub startup_timeout: u64,
    pub reconnect_delay: u64,
    pub max_reconnect_attempts: u32,
    pub segment_cleanup_interval: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            streams_dir: PathBuf::from("streams"),
            runtime_defaults: RuntimeSettings::default(),
            startup_timeout: 15,
            reconnect_delay: 5,
            max_reconnect_attempts: 3,
            segment_cleanup_interval: 30,
        }
    }
}
