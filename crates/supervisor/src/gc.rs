use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use streamgate_db::repo::{settings, streams};

use crate::SupervisorError;
use crate::manager::Supervisor;

impl Supervisor {
    /// Run the segment GC on its fixed cadence until cancelled.
    pub async fn run_segment_gc(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config().segment_cleanup_interval);
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = self.cleanup_segments().await {
                warn!(error = %e, "segment cleanup pass failed");
            }
        }
    }

    /// One GC pass: age out stale `.ts` segments everywhere, remove
    /// directories that belong to neither the registry nor the catalog.
    /// Per-file failures are logged and skipped.
    pub async fn cleanup_segments(&self) -> Result<(), SupervisorError> {
        let rt =
            settings::runtime_settings_with(self.pool(), &self.config().runtime_defaults).await?;
        let max_age = Duration::from_secs(rt.segment_max_age_minutes * 60);

        let root = &self.config().streams_dir;
        if !root.exists() {
            return Ok(());
        }

        let mut deleted = 0usize;
        let mut dirs = tokio::fs::read_dir(root).await?;
        while let Some(dir) = dirs.next_entry().await? {
            let is_dir = dir.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            let stream_id = dir.file_name().to_string_lossy().into_owned();

            deleted += sweep_stale_segments(&dir.path(), max_age).await;

            // Directories with no registry entry and no catalog row are
            // leftovers of deleted feeds.
            if !self.is_running(&stream_id).await
                && !streams::stream_exists(self.pool(), &stream_id).await?
            {
                match tokio::fs::remove_dir_all(dir.path()).await {
                    Ok(()) => info!(stream_id = %stream_id, "removed orphaned stream directory"),
                    Err(e) => warn!(stream_id = %stream_id, error = %e, "failed to remove orphaned directory"),
                }
            }
        }

        if deleted > 0 {
            debug!(deleted, "removed stale segments");
        }
        Ok(())
    }
}

/// Delete `.ts` files older than `max_age` inside one stream directory.
/// Returns the number removed; errors are swallowed per file.
async fn sweep_stale_segments(dir: &Path, max_age: Duration) -> usize {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };

    let mut deleted = 0usize;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("ts") {
            continue;
        }
        let stale = entry
            .metadata()
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|mtime| mtime.elapsed().ok())
            .map(|age| age > max_age)
            .unwrap_or(false);
        if stale && tokio::fs::remove_file(&path).await.is_ok() {
            deleted += 1;
        }
    }
    deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SupervisorConfig;
    use streamgate_db::repo::streams::NewStream;

    async fn gc_fixture(tag: &str) -> Arc<Supervisor> {
        let pool = streamgate_db::connect(":memory:").await.unwrap();
        streamgate_db::migrate::run(&pool).await.unwrap();

        let streams_dir =
            std::env::temp_dir().join(format!("sg_gc_{tag}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&streams_dir);
        std::fs::create_dir_all(&streams_dir).unwrap();

        let config = SupervisorConfig {
            streams_dir,
            ..SupervisorConfig::default()
        };
        Supervisor::new(pool, config)
    }

    fn make_stream_dir(root: &Path, stream_id: &str) {
        let dir = root.join(stream_id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("stream.m3u8"), "#EXTM3U\n").unwrap();
        std::fs::write(dir.join("segment_000.ts"), b"fake segment").unwrap();
    }

    #[tokio::test]
    async fn fresh_segments_survive_the_sweep() {
        let supervisor = gc_fixture("fresh").await;
        let root = supervisor.config().streams_dir.clone();

        let row = streams::create_stream(
            supervisor.pool(),
            &NewStream {
                name: "cam".to_string(),
                rtsp_url: "rtsp://cam/fresh".to_string(),
                ..NewStream::default()
            },
        )
        .await
        .unwrap();
        make_stream_dir(&root, &row.id);

        supervisor.cleanup_segments().await.unwrap();

        assert!(root.join(&row.id).join("segment_000.ts").exists());
        assert!(root.join(&row.id).join("stream.m3u8").exists());
    }

    #[tokio::test]
    async fn orphan_directory_is_removed() {
        let supervisor = gc_fixture("orphan").await;
        let root = supervisor.config().streams_dir.clone();

        // A directory with no catalog row and no registry entry.
        make_stream_dir(&root, "deadbeefdeadbeef");

        supervisor.cleanup_segments().await.unwrap();

        assert!(!root.join("deadbeefdeadbeef").exists());
    }

    #[tokio::test]
    async fn cataloged_directory_is_kept() {
        let supervisor = gc_fixture("kept").await;
        let root = supervisor.config().streams_dir.clone();

        let row = streams::create_stream(
            supervisor.pool(),
            &NewStream {
                name: "cam".to_string(),
                rtsp_url: "rtsp://cam/kept".to_string(),
                ..NewStream::default()
            },
        )
        .await
        .unwrap();
        make_stream_dir(&root, &row.id);

        supervisor.cleanup_segments().await.unwrap();

        // Not running, but the catalog still knows it: the directory stays.
        assert!(root.join(&row.id).exists());
    }

    #[tokio::test]
    async fn missing_root_is_a_noop() {
        let supervisor = gc_fixture("noroot").await;
        std::fs::remove_dir_all(&supervisor.config().streams_dir).unwrap();
        supervisor.cleanup_segments().await.unwrap();
    }

    #[tokio::test]
    async fn non_ts_files_are_never_aged_out() {
        let supervisor = gc_fixture("nonts").await;
        let root = supervisor.config().streams_dir.clone();

        let row = streams::create_stream(
            supervisor.pool(),
            &NewStream {
                name: "cam".to_string(),
                rtsp_url: "rtsp://cam/nonts".to_string(),
                ..NewStream::default()
            },
        )
        .await
        .unwrap();
        let dir = root.join(&row.id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("transcoder.log"), "log line").unwrap();

        // Age sweep only ever touches .ts files.
        assert_eq!(sweep_stale_segments(&dir, Duration::from_secs(0)).await, 0);
        assert!(dir.join("transcoder.log").exists());
    }
}
