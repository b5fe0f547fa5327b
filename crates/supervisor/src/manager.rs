use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use sqlx::SqlitePool;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use streamgate_core::types::{StreamMode, StreamStatus};
use streamgate_db::repo::{settings, streams};

use crate::command::{HlsDefaults, build_hls_command};
use crate::probe::{self, ProbeResult, classify_error};
use crate::{SupervisorConfig, SupervisorError};

const KEEP_ALIVE_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const TERMINATE_GRACE: Duration = Duration::from_secs(5);
const STDERR_TAIL_BYTES: usize = 500;

/// One supervised feed. Lives in the registry from `start_stream` until the
/// feed stops, including the gaps between reconnect attempts.
pub(crate) struct StreamProcess {
    pub(crate) stream_id: String,
    /// The transcoder subprocess. Behind its own lock so the exit monitor
    /// and `stop_stream` can hand it off without holding the registry mutex.
    pub(crate) child: Arc<Mutex<Option<Child>>>,
    pub(crate) pid: Option<u32>,
    /// Fixed at the first successful spawn; reconnects keep it, so feeds do
    /// not regain eviction seniority by crashing.
    pub(crate) start_time: Option<Instant>,
    pub(crate) last_viewer_time: Instant,
    pub(crate) viewers: HashSet<String>,
    pub(crate) probe: Option<ProbeResult>,
    pub(crate) monitor_task: Option<JoinHandle<()>>,
    pub(crate) keep_alive_task: Option<JoinHandle<()>>,
    pub(crate) reconnect_count: u32,
}

impl StreamProcess {
    fn new(stream_id: &str) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            child: Arc::new(Mutex::new(None)),
            pid: None,
            start_time: None,
            last_viewer_time: Instant::now(),
            viewers: HashSet::new(),
            probe: None,
            monitor_task: None,
            keep_alive_task: None,
            reconnect_count: 0,
        }
    }
}

/// Point-in-time view of a feed for status endpoints.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StreamStatusSnapshot {
    pub running: bool,
    pub viewer_count: usize,
    pub uptime_seconds: Option<u64>,
    pub pid: Option<u32>,
    pub reconnect_count: u32,
}

impl StreamStatusSnapshot {
    fn stopped() -> Self {
        Self {
            running: false,
            viewer_count: 0,
            uptime_seconds: None,
            pid: None,
            reconnect_count: 0,
        }
    }
}

/// Supervises every running transcoder: lifecycle, reconnects, viewer
/// accounting and the concurrency cap.
///
/// Locking rule: the registry mutex is held only to observe or mutate
/// membership. Anything that waits on a subprocess or another supervisor
/// task happens after release; the keep-alive watchdog stops its own feed,
/// so violating this self-deadlocks.
pub struct Supervisor {
    pool: SqlitePool,
    config: SupervisorConfig,
    pub(crate) registry: Mutex<HashMap<String, StreamProcess>>,
}

impl Supervisor {
    pub fn new(pool: SqlitePool, config: SupervisorConfig) -> Arc<Self> {
        Arc::new(Self {
            pool,
            config,
            registry: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Bring up every `always_on` feed. Called once at boot.
    pub async fn start_always_on(self: &Arc<Self>) {
        let rows = match streams::list_always_on(&self.pool).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "failed to list always-on feeds");
                return;
            }
        };
        for row in rows {
            if let Err(e) = self.start_stream(&row.id, None).await {
                warn!(stream_id = %row.id, error = %e, "failed to start always-on feed");
            }
        }
    }

    /// Stop every supervised feed. Used on graceful shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = { self.registry.lock().await.keys().cloned().collect() };
        for id in ids {
            self.stop_stream(&id).await;
        }
        info!("supervisor shut down");
    }

    pub async fn is_running(&self, stream_id: &str) -> bool {
        self.registry.lock().await.contains_key(stream_id)
    }

    pub async fn registered_ids(&self) -> Vec<String> {
        self.registry.lock().await.keys().cloned().collect()
    }

    pub async fn get_status(&self, stream_id: &str) -> StreamStatusSnapshot {
        let registry = self.registry.lock().await;
        match registry.get(stream_id) {
            None => StreamStatusSnapshot::stopped(),
            Some(entry) => StreamStatusSnapshot {
                running: true,
                viewer_count: entry.viewers.len(),
                uptime_seconds: entry.start_time.map(|t| t.elapsed().as_secs()),
                pid: entry.pid,
                reconnect_count: entry.reconnect_count,
            },
        }
    }

    /// Start a feed, or attach a viewer if it is already supervised.
    pub async fn start_stream(
        self: &Arc<Self>,
        stream_id: &str,
        viewer_id: Option<&str>,
    ) -> Result<(), SupervisorError> {
        // Fast path: already supervised.
        {
            let mut registry = self.registry.lock().await;
            if let Some(entry) = registry.get_mut(stream_id) {
                let count = viewer_id.map(|viewer| {
                    entry.viewers.insert(viewer.to_string());
                    entry.last_viewer_time = Instant::now();
                    entry.viewers.len()
                });
                drop(registry);
                if let Some(count) = count {
                    streams::update_viewer_count(&self.pool, stream_id, count as i64).await?;
                }
                return Ok(());
            }
        }

        self.make_room().await?;

        // Install the registry entry; the subprocess is spawned after the
        // lock is released.
        {
            let mut registry = self.registry.lock().await;
            if registry.contains_key(stream_id) {
                return Ok(());
            }

            let stream = streams::get_stream(&self.pool, stream_id)
                .await?
                .ok_or_else(|| SupervisorError::StreamNotFound(stream_id.to_string()))?;

            streams::update_stream_status(
                &self.pool,
                stream_id,
                StreamStatus::Starting.as_str(),
                None,
                None,
            )
            .await?;

            let mut entry = StreamProcess::new(stream_id);
            if let Some(viewer) = viewer_id {
                entry.viewers.insert(viewer.to_string());
            }

            if stream.video_codec.is_none() {
                info!(stream_id, "no codec info on record, probing source");
                let result = probe::probe(&self.config.ffprobe_path, &stream.rtsp_url).await;
                if !result.is_valid {
                    let reason = result
                        .error
                        .unwrap_or_else(|| "failed to analyze source".to_string());
                    streams::update_stream_status(
                        &self.pool,
                        stream_id,
                        StreamStatus::Error.as_str(),
                        Some(&reason),
                        None,
                    )
                    .await?;
                    error!(stream_id, error = %reason, "source probe failed");
                    return Err(SupervisorError::ProbeFailed(reason));
                }
                streams::update_stream_info(
                    &self.pool,
                    stream_id,
                    result.video_codec.as_deref(),
                    result.audio_codec.as_deref(),
                    result.resolution().as_deref(),
                    result.framerate,
                    result.video_bitrate,
                )
                .await?;
                entry.probe = Some(result);
            }

            registry.insert(stream_id.to_string(), entry);
        }

        self.spawn_transcoder(stream_id).await?;

        let count = {
            self.registry
                .lock()
                .await
                .get(stream_id)
                .map(|e| e.viewers.len())
                .unwrap_or(0)
        };
        streams::update_viewer_count(&self.pool, stream_id, count as i64).await?;
        Ok(())
    }

    /// FIFO eviction: stop the feed with the oldest `start_time` until the
    /// registry is below the concurrency cap. Victims are stopped outside
    /// the registry lock.
    async fn make_room(&self) -> Result<(), SupervisorError> {
        loop {
            let max = settings::runtime_settings_with(&self.pool, &self.config.runtime_defaults)
                .await?
                .max_concurrent_streams;

            let victim = {
                let registry = self.registry.lock().await;
                if registry.len() < max {
                    return Ok(());
                }
                oldest_stream_id(&registry)
            };

            match victim {
                Some(victim) => {
                    info!(
                        victim = %victim,
                        max_concurrent = max,
                        "concurrency cap reached, evicting oldest feed"
                    );
                    self.stop_stream(&victim).await;
                }
                // Everything in the registry is still mid-start; nothing to
                // evict yet.
                None => return Ok(()),
            }
        }
    }

    /// Launch the transcoder for an installed registry entry. Also the
    /// reconnect path, so it reuses the entry rather than creating one.
    fn spawn_transcoder<'a>(
        self: &'a Arc<Self>,
        stream_id: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), SupervisorError>> + Send + 'a>>
    {
        Box::pin(async move {
        let (child_slot, probe) = {
            let registry = self.registry.lock().await;
            match registry.get(stream_id) {
                Some(entry) => (entry.child.clone(), entry.probe.clone()),
                // Stopped before we got here.
                None => return Err(SupervisorError::StreamNotFound(stream_id.to_string())),
            }
        };

        let stream = streams::get_stream(&self.pool, stream_id)
            .await?
            .ok_or_else(|| SupervisorError::StreamNotFound(stream_id.to_string()))?;

        let out_dir = self.config.streams_dir.join(stream_id);

        let spawned: Result<Child, SupervisorError> = async {
            tokio::fs::create_dir_all(&out_dir).await?;

            let rt = settings::runtime_settings_with(&self.pool, &self.config.runtime_defaults)
                .await?;
            let hls = HlsDefaults {
                hls_time: rt.hls_time,
                hls_list_size: rt.hls_list_size,
            };
            let command = build_hls_command(&stream, probe.as_ref(), &out_dir, &hls);
            debug!(
                stream_id,
                command = %command.to_display(&self.config.ffmpeg_path),
                "planned transcoder command"
            );

            let log_file = std::fs::File::create(out_dir.join("transcoder.log"))
                .map_err(|e| SupervisorError::SpawnFailed(format!("create log file: {e}")))?;

            tokio::process::Command::new(&self.config.ffmpeg_path)
                .args(command.build())
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::from(log_file))
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| SupervisorError::SpawnFailed(format!("launch transcoder: {e}")))
        }
        .await;

        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                streams::update_stream_status(
                    &self.pool,
                    stream_id,
                    StreamStatus::Error.as_str(),
                    Some(&e.to_string()),
                    None,
                )
                .await?;
                self.registry.lock().await.remove(stream_id);
                error!(stream_id, error = %e, "failed to start transcoder");
                return Err(e);
            }
        };

        let pid = child.id();
        {
            *child_slot.lock().await = Some(child);
        }

        let monitor = tokio::spawn(
            Arc::clone(self).monitor(stream_id.to_string(), child_slot.clone()),
        );

        let mode = StreamMode::parse(&stream.mode).unwrap_or(StreamMode::OnDemand);
        {
            let mut registry = self.registry.lock().await;
            match registry.get_mut(stream_id) {
                Some(entry) => {
                    entry.pid = pid;
                    if entry.start_time.is_none() {
                        entry.start_time = Some(Instant::now());
                    }
                    entry.monitor_task = Some(monitor);

                    // Viewer-driven feeds expire after their idle window.
                    // Reconnects keep the existing watchdog.
                    if mode.is_on_demand() && entry.keep_alive_task.is_none() {
                        let keep_alive =
                            Duration::from_secs(stream.keep_alive_seconds.clamp(10, 3600) as u64);
                        entry.keep_alive_task = Some(tokio::spawn(
                            Arc::clone(self).keep_alive_watchdog(stream_id.to_string(), keep_alive),
                        ));
                    }
                }
                None => {
                    // Stopped in the window between spawn and re-lock;
                    // reap the orphan.
                    drop(registry);
                    monitor.abort();
                    let _ = monitor.await;
                    if let Some(mut child) = child_slot.lock().await.take() {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                    }
                    return Err(SupervisorError::StreamNotFound(stream_id.to_string()));
                }
            }
        }

        streams::update_stream_status(
            &self.pool,
            stream_id,
            StreamStatus::Running.as_str(),
            None,
            pid.map(|p| p as i64),
        )
        .await?;

        info!(stream_id, pid, "transcoder started");
        Ok(())
        })
    }

    /// Wait for the transcoder to exit and drive the reconnect state
    /// machine. Polls with brief child-lock acquisitions so `stop_stream`
    /// can take the child at any point.
    async fn monitor(self: Arc<Self>, stream_id: String, child_slot: Arc<Mutex<Option<Child>>>) {
        let status = loop {
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
            let mut slot = child_slot.lock().await;
            let Some(child) = slot.as_mut() else {
                // stop_stream owns teardown now.
                return;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    slot.take();
                    break Some(status);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(stream_id = %stream_id, error = %e, "failed to poll transcoder exit");
                    slot.take();
                    break None;
                }
            }
        };

        let exit_ok = status.map(|s| s.success()).unwrap_or(false);
        info!(
            stream_id = %stream_id,
            code = status.and_then(|s| s.code()),
            "transcoder exited"
        );

        if exit_ok {
            if let Err(e) = streams::update_stream_status(
                &self.pool,
                &stream_id,
                StreamStatus::Stopped.as_str(),
                None,
                None,
            )
            .await
            {
                warn!(stream_id = %stream_id, error = %e, "failed to persist stopped status");
            }
            // Persisted first, then removed.
            self.remove_own_entry(&stream_id, &child_slot).await;
            return;
        }

        // Abnormal exit: consult the reconnect budget. A fresh session may
        // have replaced this one; only the session owning `child_slot` may
        // drive the entry.
        let attempt = {
            let mut registry = self.registry.lock().await;
            let Some(entry) = registry.get_mut(&stream_id) else {
                return;
            };
            if !Arc::ptr_eq(&entry.child, &child_slot) {
                return;
            }
            if entry.reconnect_count < self.config.max_reconnect_attempts {
                entry.reconnect_count += 1;
                Some(entry.reconnect_count)
            } else {
                None
            }
        };

        match attempt {
            Some(attempt) => {
                let message = format!("reconnecting (attempt {attempt})");
                if let Err(e) = streams::update_stream_status(
                    &self.pool,
                    &stream_id,
                    StreamStatus::Reconnecting.as_str(),
                    Some(&message),
                    None,
                )
                .await
                {
                    warn!(stream_id = %stream_id, error = %e, "failed to persist reconnecting status");
                }
                info!(stream_id = %stream_id, attempt, "transcoder exited abnormally, reconnecting");

                tokio::time::sleep(Duration::from_secs(self.config.reconnect_delay)).await;

                // Reuses the existing entry; a fresh monitor task replaces
                // this one on success.
                if let Err(e) = self.spawn_transcoder(&stream_id).await {
                    warn!(stream_id = %stream_id, error = %e, "reconnect attempt failed");
                }
            }
            None => {
                let tail = self.stderr_tail(&stream_id).await;
                let reason = if tail.trim().is_empty() {
                    "transcoder exited abnormally".to_string()
                } else {
                    classify_error(&tail)
                };
                if let Err(e) = streams::update_stream_status(
                    &self.pool,
                    &stream_id,
                    StreamStatus::Error.as_str(),
                    Some(&reason),
                    None,
                )
                .await
                {
                    warn!(stream_id = %stream_id, error = %e, "failed to persist error status");
                }
                error!(stream_id = %stream_id, error = %reason, "reconnect budget exhausted");
                self.remove_own_entry(&stream_id, &child_slot).await;
            }
        }
    }

    /// Remove a registry entry, but only when it still belongs to the
    /// session that owns `child_slot`.
    async fn remove_own_entry(&self, stream_id: &str, child_slot: &Arc<Mutex<Option<Child>>>) {
        let mut registry = self.registry.lock().await;
        if registry
            .get(stream_id)
            .is_some_and(|entry| Arc::ptr_eq(&entry.child, child_slot))
        {
            registry.remove(stream_id);
        }
    }

    /// Evict a viewer-driven feed once it has been idle past its keep-alive
    /// window. Runs until the feed disappears from the registry or it
    /// triggers the eviction itself.
    async fn keep_alive_watchdog(self: Arc<Self>, stream_id: String, keep_alive: Duration) {
        loop {
            tokio::time::sleep(KEEP_ALIVE_CHECK_INTERVAL).await;

            let idle = {
                let registry = self.registry.lock().await;
                match registry.get(&stream_id) {
                    None => return,
                    Some(entry) => {
                        entry.viewers.is_empty() && entry.last_viewer_time.elapsed() >= keep_alive
                    }
                }
            };

            if idle {
                info!(
                    stream_id = %stream_id,
                    idle_secs = keep_alive.as_secs(),
                    "no viewers within keep-alive window, stopping feed"
                );
                // from_watchdog: must not abort-and-await our own task.
                self.teardown(&stream_id, true).await;
                return;
            }
        }
    }

    /// Stop a feed. Idempotent; returns false when it was not supervised.
    pub async fn stop_stream(&self, stream_id: &str) -> bool {
        self.teardown(stream_id, false).await
    }

    /// Pop the entry under the lock, then dismantle it outside: cancel the
    /// watchdog, terminate the subprocess (SIGTERM, grace, SIGKILL), cancel
    /// the monitor, persist `stopped`.
    async fn teardown(&self, stream_id: &str, from_watchdog: bool) -> bool {
        let entry = { self.registry.lock().await.remove(stream_id) };
        let Some(mut entry) = entry else {
            return false;
        };

        if !from_watchdog {
            if let Some(handle) = entry.keep_alive_task.take() {
                handle.abort();
                let _ = handle.await;
            }
        }

        let child = { entry.child.lock().await.take() };
        if let Some(mut child) = child {
            terminate_child(stream_id, &mut child).await;
        }

        if let Some(handle) = entry.monitor_task.take() {
            handle.abort();
            let _ = handle.await;
        }

        if let Err(e) = streams::update_stream_status(
            &self.pool,
            stream_id,
            StreamStatus::Stopped.as_str(),
            None,
            None,
        )
        .await
        {
            warn!(stream_id, error = %e, "failed to persist stopped status");
        }
        info!(stream_id, "stream stopped");
        true
    }

    /// Record a viewer heartbeat, lazily starting viewer-driven feeds.
    /// Returns whether the feed is (now) running.
    pub async fn viewer_heartbeat(
        self: &Arc<Self>,
        stream_id: &str,
        viewer_id: &str,
    ) -> Result<bool, SupervisorError> {
        let count = {
            let mut registry = self.registry.lock().await;
            registry.get_mut(stream_id).map(|entry| {
                entry.viewers.insert(viewer_id.to_string());
                entry.last_viewer_time = Instant::now();
                entry.viewers.len()
            })
        };

        if let Some(count) = count {
            streams::update_viewer_count(&self.pool, stream_id, count as i64).await?;
            return Ok(true);
        }

        let stream = streams::get_stream(&self.pool, stream_id)
            .await?
            .ok_or_else(|| SupervisorError::StreamNotFound(stream_id.to_string()))?;
        let mode = StreamMode::parse(&stream.mode).unwrap_or(StreamMode::OnDemand);
        if !mode.is_on_demand() {
            // always_on feeds are started at boot; a heartbeat does not
            // revive them.
            return Ok(false);
        }

        match self.start_stream(stream_id, Some(viewer_id)).await {
            Ok(()) => Ok(true),
            Err(e @ SupervisorError::StreamNotFound(_)) => Err(e),
            Err(e) => {
                warn!(stream_id, error = %e, "lazy start from heartbeat failed");
                Ok(false)
            }
        }
    }

    /// Drop a viewer. Refreshes `last_viewer_time` so the idle clock starts
    /// from the disconnect.
    pub async fn viewer_disconnect(
        &self,
        stream_id: &str,
        viewer_id: &str,
    ) -> Result<(), SupervisorError> {
        let count = {
            let mut registry = self.registry.lock().await;
            registry.get_mut(stream_id).and_then(|entry| {
                entry.viewers.remove(viewer_id).then(|| {
                    entry.last_viewer_time = Instant::now();
                    entry.viewers.len()
                })
            })
        };

        if let Some(count) = count {
            streams::update_viewer_count(&self.pool, stream_id, count as i64).await?;
        }
        Ok(())
    }

    /// Last bytes of the transcoder's stderr log, for exit classification.
    async fn stderr_tail(&self, stream_id: &str) -> String {
        let path = self.config.streams_dir.join(stream_id).join("transcoder.log");
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let start = bytes.len().saturating_sub(STDERR_TAIL_BYTES);
                String::from_utf8_lossy(&bytes[start..]).into_owned()
            }
            Err(_) => String::new(),
        }
    }
}

/// The FIFO eviction victim: the registered feed with the oldest
/// `start_time`. Entries still mid-start (no `start_time` yet) are skipped.
fn oldest_stream_id(registry: &HashMap<String, StreamProcess>) -> Option<String> {
    registry
        .values()
        .filter_map(|entry| entry.start_time.map(|t| (t, &entry.stream_id)))
        .min_by_key(|(t, _)| *t)
        .map(|(_, id)| id.clone())
}

/// SIGTERM first so ffmpeg can finalize the playlist, SIGKILL after the
/// grace period.
async fn terminate_child(stream_id: &str, child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
            Ok(_) => return,
            Err(_) => warn!(stream_id, pid, "transcoder ignored SIGTERM, killing"),
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamgate_db::repo::streams::NewStream;

    async fn test_supervisor() -> Arc<Supervisor> {
        let pool = streamgate_db::connect(":memory:").await.unwrap();
        streamgate_db::migrate::run(&pool).await.unwrap();

        let config = SupervisorConfig {
            ffmpeg_path: "/nonexistent/ffmpeg".into(),
            ffprobe_path: "/nonexistent/ffprobe".into(),
            streams_dir: std::env::temp_dir().join(format!("sg_test_{}", std::process::id())),
            ..SupervisorConfig::default()
        };
        Supervisor::new(pool, config)
    }

    async fn seed_stream(supervisor: &Supervisor, name: &str, mode: &str) -> String {
        let row = streams::create_stream(
            supervisor.pool(),
            &NewStream {
                name: name.to_string(),
                rtsp_url: format!("rtsp://cam.local/{name}"),
                mode: mode.to_string(),
                ..NewStream::default()
            },
        )
        .await
        .unwrap();
        row.id
    }

    /// Insert a registry entry without a subprocess, as if the feed had
    /// been running for `age_secs`.
    async fn insert_entry(supervisor: &Supervisor, stream_id: &str, age_secs: u64) {
        let mut entry = StreamProcess::new(stream_id);
        entry.start_time = Some(
            Instant::now()
                .checked_sub(Duration::from_secs(age_secs))
                .unwrap_or_else(Instant::now),
        );
        supervisor
            .registry
            .lock()
            .await
            .insert(stream_id.to_string(), entry);
    }

    #[tokio::test]
    async fn oldest_entry_is_the_fifo_victim() {
        let supervisor = test_supervisor().await;
        insert_entry(&supervisor, "young", 10).await;
        insert_entry(&supervisor, "old", 300).await;
        insert_entry(&supervisor, "middle", 100).await;

        let registry = supervisor.registry.lock().await;
        assert_eq!(oldest_stream_id(&registry).as_deref(), Some("old"));
    }

    #[tokio::test]
    async fn entries_without_start_time_are_not_victims() {
        let supervisor = test_supervisor().await;
        supervisor
            .registry
            .lock()
            .await
            .insert("starting".to_string(), StreamProcess::new("starting"));

        let registry = supervisor.registry.lock().await;
        assert_eq!(oldest_stream_id(&registry), None);
    }

    #[tokio::test]
    async fn make_room_evicts_oldest_first() {
        let supervisor = test_supervisor().await;
        let a = seed_stream(&supervisor, "a", "on_demand").await;
        let b = seed_stream(&supervisor, "b", "on_demand").await;
        let c = seed_stream(&supervisor, "c", "on_demand").await;

        settings::set(supervisor.pool(), "max_concurrent_streams", "2")
            .await
            .unwrap();

        insert_entry(&supervisor, &a, 300).await;
        insert_entry(&supervisor, &b, 200).await;
        insert_entry(&supervisor, &c, 100).await;

        supervisor.make_room().await.unwrap();

        assert!(!supervisor.is_running(&a).await);
        assert!(!supervisor.is_running(&b).await);
        assert!(supervisor.is_running(&c).await);

        // Evicted feeds are persisted as stopped.
        let row = streams::get_stream(supervisor.pool(), &a).await.unwrap().unwrap();
        assert_eq!(row.status, "stopped");
    }

    #[tokio::test]
    async fn stop_stream_is_idempotent() {
        let supervisor = test_supervisor().await;
        let id = seed_stream(&supervisor, "cam", "on_demand").await;
        insert_entry(&supervisor, &id, 5).await;

        assert!(supervisor.stop_stream(&id).await);
        assert!(!supervisor.stop_stream(&id).await);
        assert!(!supervisor.is_running(&id).await);
    }

    #[tokio::test]
    async fn heartbeat_tracks_viewers_on_running_feed() {
        let supervisor = test_supervisor().await;
        let id = seed_stream(&supervisor, "cam", "on_demand").await;
        insert_entry(&supervisor, &id, 5).await;

        assert!(supervisor.viewer_heartbeat(&id, "viewer-1").await.unwrap());
        assert!(supervisor.viewer_heartbeat(&id, "viewer-2").await.unwrap());
        // Duplicate heartbeats do not double-count.
        assert!(supervisor.viewer_heartbeat(&id, "viewer-1").await.unwrap());

        let status = supervisor.get_status(&id).await;
        assert_eq!(status.viewer_count, 2);

        let row = streams::get_stream(supervisor.pool(), &id).await.unwrap().unwrap();
        assert_eq!(row.viewer_count, 2);

        supervisor.viewer_disconnect(&id, "viewer-1").await.unwrap();
        let status = supervisor.get_status(&id).await;
        assert_eq!(status.viewer_count, 1);

        // Unknown viewer is a no-op.
        supervisor.viewer_disconnect(&id, "ghost").await.unwrap();
        let row = streams::get_stream(supervisor.pool(), &id).await.unwrap().unwrap();
        assert_eq!(row.viewer_count, 1);
    }

    #[tokio::test]
    async fn heartbeat_does_not_revive_always_on() {
        let supervisor = test_supervisor().await;
        let id = seed_stream(&supervisor, "lobby", "always_on").await;

        let running = supervisor.viewer_heartbeat(&id, "v").await.unwrap();
        assert!(!running);
        assert!(!supervisor.is_running(&id).await);
    }

    #[tokio::test]
    async fn heartbeat_unknown_stream_errors() {
        let supervisor = test_supervisor().await;
        let result = supervisor.viewer_heartbeat("missing", "v").await;
        assert!(matches!(result, Err(SupervisorError::StreamNotFound(_))));
    }

    #[tokio::test]
    async fn start_fails_cleanly_when_probe_binary_missing() {
        let supervisor = test_supervisor().await;
        let id = seed_stream(&supervisor, "cam", "on_demand").await;

        // No codec info on record, so start probes first; the probe binary
        // does not exist.
        let result = supervisor.start_stream(&id, None).await;
        assert!(matches!(result, Err(SupervisorError::ProbeFailed(_))));
        assert!(!supervisor.is_running(&id).await);

        let row = streams::get_stream(supervisor.pool(), &id).await.unwrap().unwrap();
        assert_eq!(row.status, "error");
        assert!(row.last_error.is_some());
    }

    #[tokio::test]
    async fn start_fails_cleanly_when_transcoder_binary_missing() {
        let supervisor = test_supervisor().await;
        let id = seed_stream(&supervisor, "cam", "on_demand").await;
        // Codec info present: the probe is skipped and the spawn itself
        // fails.
        streams::update_stream_info(
            supervisor.pool(),
            &id,
            Some("h264"),
            Some("aac"),
            Some("1920x1080"),
            Some(25.0),
            None,
        )
        .await
        .unwrap();

        let result = supervisor.start_stream(&id, Some("viewer-1")).await;
        assert!(matches!(result, Err(SupervisorError::SpawnFailed(_))));
        assert!(!supervisor.is_running(&id).await);

        let row = streams::get_stream(supervisor.pool(), &id).await.unwrap().unwrap();
        assert_eq!(row.status, "error");
    }

    #[tokio::test]
    async fn start_unknown_stream_errors() {
        let supervisor = test_supervisor().await;
        let result = supervisor.start_stream("nope", None).await;
        assert!(matches!(result, Err(SupervisorError::StreamNotFound(_))));
    }

    #[tokio::test]
    async fn status_snapshot_for_stopped_feed() {
        let supervisor = test_supervisor().await;
        let status = supervisor.get_status("anything").await;
        assert!(!status.running);
        assert_eq!(status.viewer_count, 0);
        assert_eq!(status.pid, None);
    }
}
