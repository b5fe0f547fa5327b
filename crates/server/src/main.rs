use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use streamgate_db::repo::settings::RuntimeSettings;
use streamgate_supervisor::SupervisorConfig;
use streamgate_supervisor::manager::Supervisor;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let db_path = env_string("STREAMGATE_DB", "streamgate.db");
    info!(db_path = %db_path, "connecting to database");

    let pool = streamgate_db::connect(&db_path)
        .await
        .context("failed to connect to database")?;

    streamgate_db::migrate::run(&pool)
        .await
        .context("failed to run migrations")?;
    info!("migrations complete");

    // Playback token secret: configured or generated per boot (tokens then
    // expire with the process).
    let secret_key = match std::env::var("STREAMGATE_SECRET_KEY") {
        Ok(secret) => secret,
        Err(_) => {
            warn!("STREAMGATE_SECRET_KEY not set, playback tokens will not survive restarts");
            streamgate_core::id::generate_uid()
        }
    };

    let api_key = env_string("STREAMGATE_API_KEY", "change-this-api-key");
    if api_key == "change-this-api-key" {
        warn!("STREAMGATE_API_KEY left at its default, change it in production");
    }

    let streams_dir: PathBuf = env_string("STREAMGATE_STREAMS_DIR", "streams").into();
    std::fs::create_dir_all(&streams_dir).context("failed to create streams dir")?;

    let runtime_defaults = RuntimeSettings::default();
    let config = SupervisorConfig {
        ffmpeg_path: env_string("STREAMGATE_FFMPEG", "ffmpeg").into(),
        ffprobe_path: env_string("STREAMGATE_FFPROBE", "ffprobe").into(),
        streams_dir,
        runtime_defaults: RuntimeSettings {
            max_concurrent_streams: env_or(
                "STREAMGATE_MAX_CONCURRENT_STREAMS",
                runtime_defaults.max_concurrent_streams,
            ),
            keep_alive_seconds: env_or(
                "STREAMGATE_KEEP_ALIVE_SECONDS",
                runtime_defaults.keep_alive_seconds,
            ),
            segment_max_age_minutes: env_or(
                "STREAMGATE_SEGMENT_MAX_AGE_MINUTES",
                runtime_defaults.segment_max_age_minutes,
            ),
            hls_time: env_or("STREAMGATE_HLS_TIME", runtime_defaults.hls_time),
            hls_list_size: env_or("STREAMGATE_HLS_LIST_SIZE", runtime_defaults.hls_list_size),
        },
        startup_timeout: env_or("STREAMGATE_STARTUP_TIMEOUT", 15),
        reconnect_delay: env_or("STREAMGATE_RECONNECT_DELAY", 5),
        max_reconnect_attempts: env_or("STREAMGATE_MAX_RECONNECT_ATTEMPTS", 3),
        segment_cleanup_interval: env_or("STREAMGATE_SEGMENT_CLEANUP_INTERVAL", 30),
    };

    // Catalog cap; enforced by the catalog surface, logged here so the
    // operator can see the effective limits in one place.
    let max_streams: usize = env_or("STREAMGATE_MAX_STREAMS", 50);
    info!(
        max_streams,
        max_concurrent_streams = config.runtime_defaults.max_concurrent_streams,
        "stream limits"
    );

    let supervisor = Supervisor::new(pool.clone(), config);

    // Always-on feeds come up with the service.
    supervisor.start_always_on().await;

    // Segment GC and thumbnail refresh run for the process lifetime.
    tokio::spawn(supervisor.clone().run_segment_gc());
    tokio::spawn(supervisor.clone().run_thumbnail_refresh());

    let state = streamgate_server::state::AppState {
        db: pool,
        supervisor: supervisor.clone(),
        secret_key,
        api_key,
        token_expiry_hours: env_or("STREAMGATE_TOKEN_EXPIRY_HOURS", 24).max(1),
    };

    let app = streamgate_server::routes::build_router(state);

    let host = env_string("STREAMGATE_HOST", "0.0.0.0");
    let port: u16 = env_or("STREAMGATE_PORT", 8000);
    let bind_addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .context("failed to bind")?;
    info!(addr = %bind_addr, "server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Tear down every transcoder before exiting.
    supervisor.shutdown().await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
