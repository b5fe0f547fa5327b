use sqlx::SqlitePool;

use streamgate_core::id::generate_uid;

const STREAM_COLUMNS: &str = "id, name, rtsp_url, mode, status, video_codec, audio_codec, \
     resolution, framerate, bitrate, ffmpeg_overrides, viewer_count, last_viewer_ts, \
     last_error, pid, keep_alive_seconds, use_transcode, latency_mode, thumbnail, \
     thumbnail_ts, created_ts, updated_ts";

/// A catalog row describing one feed.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StreamRow {
    pub id: String,
    pub name: String,
    pub rtsp_url: String,
    pub mode: String,
    pub status: String,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub resolution: Option<String>,
    pub framerate: Option<f64>,
    pub bitrate: Option<i64>,
    pub ffmpeg_overrides: Option<String>,
    pub viewer_count: i64,
    pub last_viewer_ts: Option<i64>,
    pub last_error: Option<String>,
    pub pid: Option<i64>,
    pub keep_alive_seconds: i64,
    pub use_transcode: bool,
    pub latency_mode: String,
    pub thumbnail: Option<String>,
    pub thumbnail_ts: Option<i64>,
    pub created_ts: i64,
    pub updated_ts: i64,
}

/// Fields supplied when registering a new feed.
#[derive(Debug, Clone)]
pub struct NewStream {
    pub name: String,
    pub rtsp_url: String,
    pub mode: String,
    pub keep_alive_seconds: i64,
    pub use_transcode: bool,
    pub latency_mode: String,
    pub ffmpeg_overrides: Option<String>,
}

impl Default for NewStream {
    fn default() -> Self {
        Self {
            name: String::new(),
            rtsp_url: String::new(),
            mode: "on_demand".to_string(),
            keep_alive_seconds: 60,
            use_transcode: false,
            latency_mode: "stable".to_string(),
            ffmpeg_overrides: None,
        }
    }
}

/// Register a new feed. Generates the 16-char url-safe id.
pub async fn create_stream(pool: &SqlitePool, new: &NewStream) -> Result<StreamRow, sqlx::Error> {
    let id = generate_uid();
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        "INSERT INTO streams (id, name, rtsp_url, mode, status, ffmpeg_overrides, \
         keep_alive_seconds, use_transcode, latency_mode, created_ts, updated_ts) \
         VALUES (?, ?, ?, ?, 'stopped', ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&new.name)
    .bind(&new.rtsp_url)
    .bind(&new.mode)
    .bind(&new.ffmpeg_overrides)
    .bind(new.keep_alive_seconds)
    .bind(new.use_transcode as i64)
    .bind(&new.latency_mode)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(StreamRow {
        id,
        name: new.name.clone(),
        rtsp_url: new.rtsp_url.clone(),
        mode: new.mode.clone(),
        status: "stopped".to_string(),
        video_codec: None,
        audio_codec: None,
        resolution: None,
        framerate: None,
        bitrate: None,
        ffmpeg_overrides: new.ffmpeg_overrides.clone(),
        viewer_count: 0,
        last_viewer_ts: None,
        last_error: None,
        pid: None,
        keep_alive_seconds: new.keep_alive_seconds,
        use_transcode: new.use_transcode,
        latency_mode: new.latency_mode.clone(),
        thumbnail: None,
        thumbnail_ts: None,
        created_ts: now,
        updated_ts: now,
    })
}

pub async fn get_stream(
    pool: &SqlitePool,
    stream_id: &str,
) -> Result<Option<StreamRow>, sqlx::Error> {
    sqlx::query_as(&format!("SELECT {STREAM_COLUMNS} FROM streams WHERE id = ?"))
        .bind(stream_id)
        .fetch_optional(pool)
        .await
}

pub async fn get_stream_by_url(
    pool: &SqlitePool,
    rtsp_url: &str,
) -> Result<Option<StreamRow>, sqlx::Error> {
    sqlx::query_as(&format!(
        "SELECT {STREAM_COLUMNS} FROM streams WHERE rtsp_url = ?"
    ))
    .bind(rtsp_url)
    .fetch_optional(pool)
    .await
}

/// Feeds that must run whenever the service is up.
pub async fn list_always_on(pool: &SqlitePool) -> Result<Vec<StreamRow>, sqlx::Error> {
    sqlx::query_as(&format!(
        "SELECT {STREAM_COLUMNS} FROM streams WHERE mode = 'always_on' ORDER BY created_ts"
    ))
    .fetch_all(pool)
    .await
}

pub async fn stream_exists(pool: &SqlitePool, stream_id: &str) -> Result<bool, sqlx::Error> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM streams WHERE id = ?")
        .bind(stream_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

pub async fn delete_stream(pool: &SqlitePool, stream_id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM streams WHERE id = ?")
        .bind(stream_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Record the supervisor's last intent for a feed, with optional error
/// detail and transcoder pid.
pub async fn update_stream_status(
    pool: &SqlitePool,
    stream_id: &str,
    status: &str,
    error: Option<&str>,
    pid: Option<i64>,
) -> Result<(), sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        "UPDATE streams SET status = ?, last_error = ?, pid = ?, updated_ts = ? WHERE id = ?",
    )
    .bind(status)
    .bind(error)
    .bind(pid)
    .bind(now)
    .bind(stream_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn update_viewer_count(
    pool: &SqlitePool,
    stream_id: &str,
    count: i64,
) -> Result<(), sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        "UPDATE streams SET viewer_count = ?, last_viewer_ts = ?, updated_ts = ? WHERE id = ?",
    )
    .bind(count)
    .bind(now)
    .bind(now)
    .bind(stream_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Persist codec info detected by the probe.
pub async fn update_stream_info(
    pool: &SqlitePool,
    stream_id: &str,
    video_codec: Option<&str>,
    audio_codec: Option<&str>,
    resolution: Option<&str>,
    framerate: Option<f64>,
    bitrate: Option<i64>,
) -> Result<(), sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        "UPDATE streams SET video_codec = ?, audio_codec = ?, resolution = ?, framerate = ?, \
         bitrate = ?, updated_ts = ? WHERE id = ?",
    )
    .bind(video_codec)
    .bind(audio_codec)
    .bind(resolution)
    .bind(framerate)
    .bind(bitrate)
    .bind(now)
    .bind(stream_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn update_thumbnail(
    pool: &SqlitePool,
    stream_id: &str,
    data_url: &str,
) -> Result<(), sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query("UPDATE streams SET thumbnail = ?, thumbnail_ts = ?, updated_ts = ? WHERE id = ?")
        .bind(data_url)
        .bind(now)
        .bind(now)
        .bind(stream_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> SqlitePool {
        let pool = crate::connect(":memory:").await.unwrap();
        crate::migrate::run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn create_and_fetch_stream() {
        let pool = test_pool().await;
        let created = create_stream(
            &pool,
            &NewStream {
                name: "front door".to_string(),
                rtsp_url: "rtsp://cam.local/stream1".to_string(),
                ..NewStream::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(created.id.len(), 16);
        assert_eq!(created.status, "stopped");

        let fetched = get_stream(&pool, &created.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "front door");
        assert_eq!(fetched.mode, "on_demand");
        assert!(!fetched.use_transcode);

        let by_url = get_stream_by_url(&pool, "rtsp://cam.local/stream1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_url.id, created.id);
    }

    #[tokio::test]
    async fn duplicate_url_rejected() {
        let pool = test_pool().await;
        let new = NewStream {
            name: "a".to_string(),
            rtsp_url: "rtsp://cam.local/dup".to_string(),
            ..NewStream::default()
        };
        create_stream(&pool, &new).await.unwrap();
        assert!(create_stream(&pool, &new).await.is_err());
    }

    #[tokio::test]
    async fn status_and_viewer_updates() {
        let pool = test_pool().await;
        let created = create_stream(
            &pool,
            &NewStream {
                name: "cam".to_string(),
                rtsp_url: "rtsp://cam.local/s".to_string(),
                ..NewStream::default()
            },
        )
        .await
        .unwrap();

        update_stream_status(&pool, &created.id, "running", None, Some(4242))
            .await
            .unwrap();
        let row = get_stream(&pool, &created.id).await.unwrap().unwrap();
        assert_eq!(row.status, "running");
        assert_eq!(row.pid, Some(4242));

        update_stream_status(&pool, &created.id, "error", Some("connection refused"), None)
            .await
            .unwrap();
        let row = get_stream(&pool, &created.id).await.unwrap().unwrap();
        assert_eq!(row.status, "error");
        assert_eq!(row.last_error.as_deref(), Some("connection refused"));
        assert_eq!(row.pid, None);

        update_viewer_count(&pool, &created.id, 3).await.unwrap();
        let row = get_stream(&pool, &created.id).await.unwrap().unwrap();
        assert_eq!(row.viewer_count, 3);
        assert!(row.last_viewer_ts.is_some());
    }

    #[tokio::test]
    async fn always_on_listing() {
        let pool = test_pool().await;
        create_stream(
            &pool,
            &NewStream {
                name: "a".to_string(),
                rtsp_url: "rtsp://a".to_string(),
                mode: "always_on".to_string(),
                ..NewStream::default()
            },
        )
        .await
        .unwrap();
        create_stream(
            &pool,
            &NewStream {
                name: "b".to_string(),
                rtsp_url: "rtsp://b".to_string(),
                ..NewStream::default()
            },
        )
        .await
        .unwrap();

        let rows = list_always_on(&pool).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "a");
    }
}
