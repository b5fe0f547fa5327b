use sqlx::SqlitePool;

/// Get a setting value by key.
pub async fn get(pool: &SqlitePool, key: &str) -> Result<Option<String>, sqlx::Error> {
    let row: Option<(Option<String>,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(row.and_then(|(v,)| v))
}

/// Set a setting value (upsert).
pub async fn set(pool: &SqlitePool, key: &str, value: &str) -> Result<(), sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        "INSERT INTO settings (key, value, updated_ts) VALUES (?, ?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_ts = excluded.updated_ts",
    )
    .bind(key)
    .bind(value)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete a setting.
pub async fn delete(pool: &SqlitePool, key: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM settings WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Supervisor knobs tunable at runtime through the settings table. Absent or
/// unparsable values fall back to the defaults; out-of-range values are
/// clamped rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub max_concurrent_streams: usize,
    pub keep_alive_seconds: u64,
    pub segment_max_age_minutes: u64,
    pub hls_time: u32,
    pub hls_list_size: u32,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 30,
            keep_alive_seconds: 60,
            segment_max_age_minutes: 5,
            hls_time: 3,
            hls_list_size: 8,
        }
    }
}

/// Load the runtime-tunable settings, applying defaults and range clamps.
pub async fn runtime_settings(pool: &SqlitePool) -> Result<RuntimeSettings, sqlx::Error> {
    runtime_settings_with(pool, &RuntimeSettings::default()).await
}

/// Like [`runtime_settings`], but with caller-supplied fallback defaults
/// (boot-time configuration; the settings table still wins).
pub async fn runtime_settings_with(
    pool: &SqlitePool,
    defaults: &RuntimeSettings,
) -> Result<RuntimeSettings, sqlx::Error> {
    let max_concurrent_streams = parse_or(
        get(pool, "max_concurrent_streams").await?,
        defaults.max_concurrent_streams,
    )
    .max(1);
    let keep_alive_seconds = parse_or(
        get(pool, "keep_alive_seconds").await?,
        defaults.keep_alive_seconds,
    )
    .clamp(10, 3600);
    let segment_max_age_minutes = parse_or(
        get(pool, "segment_max_age_minutes").await?,
        defaults.segment_max_age_minutes,
    )
    .max(1);
    let hls_time = parse_or(get(pool, "hls_time").await?, defaults.hls_time).clamp(1, 10);
    let hls_list_size =
        parse_or(get(pool, "hls_list_size").await?, defaults.hls_list_size).clamp(3, 20);

    Ok(RuntimeSettings {
        max_concurrent_streams,
        keep_alive_seconds,
        segment_max_age_minutes,
        hls_time,
        hls_list_size,
    })
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
