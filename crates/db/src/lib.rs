pub mod migrate;
pub mod repo;

use std::str::FromStr;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

/// Enough connections for the HTTP surface plus the supervisor's
/// background tasks (monitors, watchdogs, GC) writing status rows.
const CATALOG_POOL_SIZE: u32 = 5;

/// Open the catalog database, creating the file and its parent directory
/// on first boot. WAL keeps the supervisor's frequent status writes from
/// stalling playlist-path reads.
pub async fn connect(catalog_path: &str) -> Result<SqlitePool, sqlx::Error> {
    if let Some(dir) = std::path::Path::new(catalog_path).parent() {
        std::fs::create_dir_all(dir).ok();
    }

    SqlitePoolOptions::new()
        .max_connections(CATALOG_POOL_SIZE)
        .connect_with(
            SqliteConnectOptions::from_str(catalog_path)?
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .foreign_keys(true),
        )
        .await
}
