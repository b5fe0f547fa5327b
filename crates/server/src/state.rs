use std::sync::Arc;

use sqlx::SqlitePool;
use streamgate_supervisor::manager::Supervisor;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub supervisor: Arc<Supervisor>,
    /// Symmetric secret for playback tokens.
    pub secret_key: String,
    /// Static key guarding the management endpoints.
    pub api_key: String,
    /// Default playback token lifetime.
    pub token_expiry_hours: i64,
}
