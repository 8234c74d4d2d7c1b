/// Database layer for the moderation service
///
/// Manages the SQLite connection pool, embedded migrations, and the
/// timestamp encoding shared by every table.
use crate::error::{ModerationError, ModerationResult};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;

/// Database connection options
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub max_connections: u32,
    pub enable_wal: bool,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            enable_wal: true,
        }
    }
}

/// Create a SQLite connection pool backed by a file
pub async fn create_pool(path: &Path, options: DatabaseOptions) -> ModerationResult<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(options.max_connections)
        .connect_with(
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(if options.enable_wal {
                    SqliteJournalMode::Wal
                } else {
                    SqliteJournalMode::Delete
                })
                .foreign_keys(true)
                .busy_timeout(std::time::Duration::from_secs(5)),
        )
        .await?;

    Ok(pool)
}

/// Create an in-memory pool with migrations applied
///
/// A single connection is used because every SQLite memory connection is a
/// separate database.
pub async fn create_memory_pool() -> ModerationResult<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(SqliteConnectOptions::new().in_memory(true))
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Run migrations embedded at compile time from ./migrations
pub async fn run_migrations(pool: &SqlitePool) -> ModerationResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Test database connection
pub async fn test_connection(pool: &SqlitePool) -> ModerationResult<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Encode a timestamp for storage
///
/// Fixed-width UTC with microseconds so string order equals time order.
pub fn to_db_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a stored timestamp
pub fn parse_db_timestamp(raw: &str) -> ModerationResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ModerationError::Internal(format!("Invalid timestamp {}: {}", raw, e)))
}

/// Decode a nullable stored timestamp
pub fn parse_optional_timestamp(raw: Option<String>) -> ModerationResult<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_db_timestamp).transpose()
}

/// Clamp 1-based page parameters and return `(limit, offset)`
pub fn page_bounds(page: Option<i64>, page_size: Option<i64>) -> (i64, i64) {
    let page = page.unwrap_or(1).max(1);
    let page_size = page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    (page_size, (page - 1) * page_size)
}

pub const DEFAULT_PAGE_SIZE: i64 = 25;
pub const MAX_PAGE_SIZE: i64 = 100;

/// Make every audit insert fail so rollback paths can be exercised
#[cfg(test)]
pub(crate) async fn reject_audit_writes(pool: &SqlitePool) {
    sqlx::query(
        "CREATE TRIGGER audit_logs_reject_insert BEFORE INSERT ON audit_logs \
         BEGIN SELECT RAISE(ABORT, 'audit store unavailable'); END",
    )
    .execute(pool)
    .await
    .unwrap();
}
