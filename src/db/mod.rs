//! SQLite persistence.
//!
//! Repository traits are the only way the engine touches the database. The
//! content repository exposes atomic single-statement primitives and nothing
//! that would let a caller read-modify-write a reference count.

pub mod content_repository;
pub mod file_repository;
pub mod usage_repository;

pub use content_repository::{ContentRepository, SqliteContentRepository};
pub use file_repository::{FileRecordRepository, SqliteFileRecordRepository};
pub use usage_repository::{SqliteUsageRepository, UsageRepository};

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{str::FromStr, time::Duration};
use tracing::{debug, info};

const MIGRATION_SQL: &str = include_str!("../../migrations/0001_init.sql");

/// Open (creating if needed) the database at `url`.
pub async fn connect(url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            info!(dir = %parent.display(), "created database directory");
        }
    }

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
}

/// A private in-memory database on a single long-lived connection.
pub async fn connect_in_memory() -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
}

/// Apply the embedded schema. Every statement is idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let statements = MIGRATION_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    info!(count = statements.len(), "running migration statements");

    for stmt in statements {
        debug!(sql = stmt, "executing migration statement");
        sqlx::query(stmt).execute(pool).await?;
    }

    Ok(())
}

/// Current time in unix milliseconds, the unit of claim leases.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = connect_in_memory().await.unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}
