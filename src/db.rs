//! SQLite-backed storage for the submission queue.
//!
//! Access pattern: the worker is the only sustained writer (status
//! transitions, enriched metadata), while the chat-facing command surface
//! issues short bursts of reads plus the occasional enqueue or clear. WAL
//! journaling lets those reads proceed while the worker writes; a busy
//! timeout covers the enqueue-vs-transition write collisions that remain.
//!
//! The schema lives in `migrations/` and is applied on open.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::instrument;

/// Connection pool size. One writer plus a few concurrent chat reads never
/// needs more; SQLite serialises writers on the file lock anyway.
const POOL_SIZE: u32 = 4;

/// How long a connection waits on a held write lock before giving up with
/// SQLITE_BUSY.
const LOCK_WAIT: Duration = Duration::from_secs(5);

/// Errors opening or migrating the queue database. Both are fatal at
/// startup.
#[derive(Debug, Error)]
pub enum DbError {
    /// The database file could not be opened or configured.
    #[error("could not open queue database: {0}")]
    Open(#[from] sqlx::Error),

    /// The schema migrations did not apply cleanly.
    #[error("queue schema migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Handle to the queue database: a configured connection pool with the
/// schema applied.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if necessary) the queue database at `db_path`,
    /// switches it to WAL journaling and applies pending migrations.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Open`] when the file cannot be opened and
    /// [`DbError::Migrate`] when the schema cannot be applied.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(LOCK_WAIT);

        let pool = SqlitePoolOptions::new()
            .max_connections(POOL_SIZE)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Opens a private in-memory database with the schema applied.
    ///
    /// The single-connection pool keeps the database alive for the handle's
    /// lifetime; WAL is pointless without a file, so the journal mode is
    /// left at its default.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Open`] or [`DbError::Migrate`] as in
    /// [`Database::new`].
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new().in_memory(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// The underlying connection pool, for executing queries.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes every pooled connection. The handle must not be used
    /// afterwards; call on shutdown so WAL checkpointing completes.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database_opens_with_schema() {
        let db = Database::new_in_memory().await.unwrap();

        let result = sqlx::query(
            "INSERT INTO queue (id, url, submitted_by) VALUES ('abc', 'https://example.com/a.mp4', 'alice')",
        )
        .execute(db.pool())
        .await;

        assert!(result.is_ok(), "queue table should exist after migration");
    }

    #[tokio::test]
    async fn test_schema_rejects_unknown_status() {
        let db = Database::new_in_memory().await.unwrap();

        let result = sqlx::query(
            "INSERT INTO queue (id, url, submitted_by, status) VALUES ('abc', 'https://example.com/a.mp4', 'alice', 'limbo')",
        )
        .execute(db.pool())
        .await;

        assert!(result.is_err(), "status CHECK constraint should fire");
    }

    #[tokio::test]
    async fn test_file_database_opens_in_wal_mode() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db = Database::new(&temp_dir.path().join("queue.db"))
            .await
            .unwrap();

        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_reopen_preserves_rows() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("queue.db");

        {
            let db = Database::new(&path).await.unwrap();
            sqlx::query(
                "INSERT INTO queue (id, url, submitted_by) VALUES ('abc', 'https://example.com/a.mp4', 'alice')",
            )
            .execute(db.pool())
            .await
            .unwrap();
            db.close().await;
        }

        let db = Database::new(&path).await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
