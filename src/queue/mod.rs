//! Queue module for managing submission queue persistence.
//!
//! This module provides `SQLite`-backed queue management for tracking
//! submissions through their lifecycle
//! (pending → downloading → playing → done/failed).
//!
//! # Overview
//!
//! The queue system consists of:
//! - [`Queue`] - Main interface for queue operations
//! - [`QueueItem`] - Individual queue entry with metadata
//! - [`QueueStatus`] - Item lifecycle states
//! - [`QueueError`] - Operation error types
//!
//! # Ordering
//!
//! `position` is assigned at enqueue time as `max(position over pending) + 1`
//! inside a single INSERT, so concurrent submitters are serialised by the
//! database and obtain distinct, strictly increasing positions. Dequeue peeks
//! the lowest-position pending row without claiming it; the worker is the
//! only component that transitions statuses.
//!
//! # Example
//!
//! ```ignore
//! use jukestream::queue::{NewSubmission, Queue};
//! use jukestream::Database;
//!
//! let db = Database::new(Path::new("queue.db")).await?;
//! let queue = Queue::new(db);
//!
//! let submission = NewSubmission::new("https://example.com/clip.mp4", "alice");
//! let position = queue.enqueue(&submission).await?;
//!
//! if let Some(item) = queue.dequeue().await? {
//!     // ... fetch, moderate, broadcast ...
//! }
//! ```

mod error;
mod item;

pub use error::{QueueError, StoreErrorKind};
pub use item::{NewSubmission, QueueItem, QueueStatus};

use crate::db::Database;
use sqlx::Row;
use tracing::instrument;

/// Error reason recorded on crash remnants during startup repair.
pub const INTERRUPTED_REASON: &str = "interrupted";

/// Returns `Ok(())` if at least one row was affected; otherwise [`QueueError::ItemNotFound`].
fn check_affected(id: &str, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(QueueError::ItemNotFound(id.to_string()))
    } else {
        Ok(())
    }
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Queue manager for submissions.
///
/// Provides atomic operations for managing queue items backed by `SQLite`
/// with WAL mode for concurrent access.
#[derive(Debug, Clone)]
pub struct Queue {
    db: Database,
}

impl Queue {
    /// Creates a new queue manager with the given database connection.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Adds a new submission to the queue with pending status.
    ///
    /// The position is computed and the row inserted in one statement, so
    /// concurrent callers are serialised and receive distinct positions.
    ///
    /// # Returns
    ///
    /// The assigned queue position (1-based among pending items).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] if the insert fails.
    #[instrument(skip(self, submission), fields(id = %submission.id, url = %submission.url))]
    pub async fn enqueue(&self, submission: &NewSubmission) -> Result<i64> {
        let result = sqlx::query(
            r"INSERT INTO queue (id, url, submitted_by, promo_link, status, position)
              SELECT ?, ?, ?, ?, ?, COALESCE(MAX(position), 0) + 1
              FROM queue
              WHERE status = ?
              RETURNING position",
        )
        .bind(&submission.id)
        .bind(&submission.url)
        .bind(&submission.submitted_by)
        .bind(&submission.promo_link)
        .bind(QueueStatus::Pending.as_str())
        .bind(QueueStatus::Pending.as_str())
        .fetch_one(self.db.pool())
        .await?;

        Ok(result.get("position"))
    }

    /// Returns the pending item with the lowest position without claiming it.
    ///
    /// The worker owns the subsequent status transition; the row is left in
    /// `pending` until the worker marks it `downloading`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] if the query fails.
    #[instrument(skip(self))]
    pub async fn dequeue(&self) -> Result<Option<QueueItem>> {
        let item = sqlx::query_as::<_, QueueItem>(
            r"SELECT * FROM queue
              WHERE status = ?
              ORDER BY position ASC
              LIMIT 1",
        )
        .bind(QueueStatus::Pending.as_str())
        .fetch_optional(self.db.pool())
        .await?;

        Ok(item)
    }

    /// Updates an item's status and error detail atomically.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ItemNotFound`] if no item exists with the given ID.
    /// Returns [`QueueError::Store`] if the update fails.
    #[instrument(skip(self), fields(status = %status))]
    pub async fn update_status(
        &self,
        id: &str,
        status: QueueStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE queue SET status = ?, error_message = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(id)
        .execute(self.db.pool())
        .await?;

        check_affected(id, result.rows_affected())
    }

    /// Persists fields enriched during fetch (file path, title, duration)
    /// together with the item's current status and error detail.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ItemNotFound`] if no item exists with the given ID.
    /// Returns [`QueueError::Store`] if the update fails.
    #[instrument(skip(self, item), fields(id = %item.id))]
    pub async fn update_item(&self, item: &QueueItem) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE queue
              SET file_path = ?, title = ?, duration_seconds = ?, status = ?, error_message = ?
              WHERE id = ?",
        )
        .bind(&item.file_path)
        .bind(&item.title)
        .bind(item.duration_seconds)
        .bind(&item.status_str)
        .bind(&item.error_message)
        .bind(&item.id)
        .execute(self.db.pool())
        .await?;

        check_affected(&item.id, result.rows_affected())
    }

    /// Returns a snapshot of the next `limit` pending items in play order.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get_queue(&self, limit: i64) -> Result<Vec<QueueItem>> {
        let items = sqlx::query_as::<_, QueueItem>(
            r"SELECT * FROM queue
              WHERE status = ?
              ORDER BY position ASC
              LIMIT ?",
        )
        .bind(QueueStatus::Pending.as_str())
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        Ok(items)
    }

    /// Returns the single item currently in `playing` status, if any.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get_now_playing(&self) -> Result<Option<QueueItem>> {
        let item = sqlx::query_as::<_, QueueItem>(
            r"SELECT * FROM queue WHERE status = ? LIMIT 1",
        )
        .bind(QueueStatus::Playing.as_str())
        .fetch_optional(self.db.pool())
        .await?;

        Ok(item)
    }

    /// Returns the 1-based rank of an item among pending items, or `None`
    /// when the item is not pending.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] if the query fails.
    #[instrument(skip(self))]
    pub async fn position_of(&self, id: &str) -> Result<Option<i64>> {
        let row = sqlx::query(
            r"SELECT COUNT(*) as rank FROM queue
              WHERE status = ? AND position <= (
                  SELECT position FROM queue WHERE id = ? AND status = ?
              )",
        )
        .bind(QueueStatus::Pending.as_str())
        .bind(id)
        .bind(QueueStatus::Pending.as_str())
        .fetch_one(self.db.pool())
        .await?;

        let rank: i64 = row.get("rank");
        Ok((rank > 0).then_some(rank))
    }

    /// Removes all pending rows, leaving in-flight and terminal rows intact.
    ///
    /// # Returns
    ///
    /// The number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn clear_pending(&self) -> Result<u64> {
        let result = sqlx::query(r"DELETE FROM queue WHERE status = ?")
            .bind(QueueStatus::Pending.as_str())
            .execute(self.db.pool())
            .await?;

        Ok(result.rows_affected())
    }

    /// Removes a queue item by ID.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ItemNotFound`] if no item exists with the given ID.
    /// Returns [`QueueError::Store`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: &str) -> Result<()> {
        let result = sqlx::query(r"DELETE FROM queue WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;

        check_affected(id, result.rows_affected())
    }

    /// Gets a queue item by ID.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> Result<Option<QueueItem>> {
        let item = sqlx::query_as::<_, QueueItem>(r"SELECT * FROM queue WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(item)
    }

    /// Counts items by status.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] if the query fails.
    #[instrument(skip(self))]
    pub async fn count_by_status(&self, status: QueueStatus) -> Result<i64> {
        let result = sqlx::query(r"SELECT COUNT(*) as count FROM queue WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(self.db.pool())
            .await?;

        Ok(result.get("count"))
    }

    /// Startup repair: rewrites crash remnants to `failed("interrupted")`.
    ///
    /// Any row left in `downloading` or `playing` belongs to a previous
    /// process; partially-played items are abandoned, not resumed. Must run
    /// before the worker's first dequeue.
    ///
    /// # Returns
    ///
    /// The number of rows repaired.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] if the update fails.
    #[instrument(skip(self))]
    pub async fn repair_interrupted(&self) -> Result<u64> {
        let result = sqlx::query(
            r"UPDATE queue
              SET status = ?, error_message = ?
              WHERE status IN (?, ?)",
        )
        .bind(QueueStatus::Failed.as_str())
        .bind(INTERRUPTED_REASON)
        .bind(QueueStatus::Downloading.as_str())
        .bind(QueueStatus::Playing.as_str())
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    // Integration tests run against real SQLite files - see tests/queue_integration.rs
    // Unit tests for Queue struct methods are minimal since they're thin wrappers around SQL

    use super::*;

    #[test]
    fn test_queue_result_type_alias() {
        let ok_result: Result<i64> = Ok(42);
        assert!(ok_result.is_ok());

        let err_result: Result<i64> = Err(QueueError::ItemNotFound("gone".to_string()));
        assert!(err_result.is_err());
    }

    #[tokio::test]
    async fn test_update_status_returns_item_not_found_for_missing_id() {
        let db = crate::Database::new_in_memory().await.unwrap();
        let queue = Queue::new(db);

        let result = queue
            .update_status("missing", QueueStatus::Failed, Some("boom"))
            .await;
        assert!(
            matches!(result, Err(QueueError::ItemNotFound(ref id)) if id == "missing"),
            "expected ItemNotFound, got {result:?}"
        );
    }
}
