//! Error types for queue operations.
//!
//! Store failures are folded into a small set of [`StoreErrorKind`] classes
//! so the worker's logs distinguish "another connection held the lock" from
//! "the schema rejected the write" without anyone parsing driver messages.

use std::fmt;

use thiserror::Error;

/// Broad classification of a store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// A write waited out the busy timeout behind another connection.
    /// SQLite reports this as SQLITE_BUSY or SQLITE_LOCKED.
    Contention,
    /// The schema rejected the write (CHECK, UNIQUE, NOT NULL, FK).
    Constraint,
    /// The connection pool is exhausted or shut down.
    Pool,
    /// File or driver I/O failed underneath the query.
    Io,
    /// Anything the classes above do not cover.
    Other,
}

impl StoreErrorKind {
    /// Stable lowercase label for log fields.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Contention => "contention",
            Self::Constraint => "constraint",
            Self::Pool => "pool",
            Self::Io => "io",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Maps an sqlx error onto a [`StoreErrorKind`].
///
/// Driver-level errors carry an SQLite result code; depending on the code
/// path it arrives as the numeric primary code ("5"/"6") or the symbolic
/// name, so both spellings are matched.
fn classify(error: &sqlx::Error) -> StoreErrorKind {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => StoreErrorKind::Pool,
        sqlx::Error::Io(_) => StoreErrorKind::Io,
        sqlx::Error::Database(db) => {
            if db.is_unique_violation() || db.is_check_violation() || db.is_foreign_key_violation()
            {
                return StoreErrorKind::Constraint;
            }
            match db.code().as_deref() {
                Some("5" | "6" | "SQLITE_BUSY" | "SQLITE_LOCKED") => StoreErrorKind::Contention,
                Some(code) if code.starts_with("SQLITE_CONSTRAINT") => StoreErrorKind::Constraint,
                _ => StoreErrorKind::Other,
            }
        }
        _ => StoreErrorKind::Other,
    }
}

/// Errors that can occur during queue operations.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// The underlying store failed.
    #[error("queue store failure ({kind}): {message}")]
    Store {
        /// Failure classification for operator logs.
        kind: StoreErrorKind,
        /// Driver error text.
        message: String,
    },

    /// No row exists for the given id.
    #[error("no queue item with id {0}")]
    ItemNotFound(String),
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store {
            kind: classify(&err),
            message: err.to_string(),
        }
    }
}

impl QueueError {
    /// The store failure class, when this is a store failure.
    #[must_use]
    pub fn store_kind(&self) -> Option<StoreErrorKind> {
        match self {
            Self::Store { kind, .. } => Some(*kind),
            Self::ItemNotFound(_) => None,
        }
    }

    /// True when the failure was lock contention and a later retry of the
    /// whole operation could succeed.
    #[must_use]
    pub fn is_contention(&self) -> bool {
        self.store_kind() == Some(StoreErrorKind::Contention)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_message_carries_kind_and_text() {
        let err = QueueError::Store {
            kind: StoreErrorKind::Io,
            message: "disk I/O error".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("queue store failure"));
        assert!(msg.contains("io"));
        assert!(msg.contains("disk I/O error"));
    }

    #[test]
    fn test_contention_flag() {
        let contended = QueueError::Store {
            kind: StoreErrorKind::Contention,
            message: "database is locked".to_string(),
        };
        assert!(contended.is_contention());
        assert_eq!(contended.store_kind(), Some(StoreErrorKind::Contention));

        let constraint = QueueError::Store {
            kind: StoreErrorKind::Constraint,
            message: "CHECK constraint failed".to_string(),
        };
        assert!(!constraint.is_contention());
    }

    #[test]
    fn test_item_not_found_message() {
        let err = QueueError::ItemNotFound("abc-123".to_string());
        let msg = err.to_string();
        assert!(msg.contains("no queue item"));
        assert!(msg.contains("abc-123"));
        assert!(err.store_kind().is_none());
    }

    #[test]
    fn test_kind_labels_are_stable() {
        assert_eq!(StoreErrorKind::Contention.label(), "contention");
        assert_eq!(StoreErrorKind::Constraint.label(), "constraint");
        assert_eq!(StoreErrorKind::Pool.label(), "pool");
        assert_eq!(StoreErrorKind::Io.label(), "io");
        assert_eq!(StoreErrorKind::Other.label(), "other");
        assert_eq!(StoreErrorKind::Pool.to_string(), "pool");
    }

    #[test]
    fn test_classify_pool_errors() {
        assert_eq!(classify(&sqlx::Error::PoolTimedOut), StoreErrorKind::Pool);
        assert_eq!(classify(&sqlx::Error::PoolClosed), StoreErrorKind::Pool);
    }

    #[test]
    fn test_classify_io_errors() {
        let io = sqlx::Error::Io(std::io::Error::other("underlying write failed"));
        assert_eq!(classify(&io), StoreErrorKind::Io);
    }

    #[test]
    fn test_classify_unrecognised_errors_as_other() {
        assert_eq!(classify(&sqlx::Error::RowNotFound), StoreErrorKind::Other);
    }

    #[test]
    fn test_queue_error_clone() {
        let err = QueueError::ItemNotFound("xyz".to_string());
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }
}
