//! Queue item types and status definitions.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Status of a queue item.
///
/// Transitions are driven exclusively by the worker:
/// `pending → downloading → {failed, playing}`, `playing → {done, failed}`.
/// `done` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting to be processed.
    Pending,
    /// Currently being fetched from its source URL.
    Downloading,
    /// Currently on air.
    Playing,
    /// Broadcast completed.
    Done,
    /// Terminal failure (fetch, moderation, encoder or interruption).
    Failed,
}

impl QueueStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Playing => "playing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Returns true for `done` and `failed`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "downloading" => Ok(Self::Downloading),
            "playing" => Ok(Self::Playing),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid queue status: {s}")),
        }
    }
}

/// A new submission before it has a queue position.
#[derive(Debug, Clone)]
pub struct NewSubmission {
    /// Opaque globally-unique identifier.
    pub id: String,
    /// Source media URL as submitted.
    pub url: String,
    /// Chat handle of the requester.
    pub submitted_by: String,
    /// Optional "hear more at" link shown in the overlay.
    pub promo_link: Option<String>,
}

impl NewSubmission {
    /// Creates a submission with a fresh identifier.
    #[must_use]
    pub fn new(url: impl Into<String>, submitted_by: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            url: url.into(),
            submitted_by: submitted_by.into(),
            promo_link: None,
        }
    }

    /// Attaches a promo link.
    #[must_use]
    pub fn with_promo(mut self, promo_link: Option<String>) -> Self {
        self.promo_link = promo_link;
        self
    }
}

/// A single item in the submission queue.
#[derive(Debug, Clone, FromRow)]
pub struct QueueItem {
    /// Opaque globally-unique identifier.
    pub id: String,
    /// Source media URL as submitted.
    pub url: String,
    /// Local media file once fetched; cleared from disk at terminal states.
    pub file_path: Option<String>,
    /// Display title, at most 100 printable characters.
    pub title: String,
    /// Clip duration, known after the probe phase.
    pub duration_seconds: Option<f64>,
    /// Chat handle of the requester.
    pub submitted_by: String,
    /// Submission timestamp (UTC text, set by the store).
    pub submitted_at: String,
    /// Current lifecycle status (stored as text, parsed via `status()`).
    #[sqlx(rename = "status")]
    pub status_str: String,
    /// Failure detail when the item is `failed`.
    pub error_message: Option<String>,
    /// Optional "hear more at" link shown in the overlay.
    pub promo_link: Option<String>,
    /// FIFO key: unique and strictly increasing among pending items.
    pub position: Option<i64>,
}

impl QueueItem {
    /// Returns the parsed status enum.
    ///
    /// Falls back to `Pending` if the status string is invalid.
    #[must_use]
    pub fn status(&self) -> QueueStatus {
        self.status_str.parse().unwrap_or(QueueStatus::Pending)
    }

    /// Returns the local media file path, when one has been fetched.
    #[must_use]
    pub fn local_path(&self) -> Option<PathBuf> {
        self.file_path.as_deref().map(PathBuf::from)
    }
}

impl fmt::Display for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueueItem {{ id: {}, url: {}, status: {} }}",
            self.id,
            self.url,
            self.status()
        )
    }
}
