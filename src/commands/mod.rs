//! Command surface for the external chat adapter.
//!
//! A thin, synchronous-feeling API over the queue store and the worker's
//! skip signal. The chat adapter owns transport, command parsing and user
//! identity; this module owns validation, authorisation and queue access.
//!
//! Command vocabulary exposed by adapters:
//!
//! | Command | Aliases | Who |
//! |---------|---------|-----|
//! | `request <media_url> [promo_url]` | `req`, `sr` | everyone |
//! | `queue` | `q` | everyone |
//! | `np` | `nowplaying`, `song`, `current` | everyone |
//! | `skip` | | moderator, broadcaster |
//! | `clear` | | broadcaster |
//! | `help` | | everyone |

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{info, instrument};
use unicode_normalization::UnicodeNormalization;

use crate::queue::{NewSubmission, Queue, QueueError, QueueItem};
use crate::worker::Worker;

/// Hosts accepted for media submissions.
pub const MEDIA_HOSTS: [&str; 4] = ["twitch.tv", "youtube.com", "youtu.be", "clips.twitch.tv"];

/// Direct-media suffixes accepted for submissions.
pub const MEDIA_SUFFIXES: [&str; 3] = [".mp4", ".mp3", ".webm"];

/// Hosts accepted for promo links (music platforms and socials).
pub const PROMO_HOSTS: [&str; 8] = [
    "youtube.com",
    "youtu.be",
    "soundcloud.com",
    "spotify.com",
    "bandcamp.com",
    "twitter.com",
    "x.com",
    "instagram.com",
];

/// Default number of entries returned by the queue preview.
pub const DEFAULT_QUEUE_PREVIEW: i64 = 5;

/// Caller role, as asserted by the chat adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Regular viewer.
    Viewer,
    /// Channel moderator.
    Moderator,
    /// Channel owner.
    Broadcaster,
}

impl Role {
    /// True for roles allowed to skip the current clip.
    #[must_use]
    pub fn can_skip(self) -> bool {
        matches!(self, Self::Moderator | Self::Broadcaster)
    }

    /// True for roles allowed to clear the pending queue.
    #[must_use]
    pub fn can_clear(self) -> bool {
        matches!(self, Self::Broadcaster)
    }
}

/// Errors surfaced to the chat adapter at command time.
///
/// These are the only user-visible failures; everything after a successful
/// submission is observable solely through `queue`/`np` and operator logs.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The media URL matches neither the host allow-list nor the
    /// direct-media suffixes.
    #[error("unsupported media URL: {url}")]
    UnsupportedUrl {
        /// The rejected URL.
        url: String,
    },

    /// The submitter handle is empty after normalisation.
    #[error("submitter handle must not be empty")]
    EmptySubmitter,

    /// The caller's role does not permit the action.
    #[error("{action} requires the {required} role")]
    NotAuthorized {
        /// Attempted action.
        action: &'static str,
        /// Minimum role.
        required: &'static str,
    },

    /// Queue store failure.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Result of a successful submission.
#[derive(Debug, Clone)]
pub struct Submission {
    /// The new item's opaque id.
    pub id: String,
    /// Assigned queue position (1-based among pending items).
    pub position: i64,
    /// True when a promo link was provided but dropped as unsupported.
    pub promo_dropped: bool,
    /// True on a user's first submission this process; the adapter shows
    /// the copyright advisory exactly once per user.
    pub first_submission_notice: bool,
}

/// Command surface over the store and the worker.
pub struct CommandSurface {
    queue: Queue,
    worker: Arc<Worker>,
    warned_users: Mutex<HashSet<String>>,
}

impl CommandSurface {
    /// Creates the surface.
    #[must_use]
    pub fn new(queue: Queue, worker: Arc<Worker>) -> Self {
        Self {
            queue,
            worker,
            warned_users: Mutex::new(HashSet::new()),
        }
    }

    /// Validates and enqueues a submission.
    ///
    /// Unsupported promo links are dropped silently (the submission still
    /// succeeds, with `promo_dropped` set so the adapter can mention it).
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::UnsupportedUrl`] or
    /// [`CommandError::EmptySubmitter`] on invalid input, and
    /// [`CommandError::Queue`] when the insert fails.
    #[instrument(skip(self, url, submitted_by, promo), fields(url = %url))]
    pub async fn submit(
        &self,
        url: &str,
        submitted_by: &str,
        promo: Option<&str>,
    ) -> Result<Submission, CommandError> {
        let url = url.trim();
        if !is_accepted_media_url(url) {
            return Err(CommandError::UnsupportedUrl {
                url: url.to_string(),
            });
        }

        let submitted_by = normalize_handle(submitted_by);
        if submitted_by.is_empty() {
            return Err(CommandError::EmptySubmitter);
        }

        let (promo_link, promo_dropped) = match promo.map(normalize_handle).filter(|p| !p.is_empty())
        {
            Some(p) if is_accepted_promo_url(&p) => (Some(p), false),
            Some(_) => (None, true),
            None => (None, false),
        };

        let first_submission_notice = self.mark_warned(&submitted_by);

        let submission =
            NewSubmission::new(url, submitted_by.clone()).with_promo(promo_link.clone());
        let position = self.queue.enqueue(&submission).await?;

        info!(
            id = %submission.id,
            position,
            submitted_by = %submitted_by,
            promo = ?promo_link,
            "submission queued"
        );

        Ok(Submission {
            id: submission.id,
            position,
            promo_dropped,
            first_submission_notice,
        })
    }

    /// Returns the next `limit` pending items in play order.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Queue`] when the read fails.
    pub async fn queue_preview(&self, limit: i64) -> Result<Vec<QueueItem>, CommandError> {
        Ok(self.queue.get_queue(limit).await?)
    }

    /// Returns the clip currently on air, if any.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Queue`] when the read fails.
    pub async fn now_playing(&self) -> Result<Option<QueueItem>, CommandError> {
        Ok(self.queue.get_now_playing().await?)
    }

    /// Skips the current clip. Moderators and the broadcaster only.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::NotAuthorized`] for other roles.
    pub fn skip(&self, role: Role) -> Result<(), CommandError> {
        if !role.can_skip() {
            return Err(CommandError::NotAuthorized {
                action: "skip",
                required: "moderator",
            });
        }
        info!("skip requested");
        self.worker.skip();
        Ok(())
    }

    /// Clears the pending queue. Broadcaster only; the clip currently on
    /// air is unaffected.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::NotAuthorized`] for other roles and
    /// [`CommandError::Queue`] when the delete fails.
    pub async fn clear(&self, role: Role) -> Result<u64, CommandError> {
        if !role.can_clear() {
            return Err(CommandError::NotAuthorized {
                action: "clear",
                required: "broadcaster",
            });
        }
        let removed = self.queue.clear_pending().await?;
        info!(removed, "queue cleared");
        Ok(removed)
    }

    /// Records that a user has been shown the first-submission advisory.
    /// Returns true the first time a (lowercased) handle is seen.
    fn mark_warned(&self, submitted_by: &str) -> bool {
        let mut warned = match self.warned_users.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        warned.insert(submitted_by.to_lowercase())
    }
}

/// NFC-normalises and trims a handle or promo string.
fn normalize_handle(raw: &str) -> String {
    raw.trim().nfc().collect()
}

/// A media URL is accepted when its lowercased form contains an accepted
/// host or a direct-media suffix.
#[must_use]
pub fn is_accepted_media_url(url: &str) -> bool {
    let lowered = url.to_lowercase();
    MEDIA_HOSTS.iter().any(|host| lowered.contains(host))
        || MEDIA_SUFFIXES.iter().any(|suffix| lowered.contains(suffix))
}

/// A promo URL is accepted when its lowercased form contains an allowed
/// music/social host.
#[must_use]
pub fn is_accepted_promo_url(url: &str) -> bool {
    let lowered = url.to_lowercase();
    PROMO_HOSTS.iter().any(|host| lowered.contains(host))
}
