//! Error types for the fetch module.
//!
//! Each variant's display form starts with the stable error code that is
//! recorded on the queue item, so operator logs and the `queue` command can
//! classify failures without parsing prose.

use thiserror::Error;

/// Errors that can occur while resolving a submission to a local media file.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Metadata probe failed (bad URL, unsupported site, malformed JSON).
    #[error("probe_failed: {detail}")]
    ProbeFailed {
        /// Human-readable failure detail.
        detail: String,
    },

    /// Probed duration exceeds the configured cap; nothing was downloaded.
    #[error("duration_exceeded: {duration:.0}s exceeds max {limit:.0}s")]
    DurationExceeded {
        /// Duration reported by the probe.
        duration: f64,
        /// Configured cap.
        limit: f64,
    },

    /// Download subprocess exited non-zero or produced no file.
    #[error("download_failed: {detail}")]
    DownloadFailed {
        /// Human-readable failure detail.
        detail: String,
    },

    /// Download exceeded its wall-clock budget; the child was killed.
    #[error("download_timeout: exceeded {seconds}s")]
    DownloadTimeout {
        /// The budget that was exceeded.
        seconds: u64,
    },

    /// Downloaded file exceeds the configured size cap.
    #[error("file_too_large: exceeds {limit_mb} MB")]
    FileTooLarge {
        /// Configured cap in megabytes.
        limit_mb: u64,
    },
}

impl FetchError {
    /// Returns the stable error code for this failure.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ProbeFailed { .. } => "probe_failed",
            Self::DurationExceeded { .. } => "duration_exceeded",
            Self::DownloadFailed { .. } => "download_failed",
            Self::DownloadTimeout { .. } => "download_timeout",
            Self::FileTooLarge { .. } => "file_too_large",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_starts_with_code() {
        let errors = [
            FetchError::ProbeFailed {
                detail: "no metadata".to_string(),
            },
            FetchError::DurationExceeded {
                duration: 3600.0,
                limit: 600.0,
            },
            FetchError::DownloadFailed {
                detail: "exit status 1".to_string(),
            },
            FetchError::DownloadTimeout { seconds: 300 },
            FetchError::FileTooLarge { limit_mb: 500 },
        ];
        for err in errors {
            assert!(
                err.to_string().starts_with(err.code()),
                "{err} should start with {}",
                err.code()
            );
        }
    }

    #[test]
    fn test_duration_exceeded_mentions_both_sides() {
        let err = FetchError::DurationExceeded {
            duration: 3600.0,
            limit: 600.0,
        };
        let msg = err.to_string();
        assert!(msg.contains("3600"));
        assert!(msg.contains("600"));
    }
}
