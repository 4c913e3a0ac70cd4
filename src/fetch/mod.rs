//! Fetcher: resolves a submission URL to a local media file.
//!
//! Two bounded phases, both driving an external `yt-dlp` child process:
//!
//! 1. **Probe** - metadata only (`-J --no-playlist`), 30 s budget. Enforces
//!    the duration cap before a single media byte is transferred.
//! 2. **Retrieve** - download to `{media_dir}/{id}.{ext}` with the size cap
//!    passed through to `yt-dlp`, 300 s budget.
//!
//! Children are spawned with both pipes captured and fully drained
//! (`wait_with_output`), and are killed when a budget elapses.

mod error;

pub use error::FetchError;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};
use unicode_normalization::UnicodeNormalization;

use crate::queue::QueueItem;

/// Wall-clock budget for the metadata probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Wall-clock budget for the download phase.
const FETCH_TIMEOUT: Duration = Duration::from_secs(300);

/// Display titles are capped at this many characters.
const MAX_TITLE_CHARS: usize = 100;

/// Resolves queue items to local media files.
///
/// The seam exists so the worker pipeline can be exercised without spawning
/// child processes; [`YtDlpFetcher`] is the production implementation.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Fetches the item's URL, mutating `file_path`, `title` and
    /// `duration_seconds` on success.
    async fn fetch(&self, item: &mut QueueItem) -> Result<(), FetchError>;

    /// Removes the item's local media file, if present. Idempotent.
    fn cleanup(&self, item: &QueueItem);
}

/// Media metadata extracted from a probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeInfo {
    /// Media title, already normalised and truncated for display.
    pub title: String,
    /// Duration in seconds, when the source reports one.
    pub duration_seconds: Option<f64>,
    /// Container extension reported by the source.
    pub ext: Option<String>,
}

/// Production fetcher backed by the `yt-dlp` executable.
#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    bin: String,
    media_dir: PathBuf,
    max_duration_seconds: f64,
    max_file_size_mb: u64,
    probe_timeout: Duration,
    fetch_timeout: Duration,
}

impl YtDlpFetcher {
    /// Creates a fetcher writing into `media_dir`.
    #[must_use]
    pub fn new(
        bin: impl Into<String>,
        media_dir: impl Into<PathBuf>,
        max_duration_seconds: f64,
        max_file_size_mb: u64,
    ) -> Self {
        Self {
            bin: bin.into(),
            media_dir: media_dir.into(),
            max_duration_seconds,
            max_file_size_mb,
            probe_timeout: PROBE_TIMEOUT,
            fetch_timeout: FETCH_TIMEOUT,
        }
    }

    /// Overrides the default phase budgets. Used by tests.
    #[must_use]
    pub fn with_timeouts(mut self, probe: Duration, fetch: Duration) -> Self {
        self.probe_timeout = probe;
        self.fetch_timeout = fetch;
        self
    }

    /// Runs the metadata probe for a URL.
    async fn probe(&self, url: &str) -> Result<ProbeInfo, FetchError> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-J").arg("--no-playlist").arg(url);

        let output = run_bounded(cmd, self.probe_timeout)
            .await
            .map_err(|e| match e {
                BoundedError::Timeout => FetchError::ProbeFailed {
                    detail: format!("probe timed out after {}s", self.probe_timeout.as_secs()),
                },
                BoundedError::Io(err) => FetchError::ProbeFailed {
                    detail: format!("failed to spawn {}: {err}", self.bin),
                },
            })?;

        if !output.status.success() {
            return Err(FetchError::ProbeFailed {
                detail: format!(
                    "yt-dlp exited with {}: {}",
                    output.status,
                    stderr_tail(&output.stderr)
                ),
            });
        }

        parse_probe(&output.stdout)
    }

    /// Downloads the item's URL into the media directory.
    async fn retrieve(&self, item: &QueueItem) -> Result<PathBuf, FetchError> {
        let template = self.media_dir.join(format!("{}.%(ext)s", item.id));

        let mut cmd = Command::new(&self.bin);
        cmd.arg("-f")
            .arg("bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best")
            .arg("--merge-output-format")
            .arg("mp4")
            .arg("-o")
            .arg(&template)
            .arg("--no-playlist")
            .arg("--max-filesize")
            .arg(format!("{}m", self.max_file_size_mb))
            .arg(&item.url);

        let output = run_bounded(cmd, self.fetch_timeout)
            .await
            .map_err(|e| match e {
                BoundedError::Timeout => FetchError::DownloadTimeout {
                    seconds: self.fetch_timeout.as_secs(),
                },
                BoundedError::Io(err) => FetchError::DownloadFailed {
                    detail: format!("failed to spawn {}: {err}", self.bin),
                },
            })?;

        let stderr = stderr_tail(&output.stderr);
        if !output.status.success() {
            return Err(FetchError::DownloadFailed {
                detail: format!("yt-dlp exited with {}: {stderr}", output.status),
            });
        }

        let Some(path) = find_downloaded(&self.media_dir, &item.id) else {
            // yt-dlp reports the size cap on stdout/stderr and still exits 0.
            let combined = format!("{stderr} {}", String::from_utf8_lossy(&output.stdout));
            if combined.to_ascii_lowercase().contains("max-filesize") {
                return Err(FetchError::FileTooLarge {
                    limit_mb: self.max_file_size_mb,
                });
            }
            return Err(FetchError::DownloadFailed {
                detail: "downloaded file not found".to_string(),
            });
        };

        let cap_bytes = self.max_file_size_mb.saturating_mul(1024 * 1024);
        if let Ok(meta) = tokio::fs::metadata(&path).await
            && meta.len() > cap_bytes
        {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(FetchError::FileTooLarge {
                limit_mb: self.max_file_size_mb,
            });
        }

        Ok(path)
    }
}

#[async_trait]
impl MediaFetcher for YtDlpFetcher {
    #[instrument(skip(self, item), fields(id = %item.id, url = %item.url))]
    async fn fetch(&self, item: &mut QueueItem) -> Result<(), FetchError> {
        let info = self.probe(&item.url).await?;

        if let Some(duration) = info.duration_seconds
            && duration > self.max_duration_seconds
        {
            return Err(FetchError::DurationExceeded {
                duration,
                limit: self.max_duration_seconds,
            });
        }

        item.title = info.title;
        item.duration_seconds = info.duration_seconds;

        info!(title = %item.title, "downloading");
        let path = self.retrieve(item).await?;
        info!(path = %path.display(), "downloaded");
        item.file_path = Some(path.to_string_lossy().into_owned());

        Ok(())
    }

    fn cleanup(&self, item: &QueueItem) {
        let Some(path) = item.local_path() else {
            return;
        };
        match std::fs::remove_file(&path) {
            Ok(()) => info!(path = %path.display(), "cleaned up media file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "failed to remove media file"),
        }
    }
}

/// Failure modes of a bounded child-process run.
enum BoundedError {
    Timeout,
    Io(std::io::Error),
}

/// Spawns the command with captured pipes and waits for completion within
/// `budget`. Both output streams are drained to completion; on timeout the
/// child is killed via `kill_on_drop`.
async fn run_bounded(
    mut cmd: Command,
    budget: Duration,
) -> Result<std::process::Output, BoundedError> {
    let child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(BoundedError::Io)?;

    match timeout(budget, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(err)) => Err(BoundedError::Io(err)),
        Err(_) => Err(BoundedError::Timeout),
    }
}

/// Parses `yt-dlp -J` output into [`ProbeInfo`].
fn parse_probe(stdout: &[u8]) -> Result<ProbeInfo, FetchError> {
    let value: serde_json::Value =
        serde_json::from_slice(stdout).map_err(|err| FetchError::ProbeFailed {
            detail: format!("unparseable probe output: {err}"),
        })?;

    let title = normalize_title(value.get("title").and_then(|t| t.as_str()).unwrap_or("Unknown"));
    let duration_seconds = value.get("duration").and_then(serde_json::Value::as_f64);
    let ext = value
        .get("ext")
        .and_then(|e| e.as_str())
        .map(ToString::to_string);

    Ok(ProbeInfo {
        title,
        duration_seconds,
        ext,
    })
}

/// NFC-normalises a title, strips control characters and caps the length.
#[must_use]
pub fn normalize_title(raw: &str) -> String {
    let normalized: String = raw.nfc().collect::<String>();
    let cleaned: String = normalized
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_TITLE_CHARS)
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        "Unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Locates the downloaded file for an item id, whatever extension yt-dlp
/// settled on.
fn find_downloaded(media_dir: &Path, id: &str) -> Option<PathBuf> {
    let prefix = format!("{id}.");
    let entries = std::fs::read_dir(media_dir).ok()?;
    let mut matches: Vec<PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix) && !n.ends_with(".part"))
        })
        .collect();
    matches.sort();
    let found = matches.into_iter().next();
    debug!(id, found = ?found, "searched media dir for download output");
    found
}

/// Trims stderr to a loggable tail.
fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    if trimmed.len() > 500 {
        // char_indices keeps the cut on a UTF-8 boundary
        let start = trimmed
            .char_indices()
            .rev()
            .take(500)
            .last()
            .map_or(0, |(i, _)| i);
        trimmed[start..].to_string()
    } else {
        trimmed.to_string()
    }
}
