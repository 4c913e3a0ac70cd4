//! Frame sampling for video moderation.
//!
//! Videos are sampled with ffmpeg at a fixed frame rate into a scratch
//! directory of JPEG frames, capped at a hard per-clip maximum. The scratch
//! directory lives as long as the returned handle.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tempfile::TempDir;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Frames sampled per second of video.
pub const SAMPLE_FPS: u32 = 1;

/// Hard cap on frames scored per clip.
pub const MAX_FRAMES: u32 = 200;

/// Errors from frame sampling.
#[derive(Debug, Error)]
pub enum FramesError {
    /// ffmpeg could not be spawned or its pipes failed.
    #[error("failed to run ffmpeg: {0}")]
    Io(#[from] std::io::Error),

    /// ffmpeg exited non-zero.
    #[error("ffmpeg exited with {status}: {stderr}")]
    Command {
        /// Exit status text.
        status: String,
        /// Trailing stderr output.
        stderr: String,
    },

    /// The clip yielded no frames at all.
    #[error("no frames extracted")]
    Empty,
}

/// Sampled frames plus the scratch directory keeping them alive.
#[derive(Debug)]
pub struct SampledFrames {
    _dir: TempDir,
    /// Frame files in presentation order.
    pub paths: Vec<PathBuf>,
}

/// Samples up to [`MAX_FRAMES`] frames from `media` at [`SAMPLE_FPS`].
///
/// The caller is expected to bound the overall moderation wall-clock; the
/// child is killed if this future is dropped.
///
/// # Errors
///
/// Returns [`FramesError`] when ffmpeg fails or produces nothing.
pub async fn sample_frames(ffmpeg_bin: &str, media: &Path) -> Result<SampledFrames, FramesError> {
    let dir = TempDir::new()?;
    let pattern = dir.path().join("frame_%05d.jpg");

    let child = Command::new(ffmpeg_bin)
        .arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-i")
        .arg(media)
        .arg("-vf")
        .arg(format!("fps={SAMPLE_FPS}"))
        .arg("-frames:v")
        .arg(MAX_FRAMES.to_string())
        .arg("-q:v")
        .arg("2")
        .arg(&pattern)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(FramesError::Command {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr)
                .trim()
                .chars()
                .take(500)
                .collect(),
        });
    }

    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir.path())?
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "jpg"))
        .collect();
    paths.sort();

    if paths.is_empty() {
        return Err(FramesError::Empty);
    }

    debug!(media = %media.display(), frames = paths.len(), "sampled frames");
    Ok(SampledFrames { _dir: dir, paths })
}

/// Returns true when the file extension marks a video container.
#[must_use]
pub fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            matches!(
                ext.to_ascii_lowercase().as_str(),
                "mp4" | "avi" | "mov" | "mkv" | "webm"
            )
        })
}
