//! Broadcaster: sole owner of the outbound RTMP sink.
//!
//! Two modes feed the sink: a fetched clip with its attribution overlay, or
//! idle filler (static image + silence) so the stream never goes dark. At
//! most one encoder child exists at a time - the worker is the only caller.
//!
//! Cancellation is two-phase: `skip()` wakes the active stream, which asks
//! ffmpeg to quit politely (`q` on its stdin) and falls back to a hard kill
//! after a short grace. A skip with no active clip is dropped, so a stale
//! skip can never cancel the next item.

mod overlay;

pub use overlay::{MAX_OVERLAY_TITLE_CHARS, attribution_line, build_overlay_filter, escape_drawtext};

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

/// Grace period between the polite quit and the hard kill.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Video bitrate used for idle filler.
const IDLE_BITRATE_VIDEO: &str = "1000k";

/// Result of a clip broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The clip played to its natural end.
    Completed,
    /// The clip was interrupted by `skip()`.
    Skipped,
    /// The encoder failed.
    Failed,
}

/// Single-writer sink seam used by the worker.
#[async_trait]
pub trait StreamSink: Send + Sync {
    /// Broadcasts one clip with its attribution overlay.
    async fn stream_file(
        &self,
        path: &Path,
        title: &str,
        submitted_by: &str,
        promo: Option<&str>,
    ) -> StreamOutcome;

    /// Broadcasts idle filler for `duration`. Skip is a no-op here.
    async fn stream_idle(&self, duration: Duration);

    /// Interrupts the clip playing right now, if any.
    fn skip(&self);
}

/// Fixed encoder profile for clip broadcasts.
#[derive(Debug, Clone)]
pub struct EncoderProfile {
    /// Video bitrate (also used as the CBR cap), e.g. `3000k`.
    pub bitrate_video: String,
    /// Audio bitrate, e.g. `128k`.
    pub bitrate_audio: String,
    /// x264 preset.
    pub preset: String,
}

/// Production broadcaster pushing to one RTMP URL via ffmpeg.
#[derive(Debug)]
pub struct RtmpBroadcaster {
    ffmpeg_bin: String,
    rtmp_url: String,
    idle_image: PathBuf,
    profile: EncoderProfile,
    // Skip epochs: subscribing at stream start means only skips issued while
    // that stream is live are observed.
    skip_tx: watch::Sender<u64>,
}

impl RtmpBroadcaster {
    /// Creates a broadcaster for one RTMP destination.
    #[must_use]
    pub fn new(
        ffmpeg_bin: impl Into<String>,
        rtmp_url: impl Into<String>,
        idle_image: impl Into<PathBuf>,
        profile: EncoderProfile,
    ) -> Self {
        let (skip_tx, _) = watch::channel(0);
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            rtmp_url: rtmp_url.into(),
            idle_image: idle_image.into(),
            profile,
            skip_tx,
        }
    }

    fn file_args(&self, path: &Path, vf_filter: &str) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            // Read at native frame rate: the sink is live
            "-re".to_string(),
            "-i".to_string(),
            path.to_string_lossy().into_owned(),
            "-vf".to_string(),
            vf_filter.to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            self.profile.preset.clone(),
            "-b:v".to_string(),
            self.profile.bitrate_video.clone(),
            "-maxrate".to_string(),
            self.profile.bitrate_video.clone(),
            "-bufsize".to_string(),
            "6000k".to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-g".to_string(),
            "50".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            self.profile.bitrate_audio.clone(),
            "-ar".to_string(),
            "44100".to_string(),
            "-f".to_string(),
            "flv".to_string(),
            self.rtmp_url.clone(),
        ]
    }

    fn idle_args(&self, duration: Duration) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-re".to_string(),
            "-loop".to_string(),
            "1".to_string(),
            "-i".to_string(),
            self.idle_image.to_string_lossy().into_owned(),
            "-f".to_string(),
            "lavfi".to_string(),
            "-i".to_string(),
            "anullsrc=r=44100:cl=stereo".to_string(),
            "-t".to_string(),
            duration.as_secs().to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            self.profile.preset.clone(),
            "-b:v".to_string(),
            IDLE_BITRATE_VIDEO.to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            self.profile.bitrate_audio.clone(),
            "-f".to_string(),
            "flv".to_string(),
            self.rtmp_url.clone(),
        ]
    }

    fn spawn_encoder(&self, args: &[String], piped_stdin: bool) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.args(args)
            .stdin(if piped_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd.spawn()
    }

    /// Politely asks ffmpeg to quit, then kills after [`KILL_GRACE`].
    async fn terminate(child: &mut Child, stdin: Option<tokio::process::ChildStdin>) {
        if let Some(mut stdin) = stdin {
            // ffmpeg treats `q` on stdin as a graceful quit request
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.flush().await;
        }
        match timeout(KILL_GRACE, child.wait()).await {
            Ok(_) => debug!("encoder exited within grace period"),
            Err(_) => {
                warn!("encoder ignored quit request, killing");
                let _ = child.kill().await;
            }
        }
    }
}

/// Spawns a task draining an output pipe to a byte buffer.
fn drain_pipe<R>(reader: Option<R>) -> tokio::task::JoinHandle<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut reader) = reader {
            use tokio::io::AsyncReadExt;
            let _ = reader.read_to_end(&mut buf).await;
        }
        buf
    })
}

fn stderr_tail(buf: &[u8]) -> String {
    let text = String::from_utf8_lossy(buf);
    let trimmed = text.trim();
    let chars: Vec<char> = trimmed.chars().collect();
    let start = chars.len().saturating_sub(500);
    chars[start..].iter().collect()
}

#[async_trait]
impl StreamSink for RtmpBroadcaster {
    #[instrument(skip(self, path, title, promo), fields(path = %path.display()))]
    async fn stream_file(
        &self,
        path: &Path,
        title: &str,
        submitted_by: &str,
        promo: Option<&str>,
    ) -> StreamOutcome {
        let vf_filter = build_overlay_filter(title, submitted_by, promo);
        let args = self.file_args(path, &vf_filter);
        debug!(args = %args.join(" "), "starting encoder");

        let mut skip_rx = self.skip_tx.subscribe();
        skip_rx.borrow_and_update();

        let mut child = match self.spawn_encoder(&args, true) {
            Ok(child) => child,
            Err(err) => {
                error!(error = %err, "failed to spawn encoder");
                return StreamOutcome::Failed;
            }
        };

        let stdin = child.stdin.take();
        let stdout_task = drain_pipe(child.stdout.take());
        let stderr_task = drain_pipe(child.stderr.take());

        info!(title, submitted_by, "stream started");

        enum StreamEvent {
            Exited(std::io::Result<std::process::ExitStatus>),
            Skip,
        }

        let event = tokio::select! {
            status = child.wait() => StreamEvent::Exited(status),
            _ = skip_rx.changed() => StreamEvent::Skip,
        };

        let outcome = match event {
            StreamEvent::Exited(Ok(status)) if status.success() => StreamOutcome::Completed,
            StreamEvent::Exited(Ok(status)) => {
                let stderr = stderr_task.await.unwrap_or_default();
                error!(%status, stderr = %stderr_tail(&stderr), "encoder failed");
                return StreamOutcome::Failed;
            }
            StreamEvent::Exited(Err(err)) => {
                error!(error = %err, "failed to wait on encoder");
                return StreamOutcome::Failed;
            }
            StreamEvent::Skip => {
                info!("skip requested, stopping encoder");
                Self::terminate(&mut child, stdin).await;
                StreamOutcome::Skipped
            }
        };

        // Pipes close once the child is gone; reap the drain tasks.
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        if outcome == StreamOutcome::Completed {
            info!(title, "stream completed");
        }
        outcome
    }

    #[instrument(skip(self))]
    async fn stream_idle(&self, duration: Duration) {
        if !self.idle_image.exists() {
            warn!(image = %self.idle_image.display(), "idle image not found, sleeping instead");
            tokio::time::sleep(duration).await;
            return;
        }

        let args = self.idle_args(duration);
        let child = match self.spawn_encoder(&args, false) {
            Ok(child) => child,
            Err(err) => {
                error!(error = %err, "failed to spawn idle encoder, sleeping instead");
                tokio::time::sleep(duration).await;
                return;
            }
        };

        match child.wait_with_output().await {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                warn!(
                    status = %output.status,
                    stderr = %stderr_tail(&output.stderr),
                    "idle encoder exited abnormally"
                );
            }
            Err(err) => {
                error!(error = %err, "idle encoder failed, sleeping instead");
                tokio::time::sleep(duration).await;
            }
        }
    }

    fn skip(&self) {
        self.skip_tx.send_modify(|epoch| *epoch += 1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn test_broadcaster() -> RtmpBroadcaster {
        RtmpBroadcaster::new(
            "ffmpeg",
            "rtmp://live.example.com/app/key",
            "/assets/idle.png",
            EncoderProfile {
                bitrate_video: "3000k".to_string(),
                bitrate_audio: "128k".to_string(),
                preset: "veryfast".to_string(),
            },
        )
    }

    #[test]
    fn test_file_args_carry_fixed_profile() {
        let b = test_broadcaster();
        let args = b.file_args(Path::new("/media/clip.mp4"), "drawtext=text='x'");

        let joined = args.join(" ");
        assert!(joined.contains("-re"));
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.contains("-preset veryfast"));
        assert!(joined.contains("-b:v 3000k"));
        assert!(joined.contains("-maxrate 3000k"));
        assert!(joined.contains("-bufsize 6000k"));
        assert!(joined.contains("-pix_fmt yuv420p"));
        assert!(joined.contains("-g 50"));
        assert!(joined.contains("-b:a 128k"));
        assert!(joined.contains("-ar 44100"));
        assert!(joined.contains("-f flv"));
        assert!(joined.ends_with("rtmp://live.example.com/app/key"));
    }

    #[test]
    fn test_idle_args_loop_image_with_silence() {
        let b = test_broadcaster();
        let args = b.idle_args(Duration::from_secs(30));

        let joined = args.join(" ");
        assert!(joined.contains("-loop 1"));
        assert!(joined.contains("anullsrc=r=44100:cl=stereo"));
        assert!(joined.contains("-t 30"));
        assert!(joined.contains(&format!("-b:v {IDLE_BITRATE_VIDEO}")));
        assert!(joined.ends_with("rtmp://live.example.com/app/key"));
    }

    #[test]
    fn test_skip_bumps_epoch() {
        let b = test_broadcaster();
        let rx = b.skip_tx.subscribe();
        let before = *rx.borrow();
        b.skip();
        assert_eq!(*rx.borrow(), before + 1);
    }

    #[tokio::test]
    async fn test_skip_before_stream_does_not_cancel_it() {
        // A skip issued while nothing is playing must not affect the next
        // stream: the subscription happens at stream start.
        let b = test_broadcaster();
        b.skip();

        let mut rx = b.skip_tx.subscribe();
        rx.borrow_and_update();

        // No further skips: changed() must still be pending.
        let pending = tokio::time::timeout(Duration::from_millis(50), rx.changed()).await;
        assert!(pending.is_err(), "stale skip leaked into a fresh stream");
    }

    #[tokio::test]
    async fn test_stream_idle_missing_image_sleeps() {
        let b = RtmpBroadcaster::new(
            "ffmpeg",
            "rtmp://live.example.com/app/key",
            "/definitely/not/here.png",
            EncoderProfile {
                bitrate_video: "3000k".to_string(),
                bitrate_audio: "128k".to_string(),
                preset: "veryfast".to_string(),
            },
        );
        let started = std::time::Instant::now();
        b.stream_idle(Duration::from_millis(50)).await;
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_stream_file_spawn_failure_is_encoder_failure() {
        let b = RtmpBroadcaster::new(
            "definitely-not-ffmpeg-xyz",
            "rtmp://live.example.com/app/key",
            "/assets/idle.png",
            EncoderProfile {
                bitrate_video: "3000k".to_string(),
                bitrate_audio: "128k".to_string(),
                preset: "veryfast".to_string(),
            },
        );
        let outcome = b
            .stream_file(Path::new("/media/clip.mp4"), "Hello", "alice", None)
            .await;
        assert_eq!(outcome, StreamOutcome::Failed);
    }
}
