//! Content moderation: the admission gate in front of the broadcaster.
//!
//! The gate scores media against a frozen image-text model and applies an
//! admission policy ([`policy`]). The model is a process-wide singleton,
//! loaded once on first use (or eagerly via [`Moderator::ensure_loaded`]).
//!
//! Degradation ladder: a model load or per-item classification failure falls
//! back to an external checker script; if that also fails the item is
//! rejected with `moderation_error`. The whole check is bounded by a
//! wall-clock budget; exceeding it rejects with `moderation_timeout`. The
//! gate fails closed: no path through this module approves content by
//! accident.

mod encoder;
mod frames;
mod policy;

pub use encoder::{ClipEncoder, EncoderError, PROMPT_EMBEDDINGS_FILE, VISUAL_MODEL_FILE};
pub use frames::{FramesError, MAX_FRAMES, SAMPLE_FPS, is_video, sample_frames};
pub use policy::{
    DEFAULT_THRESHOLD, LearnedPolicy, PROMPT_COUNT, PROMPTS, ScoreVector, Verdict, rules_decision,
};

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::{error, info, instrument, warn};

/// Wall-clock budget for one moderation check.
pub const MODERATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Frames decoded and scored per inference batch.
const BATCH_SIZE: usize = 32;

/// Admission decision surfaced to the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    /// Safe for broadcast.
    Approved,
    /// Not safe; the reason is recorded on the queue item.
    Rejected {
        /// Stable-prefixed reason (`nsfw_detected`, `moderation_error`,
        /// `moderation_timeout`, or the fallback checker's own text).
        reason: String,
    },
}

impl GateVerdict {
    /// Returns true for [`GateVerdict::Approved`].
    #[must_use]
    pub fn approved(&self) -> bool {
        matches!(self, Self::Approved)
    }

    /// Returns the rejection reason, if rejected.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Approved => None,
            Self::Rejected { reason } => Some(reason),
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

/// Admission gate seam used by the worker.
#[async_trait]
pub trait ContentGate: Send + Sync {
    /// Checks one media file. Never errors; every failure mode maps to a
    /// rejection.
    async fn check(&self, path: &Path) -> GateVerdict;
}

/// Loaded model state, cached for the process lifetime.
#[derive(Debug, Clone, Default)]
struct ModelState {
    encoder: Option<Arc<ClipEncoder>>,
    learned: Option<Arc<LearnedPolicy>>,
}

/// Production admission gate.
#[derive(Debug)]
pub struct Moderator {
    model_dir: Option<PathBuf>,
    fallback_script: Option<PathBuf>,
    ffmpeg_bin: String,
    threshold: f32,
    budget: Duration,
    state: OnceCell<ModelState>,
}

impl Moderator {
    /// Creates a moderator. `model_dir` holds the classifier artefacts;
    /// `fallback_script` is the external checker used when the classifier is
    /// unavailable.
    #[must_use]
    pub fn new(
        model_dir: Option<PathBuf>,
        fallback_script: Option<PathBuf>,
        ffmpeg_bin: impl Into<String>,
    ) -> Self {
        Self {
            model_dir,
            fallback_script,
            ffmpeg_bin: ffmpeg_bin.into(),
            threshold: DEFAULT_THRESHOLD,
            budget: MODERATION_TIMEOUT,
            state: OnceCell::new(),
        }
    }

    /// Overrides the rules-policy threshold. Used by tests.
    #[must_use]
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Overrides the per-check budget. Used by tests.
    #[must_use]
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    /// Returns true when a fallback checker script is configured.
    #[must_use]
    pub fn has_fallback(&self) -> bool {
        self.fallback_script.is_some()
    }

    /// Loads the model now and reports whether the classifier is available.
    ///
    /// Blocks until the load attempt completes; intended for startup (to
    /// avoid first-request latency) and tests.
    pub async fn ensure_loaded(&self) -> bool {
        self.model_state().await.encoder.is_some()
    }

    async fn model_state(&self) -> ModelState {
        self.state
            .get_or_init(|| async {
                let Some(dir) = self.model_dir.clone() else {
                    warn!("no model directory configured, classifier disabled");
                    return ModelState::default();
                };

                let learned = LearnedPolicy::load(&dir).map(Arc::new);
                if learned.is_some() {
                    info!("learned admission policy active");
                }

                let load_dir = dir.clone();
                match tokio::task::spawn_blocking(move || ClipEncoder::load(&load_dir)).await {
                    Ok(Ok(encoder)) => {
                        info!(model_dir = %dir.display(), "classifier model loaded");
                        ModelState {
                            encoder: Some(Arc::new(encoder)),
                            learned,
                        }
                    }
                    Ok(Err(err)) => {
                        error!(error = %err, "classifier model failed to load");
                        ModelState {
                            encoder: None,
                            learned,
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "classifier load task panicked");
                        ModelState {
                            encoder: None,
                            learned,
                        }
                    }
                }
            })
            .await
            .clone()
    }

    async fn classify(&self, path: &Path) -> GateVerdict {
        let state = self.model_state().await;

        if let Some(enc) = state.encoder {
            match self.score(path, enc).await {
                Ok(scores) => {
                    let verdict = match state.learned.as_deref() {
                        Some(learned) => learned.decide(&scores),
                        None => rules_decision(&scores, self.threshold),
                    };
                    return match verdict {
                        Verdict::Approved => GateVerdict::Approved,
                        Verdict::Rejected { reason } => {
                            GateVerdict::rejected(format!("nsfw_detected: {reason}"))
                        }
                    };
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "classifier error, trying fallback checker");
                }
            }
        }

        self.fallback_check(path).await
    }

    async fn score(&self, path: &Path, encoder: Arc<ClipEncoder>) -> Result<ScoreVector, String> {
        if is_video(path) {
            let sampled = sample_frames(&self.ffmpeg_bin, path)
                .await
                .map_err(|e| e.to_string())?;
            tokio::task::spawn_blocking(move || {
                encoder
                    .score_frames(&sampled.paths, BATCH_SIZE)
                    .map_err(|e| e.to_string())
            })
            .await
            .map_err(|e| e.to_string())?
        } else {
            let path = path.to_path_buf();
            tokio::task::spawn_blocking(move || {
                encoder.score_image_path(&path).map_err(|e| e.to_string())
            })
            .await
            .map_err(|e| e.to_string())?
        }
    }

    async fn fallback_check(&self, path: &Path) -> GateVerdict {
        let Some(script) = self.fallback_script.as_ref() else {
            return GateVerdict::rejected("moderation_error: no fallback checker configured");
        };

        let child = Command::new(script)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(err) => {
                return GateVerdict::rejected(format!(
                    "moderation_error: fallback checker failed to start: {err}"
                ));
            }
        };

        match child.wait_with_output().await {
            Ok(output) if output.status.success() => {
                info!(path = %path.display(), "content approved by fallback checker");
                GateVerdict::Approved
            }
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let reason = [stdout.trim(), stderr.trim()]
                    .into_iter()
                    .find(|s| !s.is_empty())
                    .unwrap_or("content rejected")
                    .to_string();
                warn!(path = %path.display(), reason = %reason, "content rejected by fallback checker");
                GateVerdict::Rejected { reason }
            }
            Err(err) => {
                GateVerdict::rejected(format!("moderation_error: fallback checker failed: {err}"))
            }
        }
    }
}

#[async_trait]
impl ContentGate for Moderator {
    #[instrument(skip(self, path), fields(path = %path.display()))]
    async fn check(&self, path: &Path) -> GateVerdict {
        match timeout(self.budget, self.classify(path)).await {
            Ok(verdict) => {
                match &verdict {
                    GateVerdict::Approved => info!("content approved"),
                    GateVerdict::Rejected { reason } => warn!(reason = %reason, "content rejected"),
                }
                verdict
            }
            Err(_) => GateVerdict::rejected(format!(
                "moderation_timeout: check exceeded {}s",
                self.budget.as_secs()
            )),
        }
    }
}
