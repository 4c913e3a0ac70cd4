//! Scoring vocabulary and admission policies.
//!
//! The prompt vocabulary is a design-level constant: one safe anchor, five
//! explicit anchors, and five ambiguous-but-clothed anchors that dampen
//! false positives. Scores are softmax-normalised similarities between a
//! frame embedding and the prompt embeddings; for videos the per-frame
//! vectors are reduced by element-wise max before a decision is taken.

use std::path::Path;

use serde::Deserialize;
use tracing::warn;

/// Fixed prompt vocabulary, in score-vector order.
pub const PROMPTS: [&str; 11] = [
    "safe for work image",
    "female nipples",
    "male nipples",
    "penis",
    "vulva",
    "anus",
    "female breast",
    "male chest",
    "bikini",
    "lingerie",
    "cleavage",
];

/// Number of prompts in the vocabulary.
pub const PROMPT_COUNT: usize = PROMPTS.len();

/// Default rejection threshold for the rules policy.
pub const DEFAULT_THRESHOLD: f32 = 0.20;

const IDX_SAFE: usize = 0;
const IDX_NIPPLES_F: usize = 1;
const IDX_NIPPLES_M: usize = 2;
const IDX_PENIS: usize = 3;
const IDX_VULVA: usize = 4;
const IDX_ANUS: usize = 5;
const IDX_BREAST: usize = 6;
const IDX_CHEST: usize = 7;
const IDX_BIKINI: usize = 8;
const IDX_LINGERIE: usize = 9;
const IDX_CLEAVAGE: usize = 10;

/// Softmax-normalised per-prompt similarities for one clip or image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreVector(pub [f32; PROMPT_COUNT]);

impl ScoreVector {
    /// Score of the safe anchor.
    #[must_use]
    pub fn safe(&self) -> f32 {
        self.0[IDX_SAFE]
    }

    /// Aggregate nipple score (max over female/male).
    #[must_use]
    pub fn nipples(&self) -> f32 {
        self.0[IDX_NIPPLES_F].max(self.0[IDX_NIPPLES_M])
    }

    /// Aggregate genital score (max over penis/vulva).
    #[must_use]
    pub fn genitals(&self) -> f32 {
        self.0[IDX_PENIS].max(self.0[IDX_VULVA])
    }

    /// Anus score.
    #[must_use]
    pub fn anus(&self) -> f32 {
        self.0[IDX_ANUS]
    }

    /// Aggregate explicit score: max over all explicit anchors.
    #[must_use]
    pub fn explicit(&self) -> f32 {
        self.nipples().max(self.genitals()).max(self.anus())
    }

    /// Breast dampener score.
    #[must_use]
    pub fn breast(&self) -> f32 {
        self.0[IDX_BREAST]
    }

    /// Chest dampener score.
    #[must_use]
    pub fn chest(&self) -> f32 {
        self.0[IDX_CHEST]
    }

    /// Aggregate clothing score (max over bikini/lingerie/cleavage).
    #[must_use]
    pub fn clothing(&self) -> f32 {
        self.0[IDX_BIKINI]
            .max(self.0[IDX_LINGERIE])
            .max(self.0[IDX_CLEAVAGE])
    }

    /// Name of the explicit category holding the aggregate maximum.
    #[must_use]
    pub fn explicit_category(&self) -> &'static str {
        let explicit = self.explicit();
        if self.genitals() >= explicit {
            "genitals"
        } else if self.nipples() >= explicit {
            "nipples"
        } else {
            "anus"
        }
    }

    /// Element-wise max with another vector. Used to reduce across frames.
    pub fn max_reduce(&mut self, other: &ScoreVector) {
        for (lhs, rhs) in self.0.iter_mut().zip(other.0.iter()) {
            *lhs = lhs.max(*rhs);
        }
    }
}

/// Outcome of an admission policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Safe for broadcast.
    Approved,
    /// Rejected; the reason carries the triggering category and margins.
    Rejected {
        /// Operator-facing explanation.
        reason: String,
    },
}

impl Verdict {
    /// Returns true for [`Verdict::Approved`].
    #[must_use]
    pub fn approved(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

/// Rules-based admission decision.
///
/// Rejects iff the aggregate explicit score reaches `threshold` AND exceeds
/// the safe-anchor score. A single threshold applies to all explicit
/// categories.
#[must_use]
pub fn rules_decision(scores: &ScoreVector, threshold: f32) -> Verdict {
    let safe = scores.safe();
    let explicit = scores.explicit();

    if explicit >= threshold && explicit > safe {
        Verdict::Rejected {
            reason: format!(
                "explicit {explicit:.3} > safe {safe:.3} ({})",
                scores.explicit_category()
            ),
        }
    } else {
        Verdict::Approved
    }
}

/// Learned admission policy: a small offline-trained logistic model over
/// features derived from the score vector. When its artefacts are present it
/// supersedes the rules policy; the admission-gate contract is unchanged.
#[derive(Debug, Clone)]
pub struct LearnedPolicy {
    weights: [f32; 5],
    bias: f32,
    threshold: f32,
}

#[derive(Debug, Deserialize)]
struct LearnedModelFile {
    weights: Vec<f32>,
    bias: f32,
}

#[derive(Debug, Deserialize)]
struct LearnedThresholdsFile {
    learned_threshold: f32,
}

impl LearnedPolicy {
    /// Model artefact file name inside the model directory.
    pub const MODEL_FILE: &'static str = "learned_policy.json";
    /// Threshold artefact file name inside the model directory.
    pub const THRESHOLDS_FILE: &'static str = "learned_policy_thresholds.json";

    /// Loads the learned policy when both artefacts are present and valid.
    ///
    /// Absent or malformed artefacts yield `None` (with a warning), leaving
    /// the rules policy in charge.
    #[must_use]
    pub fn load(model_dir: &Path) -> Option<Self> {
        let model_path = model_dir.join(Self::MODEL_FILE);
        let thresholds_path = model_dir.join(Self::THRESHOLDS_FILE);
        if !model_path.exists() || !thresholds_path.exists() {
            return None;
        }

        let model: LearnedModelFile = match read_json(&model_path) {
            Ok(model) => model,
            Err(err) => {
                warn!(path = %model_path.display(), error = %err, "ignoring learned policy artefact");
                return None;
            }
        };
        let thresholds: LearnedThresholdsFile = match read_json(&thresholds_path) {
            Ok(thresholds) => thresholds,
            Err(err) => {
                warn!(path = %thresholds_path.display(), error = %err, "ignoring learned policy thresholds");
                return None;
            }
        };

        let weights: [f32; 5] = match model.weights.as_slice().try_into() {
            Ok(weights) => weights,
            Err(_) => {
                warn!(
                    path = %model_path.display(),
                    count = model.weights.len(),
                    "learned policy must carry exactly 5 feature weights"
                );
                return None;
            }
        };

        Some(Self {
            weights,
            bias: model.bias,
            threshold: thresholds.learned_threshold,
        })
    }

    /// Creates a policy from in-memory parameters. Used by tests.
    #[must_use]
    pub fn from_parts(weights: [f32; 5], bias: f32, threshold: f32) -> Self {
        Self {
            weights,
            bias,
            threshold,
        }
    }

    /// Feature vector: (safe, explicit, breast−safe, chest−safe,
    /// explicit−clothing).
    #[must_use]
    pub fn features(scores: &ScoreVector) -> [f32; 5] {
        [
            scores.safe(),
            scores.explicit(),
            scores.breast() - scores.safe(),
            scores.chest() - scores.safe(),
            scores.explicit() - scores.clothing(),
        ]
    }

    /// Learned admission decision.
    #[must_use]
    pub fn decide(&self, scores: &ScoreVector) -> Verdict {
        let features = Self::features(scores);
        let logit: f32 = self
            .weights
            .iter()
            .zip(features.iter())
            .map(|(w, x)| w * x)
            .sum::<f32>()
            + self.bias;
        let prob = 1.0 / (1.0 + (-logit).exp());

        if prob >= self.threshold {
            Verdict::Rejected {
                reason: format!("learned prob {prob:.3} >= threshold {:.3}", self.threshold),
            }
        } else {
            Verdict::Approved
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, String> {
    let bytes = std::fs::read(path).map_err(|e| e.to_string())?;
    serde_json::from_slice(&bytes).map_err(|e| e.to_string())
}
