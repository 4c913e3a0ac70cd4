//! Frozen visual encoder and score computation.
//!
//! The model directory carries two artefacts of the frozen image-text model:
//!
//! - `visual.onnx` - the visual tower, taking a `1x3x224x224` preprocessed
//!   image and returning an embedding row.
//! - `prompt_embeddings.json` - the text tower's output for the fixed prompt
//!   vocabulary, exported offline so no tokenizer runs at broadcast time.
//!   The loader validates the prompts against [`PROMPTS`].
//!
//! Scores are `softmax(logit_scale * cosine_similarity)` per prompt.

use std::path::{Path, PathBuf};

use image::DynamicImage;
use serde::Deserialize;
use thiserror::Error;
use tract_onnx::prelude::*;

use super::policy::{PROMPT_COUNT, PROMPTS, ScoreVector};

/// Side length of the encoder's square input.
const INPUT_SIZE: u32 = 224;

/// Temperature applied to cosine similarities before the softmax.
const LOGIT_SCALE: f32 = 100.0;

/// Per-channel normalisation constants of the frozen preprocessing.
const MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// Visual tower artefact file name inside the model directory.
pub const VISUAL_MODEL_FILE: &str = "visual.onnx";

/// Prompt embedding artefact file name inside the model directory.
pub const PROMPT_EMBEDDINGS_FILE: &str = "prompt_embeddings.json";

type VisualPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Errors from loading or running the encoder.
#[derive(Debug, Error)]
pub enum EncoderError {
    /// The ONNX model could not be loaded or optimised.
    #[error("model load failed: {0}")]
    Load(String),

    /// The prompt embedding artefact is missing or malformed.
    #[error("invalid prompt embeddings: {0}")]
    Artifact(String),

    /// A frame or image could not be decoded.
    #[error("image decode failed for {path}: {source}")]
    Decode {
        /// File that failed to decode.
        path: PathBuf,
        /// Underlying decoder error.
        #[source]
        source: image::ImageError,
    },

    /// Inference failed at runtime.
    #[error("inference failed: {0}")]
    Inference(String),
}

#[derive(Debug, Deserialize)]
struct PromptEmbeddingsFile {
    prompts: Vec<String>,
    embeddings: Vec<Vec<f32>>,
}

/// Frozen visual encoder plus precomputed, L2-normalised prompt embeddings.
pub struct ClipEncoder {
    plan: VisualPlan,
    prompt_embeddings: Vec<Vec<f32>>,
}

impl std::fmt::Debug for ClipEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipEncoder")
            .field("prompts", &self.prompt_embeddings.len())
            .finish()
    }
}

impl ClipEncoder {
    /// Loads both artefacts from `model_dir` and compiles the inference plan.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::Load`] when the ONNX model cannot be compiled
    /// and [`EncoderError::Artifact`] when the prompt embeddings do not match
    /// the fixed vocabulary.
    pub fn load(model_dir: &Path) -> Result<Self, EncoderError> {
        let onnx_path = model_dir.join(VISUAL_MODEL_FILE);
        let plan = tract_onnx::onnx()
            .model_for_path(&onnx_path)
            .map_err(|e| EncoderError::Load(format!("{}: {e}", onnx_path.display())))?
            .with_input_fact(
                0,
                f32::fact([1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize]).into(),
            )
            .map_err(|e| EncoderError::Load(e.to_string()))?
            .into_optimized()
            .map_err(|e| EncoderError::Load(e.to_string()))?
            .into_runnable()
            .map_err(|e| EncoderError::Load(e.to_string()))?;

        let prompt_embeddings = load_prompt_embeddings(&model_dir.join(PROMPT_EMBEDDINGS_FILE))?;

        Ok(Self {
            plan,
            prompt_embeddings,
        })
    }

    /// Decodes and scores a single image file.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::Decode`] or [`EncoderError::Inference`].
    pub fn score_image_path(&self, path: &Path) -> Result<ScoreVector, EncoderError> {
        let img = image::open(path).map_err(|source| EncoderError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
        self.score_image(&img)
    }

    /// Scores a decoded image.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::Inference`] if the plan fails.
    pub fn score_image(&self, img: &DynamicImage) -> Result<ScoreVector, EncoderError> {
        let embedding = self.embed(img)?;
        Ok(self.similarities(&embedding))
    }

    /// Scores a set of sampled frame files in batches, reducing across
    /// frames by element-wise max.
    ///
    /// Frames that fail to decode are skipped with the failure propagated
    /// only when no frame scored at all.
    ///
    /// # Errors
    ///
    /// Returns [`EncoderError::Inference`] when every frame fails.
    pub fn score_frames(
        &self,
        frames: &[PathBuf],
        batch_size: usize,
    ) -> Result<ScoreVector, EncoderError> {
        let mut reduced: Option<ScoreVector> = None;
        let mut last_error: Option<EncoderError> = None;

        for batch in frames.chunks(batch_size.max(1)) {
            for frame in batch {
                match self.score_image_path(frame) {
                    Ok(scores) => match reduced.as_mut() {
                        Some(acc) => acc.max_reduce(&scores),
                        None => reduced = Some(scores),
                    },
                    Err(err) => last_error = Some(err),
                }
            }
        }

        reduced.ok_or_else(|| match last_error {
            Some(err) => err,
            None => EncoderError::Inference("no frames to score".to_string()),
        })
    }

    /// Runs the visual tower and returns the L2-normalised embedding.
    fn embed(&self, img: &DynamicImage) -> Result<Vec<f32>, EncoderError> {
        let input: Tensor = preprocess(img).into();
        let result = self
            .plan
            .run(tvec!(input.into()))
            .map_err(|e| EncoderError::Inference(e.to_string()))?;
        let view = result[0]
            .to_array_view::<f32>()
            .map_err(|e| EncoderError::Inference(e.to_string()))?;

        let mut embedding: Vec<f32> = view.iter().copied().collect();
        normalize(&mut embedding);
        Ok(embedding)
    }

    /// Softmax-normalised similarity vector against the prompt embeddings.
    fn similarities(&self, embedding: &[f32]) -> ScoreVector {
        let mut logits = [0.0_f32; PROMPT_COUNT];
        for (logit, prompt) in logits.iter_mut().zip(self.prompt_embeddings.iter()) {
            *logit = LOGIT_SCALE * dot(embedding, prompt);
        }
        softmax(&mut logits);
        ScoreVector(logits)
    }
}

/// Resize (shortest side) + center crop + per-channel normalisation into a
/// `1x3xHxW` tensor.
fn preprocess(img: &DynamicImage) -> tract_ndarray::Array4<f32> {
    let resized = img
        .resize_to_fill(INPUT_SIZE, INPUT_SIZE, image::imageops::FilterType::CatmullRom)
        .to_rgb8();

    tract_ndarray::Array4::from_shape_fn(
        (1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize),
        |(_, c, y, x)| {
            let pixel = resized.get_pixel(x as u32, y as u32);
            (f32::from(pixel[c]) / 255.0 - MEAN[c]) / STD[c]
        },
    )
}

fn load_prompt_embeddings(path: &Path) -> Result<Vec<Vec<f32>>, EncoderError> {
    let bytes = std::fs::read(path)
        .map_err(|e| EncoderError::Artifact(format!("{}: {e}", path.display())))?;
    let file: PromptEmbeddingsFile = serde_json::from_slice(&bytes)
        .map_err(|e| EncoderError::Artifact(format!("{}: {e}", path.display())))?;

    if file.prompts.len() != PROMPT_COUNT || file.embeddings.len() != PROMPT_COUNT {
        return Err(EncoderError::Artifact(format!(
            "expected {PROMPT_COUNT} prompts, found {} with {} embedding rows",
            file.prompts.len(),
            file.embeddings.len()
        )));
    }
    for (found, expected) in file.prompts.iter().zip(PROMPTS.iter()) {
        if found != expected {
            return Err(EncoderError::Artifact(format!(
                "vocabulary mismatch: artefact has {found:?}, expected {expected:?}"
            )));
        }
    }

    let dim = file.embeddings[0].len();
    if dim == 0 {
        return Err(EncoderError::Artifact("empty embedding rows".to_string()));
    }
    let mut rows = file.embeddings;
    for row in &mut rows {
        if row.len() != dim {
            return Err(EncoderError::Artifact(
                "embedding rows have inconsistent dimensions".to_string(),
            ));
        }
        normalize(row);
    }

    Ok(rows)
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

fn softmax(v: &mut [f32]) {
    let max = v.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for x in v.iter_mut() {
        *x = (*x - max).exp();
        sum += *x;
    }
    if sum > 0.0 {
        for x in v.iter_mut() {
            *x /= sum;
        }
    }
}
