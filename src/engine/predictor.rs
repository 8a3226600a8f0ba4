//! Face Attribute Predictors
//!
//! Batched age, gender, race and emotion inference. One predictor wraps one
//! model; the pipeline maps attributes to predictors through the registry.

use std::sync::Arc;

use image::DynamicImage;
use ndarray::Array4;
use openvino::{Tensor, ElementType, Shape};
use anyhow::{Result, Context};
use tracing::debug;

use super::detector::{copy_into_tensor, read_tensor_f32};
use super::pool::{ModelPool, ModelType};
use super::preprocess::{faces_to_gray_batch, faces_to_rgb_batch, EMOTION_INPUT_SIZE, FACE_INPUT_SIZE};
use crate::pipeline::Attribute;
use crate::utils::math::softmax;

/// Number of age bins of the apparent-age model (0..=100 years)
pub const AGE_BINS: usize = 101;

/// Output of a predictor for one face
#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    /// Scalar value, e.g. apparent age in years
    Scalar(f32),
    /// Probabilities over the attribute's label set, in label order
    Distribution(Vec<f32>),
}

/// Batched attribute predictor.
///
/// Output order must match input order and the output length must equal the
/// input length; the pipeline rejects predictors that break this.
pub trait AttributePredictor: Send + Sync {
    fn predict(&self, faces: &[&DynamicImage]) -> Result<Vec<Prediction>>;
}

/// Input layout expected by a model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputLayout {
    /// NCHW RGB in [0, 1]
    Rgb((u32, u32)),
    /// N1HW grayscale in [0, 1]
    Gray((u32, u32)),
}

/// OpenVINO-backed predictor for a single attribute
pub struct OpenVinoPredictor {
    pool: Arc<ModelPool>,
    attribute: Attribute,
    model_type: ModelType,
    layout: InputLayout,
    batch_max_size: usize,
}

impl OpenVinoPredictor {
    pub fn new(pool: Arc<ModelPool>, attribute: Attribute, batch_max_size: usize) -> Self {
        let (model_type, layout) = match attribute {
            Attribute::Age => (ModelType::Age, InputLayout::Rgb(FACE_INPUT_SIZE)),
            Attribute::Gender => (ModelType::Gender, InputLayout::Rgb(FACE_INPUT_SIZE)),
            Attribute::Race => (ModelType::Race, InputLayout::Rgb(FACE_INPUT_SIZE)),
            Attribute::Emotion => (ModelType::Emotion, InputLayout::Gray(EMOTION_INPUT_SIZE)),
        };

        Self {
            pool,
            attribute,
            model_type,
            layout,
            batch_max_size: batch_max_size.max(1),
        }
    }

    /// Run one model call over a chunk of faces, returning raw rows
    fn infer_chunk(&self, faces: &[&DynamicImage]) -> Result<Vec<Vec<f32>>> {
        let input: Array4<f32> = match self.layout {
            InputLayout::Rgb(size) => faces_to_rgb_batch(faces, size),
            InputLayout::Gray(size) => faces_to_gray_batch(faces, size),
        };

        let dims: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();
        let model = self.pool.get_model(self.model_type)?;
        let mut request = model.create_infer_request()?;

        let mut tensor = Tensor::new(ElementType::F32, &Shape::new(&dims)?)?;
        copy_into_tensor(&mut tensor, input.as_slice().context("batch tensor not contiguous")?)?;

        request.set_input_tensor(&tensor)?;
        request
            .infer()
            .with_context(|| format!("{} inference failed", self.attribute))?;

        let output = read_tensor_f32(&request.get_output_tensor()?)?;
        split_rows(&output, faces.len())
    }

    fn to_prediction(&self, row: &[f32]) -> Result<Prediction> {
        let probs = to_probabilities(row);
        match self.attribute.labels() {
            None => {
                if probs.len() != AGE_BINS {
                    anyhow::bail!("age model returned {} bins, expected {}", probs.len(), AGE_BINS);
                }
                Ok(Prediction::Scalar(apparent_age(&probs)))
            }
            Some(labels) => {
                if probs.len() != labels.len() {
                    anyhow::bail!(
                        "{} model returned {} classes, expected {}",
                        self.attribute,
                        probs.len(),
                        labels.len()
                    );
                }
                Ok(Prediction::Distribution(probs))
            }
        }
    }
}

impl AttributePredictor for OpenVinoPredictor {
    fn predict(&self, faces: &[&DynamicImage]) -> Result<Vec<Prediction>> {
        infer_in_chunks(faces, self.batch_max_size, |chunk| {
            debug!("{} batch of {} faces", self.attribute, chunk.len());
            self.infer_chunk(chunk)
        })?
        .iter()
        .map(|row| self.to_prediction(row))
        .collect()
    }
}

/// Run `infer` over consecutive chunks of at most `batch_max_size` faces and
/// concatenate the rows in input order
fn infer_in_chunks<F>(faces: &[&DynamicImage], batch_max_size: usize, mut infer: F) -> Result<Vec<Vec<f32>>>
where
    F: FnMut(&[&DynamicImage]) -> Result<Vec<Vec<f32>>>,
{
    let mut rows = Vec::with_capacity(faces.len());

    for chunk in faces.chunks(batch_max_size.max(1)) {
        let chunk_rows = infer(chunk)?;
        if chunk_rows.len() != chunk.len() {
            anyhow::bail!("model returned {} rows for a chunk of {} faces", chunk_rows.len(), chunk.len());
        }
        rows.extend(chunk_rows);
    }

    Ok(rows)
}

/// Split a flat `[n, k]` output into `n` rows
fn split_rows(output: &[f32], n: usize) -> Result<Vec<Vec<f32>>> {
    if n == 0 {
        return Ok(Vec::new());
    }
    if output.is_empty() || output.len() % n != 0 {
        anyhow::bail!("model output of {} values cannot be split into {} rows", output.len(), n);
    }
    Ok(output.chunks_exact(output.len() / n).map(<[f32]>::to_vec).collect())
}

/// Pass through rows that are already probabilities, softmax raw logits
pub fn to_probabilities(row: &[f32]) -> Vec<f32> {
    let sum: f32 = row.iter().sum();
    let is_distribution = row.iter().all(|v| (0.0..=1.0).contains(v)) && (sum - 1.0).abs() < 1e-3;
    if is_distribution {
        row.iter().map(|v| v / sum).collect()
    } else {
        softmax(row)
    }
}

/// Expected value over the age bins
pub fn apparent_age(probs: &[f32]) -> f32 {
    probs.iter().enumerate().map(|(age, p)| age as f32 * p).sum()
}
