//! Result assembly
//!
//! Scatters pooled predictions back to their faces and nests the records to
//! mirror the input: a flat list for one image, one list per image otherwise.

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::engine::Prediction;
use crate::error::{AnalysisError, Result};
use crate::utils::math::argmax;

use super::attribute::{Actions, Attribute};
use super::dispatch::Dispatched;
use super::locator::{DetectedFace, FacialArea};

/// Probabilities over an attribute's labels, kept in label order
#[derive(Debug, Clone, PartialEq)]
pub struct Distribution {
    entries: Vec<(&'static str, f32)>,
}

impl Distribution {
    /// Pair labels with probabilities, renormalized to sum to 1
    fn new(labels: &'static [&'static str], probs: &[f32]) -> Self {
        let sum: f32 = probs.iter().sum();
        let scale = if sum > 0.0 { 1.0 / sum } else { 0.0 };
        Self {
            entries: labels.iter().copied().zip(probs.iter().map(|p| p * scale)).collect(),
        }
    }

    pub fn get(&self, label: &str) -> Option<f32> {
        self.entries.iter().find(|(l, _)| *l == label).map(|(_, p)| *p)
    }

    /// Highest-probability label; the first declared label wins ties
    pub fn dominant(&self) -> &'static str {
        let probs: Vec<f32> = self.entries.iter().map(|(_, p)| *p).collect();
        self.entries[argmax(&probs)].0
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, f32)> + '_ {
        self.entries.iter().copied()
    }
}

impl Serialize for Distribution {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (label, p) in &self.entries {
            map.serialize_entry(label, p)?;
        }
        map.end()
    }
}

/// Attributes of one face. Attributes that were not requested stay `None`
/// and are left out of the serialized record.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FaceResult {
    pub region: FacialArea,
    pub face_confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<Distribution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dominant_gender: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub race: Option<Distribution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dominant_race: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion: Option<Distribution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dominant_emotion: Option<&'static str>,
}

impl FaceResult {
    fn new(face: &DetectedFace) -> Self {
        Self {
            region: face.region,
            face_confidence: face.confidence,
            age: None,
            gender: None,
            dominant_gender: None,
            race: None,
            dominant_race: None,
            emotion: None,
            dominant_emotion: None,
        }
    }

    fn set(&mut self, attribute: Attribute, prediction: &Prediction) -> Result<()> {
        let distribution = |labels| match prediction {
            Prediction::Distribution(probs) => Ok(Distribution::new(labels, probs)),
            Prediction::Scalar(_) => Err(AnalysisError::PredictorContract {
                attribute,
                reason: "expected a distribution".to_string(),
            }),
        };

        match (attribute, attribute.labels()) {
            (Attribute::Age, _) => match prediction {
                // Truncate, not round
                Prediction::Scalar(years) => self.age = Some(years.max(0.0) as u32),
                Prediction::Distribution(_) => {
                    return Err(AnalysisError::PredictorContract {
                        attribute,
                        reason: "expected a scalar".to_string(),
                    })
                }
            },
            (Attribute::Gender, Some(labels)) => {
                let d = distribution(labels)?;
                self.dominant_gender = Some(d.dominant());
                self.gender = Some(d);
            }
            (Attribute::Race, Some(labels)) => {
                let d = distribution(labels)?;
                self.dominant_race = Some(d.dominant());
                self.race = Some(d);
            }
            (Attribute::Emotion, Some(labels)) => {
                let d = distribution(labels)?;
                self.dominant_emotion = Some(d.dominant());
                self.emotion = Some(d);
            }
            (_, None) => unreachable!("only age is scalar"),
        }
        Ok(())
    }
}

/// Output of `analyze`, nested to match the input
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum AnalysisResult {
    /// One image: its faces
    Single(Vec<FaceResult>),
    /// Many images: one inner list per image, in input order
    Batch(Vec<Vec<FaceResult>>),
}

impl AnalysisResult {
    pub fn is_batch(&self) -> bool {
        matches!(self, AnalysisResult::Batch(_))
    }

    /// Faces of every image, in order
    pub fn faces(&self) -> Box<dyn Iterator<Item = &FaceResult> + '_> {
        match self {
            AnalysisResult::Single(faces) => Box::new(faces.iter()),
            AnalysisResult::Batch(images) => Box::new(images.iter().flatten()),
        }
    }

    pub fn into_single(self) -> Option<Vec<FaceResult>> {
        match self {
            AnalysisResult::Single(faces) => Some(faces),
            AnalysisResult::Batch(_) => None,
        }
    }

    pub fn into_batch(self) -> Option<Vec<Vec<FaceResult>>> {
        match self {
            AnalysisResult::Batch(images) => Some(images),
            AnalysisResult::Single(_) => None,
        }
    }
}

/// Build the nested result from per-image faces and pooled predictions
pub fn assemble(
    batch_mode: bool,
    per_image: &[Vec<DetectedFace>],
    dispatched: &Dispatched,
    actions: &Actions,
) -> Result<AnalysisResult> {
    let mut nested: Vec<Vec<FaceResult>> = per_image.iter().map(|faces| Vec::with_capacity(faces.len())).collect();

    for (pool_index, origin) in dispatched.origins.iter().enumerate() {
        let face = &per_image[origin.image][origin.face];
        let mut record = FaceResult::new(face);

        for attribute in actions.iter() {
            let prediction = dispatched.get(attribute, pool_index).ok_or_else(|| {
                AnalysisError::PredictorContract {
                    attribute,
                    reason: format!("no prediction for pooled face {}", pool_index),
                }
            })?;
            record.set(attribute, prediction)?;
        }

        debug_assert_eq!(nested[origin.image].len(), origin.face);
        nested[origin.image].push(record);
    }

    Ok(if batch_mode {
        AnalysisResult::Batch(nested)
    } else {
        AnalysisResult::Single(nested.into_iter().next().unwrap_or_default())
    })
}
