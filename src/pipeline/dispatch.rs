//! Attribute dispatch
//!
//! Flattens the faces of every image into one pool per requested attribute
//! and runs each predictor once over its whole pool. Results come back in
//! pool order and are scattered later through the retained face indices.

use std::collections::BTreeMap;
use std::time::Instant;

use image::DynamicImage;
use tracing::debug;

use crate::engine::{Prediction, Registry};
use crate::error::{AnalysisError, Result};

use super::attribute::{Actions, Attribute};
use super::locator::DetectedFace;

/// Position of a face: source image, then face within that image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceIndex {
    pub image: usize,
    pub face: usize,
}

/// Crops pending prediction, one pool per attribute, plus where each came from.
/// All pools share the same order, so `origins[i]` describes entry `i` of every pool.
pub struct AttributePool<'a> {
    pools: BTreeMap<Attribute, Vec<&'a DynamicImage>>,
    origins: Vec<FaceIndex>,
}

impl<'a> AttributePool<'a> {
    pub fn build(per_image: &'a [Vec<DetectedFace>], actions: &Actions) -> Self {
        let origins: Vec<FaceIndex> = per_image
            .iter()
            .enumerate()
            .flat_map(|(image, faces)| (0..faces.len()).map(move |face| FaceIndex { image, face }))
            .collect();

        let crops: Vec<&'a DynamicImage> = per_image
            .iter()
            .flat_map(|faces| faces.iter().map(|f| &f.aligned_crop))
            .collect();

        let pools = actions.iter().map(|attribute| (attribute, crops.clone())).collect();

        Self { pools, origins }
    }

    pub fn origins(&self) -> &[FaceIndex] {
        &self.origins
    }

    pub fn crops(&self, attribute: Attribute) -> &[&'a DynamicImage] {
        self.pools.get(&attribute).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of faces in every pool
    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }
}

/// Predictions per attribute, aligned with `origins`
#[derive(Debug, Default)]
pub struct Dispatched {
    pub origins: Vec<FaceIndex>,
    pub predictions: BTreeMap<Attribute, Vec<Prediction>>,
}

impl Dispatched {
    pub fn get(&self, attribute: Attribute, pool_index: usize) -> Option<&Prediction> {
        self.predictions.get(&attribute).and_then(|p| p.get(pool_index))
    }
}

/// Run every requested predictor once over the pooled faces
pub fn dispatch(
    per_image: &[Vec<DetectedFace>],
    actions: &Actions,
    registry: &Registry,
) -> Result<Dispatched> {
    let pool = AttributePool::build(per_image, actions);
    let mut predictions = BTreeMap::new();

    for attribute in actions.iter() {
        let crops = pool.crops(attribute);
        if crops.is_empty() {
            predictions.insert(attribute, Vec::new());
            continue;
        }

        let predictor = registry.predictor(attribute)?;
        let start = Instant::now();
        let output = predictor
            .predict(crops)
            .map_err(|e| AnalysisError::backend(format!("{} prediction", attribute), e))?;

        validate(attribute, &output, crops.len())?;
        debug!("{} predicted for {} faces in {:?}", attribute, crops.len(), start.elapsed());

        predictions.insert(attribute, output);
    }

    Ok(Dispatched {
        origins: pool.origins().to_vec(),
        predictions,
    })
}

/// Enforce the batch contract: same length, right kind, right label count,
/// and distributions that are non-negative with positive mass
fn validate(attribute: Attribute, output: &[Prediction], expected: usize) -> Result<()> {
    let broken = |reason: String| AnalysisError::PredictorContract { attribute, reason };

    if output.len() != expected {
        return Err(broken(format!("expected {} predictions, got {}", expected, output.len())));
    }

    for (i, prediction) in output.iter().enumerate() {
        match (attribute.labels(), prediction) {
            (None, Prediction::Scalar(value)) if value.is_finite() => {}
            (None, Prediction::Scalar(value)) => {
                return Err(broken(format!("prediction {} is not finite ({})", i, value)));
            }
            (Some(labels), Prediction::Distribution(probs)) => {
                if probs.len() != labels.len() {
                    return Err(broken(format!(
                        "prediction {} has {} probabilities for {} labels",
                        i,
                        probs.len(),
                        labels.len()
                    )));
                }
                if probs.iter().any(|p| !p.is_finite()) {
                    return Err(broken(format!("prediction {} contains non-finite probabilities", i)));
                }
                if probs.iter().any(|&p| p < 0.0) {
                    return Err(broken(format!("prediction {} contains negative probabilities", i)));
                }
                if probs.iter().sum::<f32>() <= 0.0 {
                    return Err(broken(format!("prediction {} has no probability mass", i)));
                }
            }
            (None, Prediction::Distribution(_)) => {
                return Err(broken(format!("prediction {} is a distribution, expected a scalar", i)));
            }
            (Some(_), Prediction::Scalar(_)) => {
                return Err(broken(format!("prediction {} is a scalar, expected a distribution", i)));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use image::{GenericImageView, Rgb, RgbImage};

    use crate::engine::AttributePredictor;
    use crate::pipeline::locator::FacialArea;

    /// Encodes each crop's red channel as the scalar age and counts calls
    #[derive(Default)]
    struct RedAge {
        calls: AtomicUsize,
        batch_sizes: parking_lot::Mutex<Vec<usize>>,
    }

    impl AttributePredictor for RedAge {
        fn predict(&self, faces: &[&DynamicImage]) -> anyhow::Result<Vec<Prediction>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batch_sizes.lock().push(faces.len());
            Ok(faces
                .iter()
                .map(|f| Prediction::Scalar(f.to_rgb8().get_pixel(0, 0)[0] as f32))
                .collect())
        }
    }

    /// Drops the last prediction
    struct ShortGender;

    impl AttributePredictor for ShortGender {
        fn predict(&self, faces: &[&DynamicImage]) -> anyhow::Result<Vec<Prediction>> {
            Ok(faces
                .iter()
                .skip(1)
                .map(|_| Prediction::Distribution(vec![0.5, 0.5]))
                .collect())
        }
    }

    /// Returns scalars for a categorical attribute
    struct ScalarRace;

    impl AttributePredictor for ScalarRace {
        fn predict(&self, faces: &[&DynamicImage]) -> anyhow::Result<Vec<Prediction>> {
            Ok(faces.iter().map(|_| Prediction::Scalar(1.0)).collect())
        }
    }

    fn face(image: usize, red: u8) -> DetectedFace {
        DetectedFace {
            aligned_crop: DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([red, 0, 0]))),
            region: FacialArea { x: 0, y: 0, w: 4, h: 4, left_eye: None, right_eye: None },
            confidence: 0.9,
            source_image_index: image,
        }
    }

    #[test]
    fn test_pool_flattens_in_image_then_face_order() {
        let per_image = vec![vec![face(0, 10)], vec![], vec![face(2, 20), face(2, 30)]];
        let actions = Actions::parse(["age", "gender"]).unwrap();
        let pool = AttributePool::build(&per_image, &actions);

        assert_eq!(pool.len(), 3);
        assert_eq!(
            pool.origins(),
            &[
                FaceIndex { image: 0, face: 0 },
                FaceIndex { image: 2, face: 0 },
                FaceIndex { image: 2, face: 1 },
            ]
        );
        assert_eq!(pool.crops(Attribute::Gender).len(), 3);
        assert!(pool.crops(Attribute::Race).is_empty());
        assert_eq!(pool.crops(Attribute::Age)[2].dimensions(), (4, 4));
    }

    #[test]
    fn test_one_predictor_call_across_images() {
        let age = Arc::new(RedAge::default());
        let registry = Registry::new().with_predictor(Attribute::Age, age.clone());
        let per_image = vec![vec![face(0, 10)], vec![face(1, 20)], vec![face(2, 30), face(2, 40)]];

        let dispatched = dispatch(&per_image, &Actions::parse(["age"]).unwrap(), &registry).unwrap();

        assert_eq!(age.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*age.batch_sizes.lock(), vec![4]);
        let ages: Vec<_> = dispatched.predictions[&Attribute::Age].clone();
        assert_eq!(
            ages,
            vec![
                Prediction::Scalar(10.0),
                Prediction::Scalar(20.0),
                Prediction::Scalar(30.0),
                Prediction::Scalar(40.0),
            ]
        );
        assert_eq!(dispatched.origins[3], FaceIndex { image: 2, face: 1 });
    }

    #[test]
    fn test_empty_pool_skips_predictor() {
        let age = Arc::new(RedAge::default());
        let registry = Registry::new().with_predictor(Attribute::Age, age.clone());
        let per_image: Vec<Vec<DetectedFace>> = vec![vec![], vec![]];

        let dispatched = dispatch(&per_image, &Actions::parse(["age"]).unwrap(), &registry).unwrap();

        assert_eq!(age.calls.load(Ordering::SeqCst), 0);
        assert!(dispatched.origins.is_empty());
        assert!(dispatched.predictions[&Attribute::Age].is_empty());
    }

    #[test]
    fn test_short_output_breaks_contract() {
        let registry = Registry::new().with_predictor(Attribute::Gender, Arc::new(ShortGender));
        let per_image = vec![vec![face(0, 1), face(0, 2)]];

        let err = dispatch(&per_image, &Actions::parse(["gender"]).unwrap(), &registry).unwrap_err();
        match err {
            AnalysisError::PredictorContract { attribute, reason } => {
                assert_eq!(attribute, Attribute::Gender);
                assert_eq!(reason, "expected 2 predictions, got 1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_wrong_kind_breaks_contract() {
        let registry = Registry::new().with_predictor(Attribute::Race, Arc::new(ScalarRace));
        let per_image = vec![vec![face(0, 1)]];

        let err = dispatch(&per_image, &Actions::parse(["race"]).unwrap(), &registry).unwrap_err();
        assert!(matches!(err, AnalysisError::PredictorContract { attribute: Attribute::Race, .. }));
    }

    #[test]
    fn test_wrong_label_count_breaks_contract() {
        let output = vec![Prediction::Distribution(vec![0.2, 0.3, 0.5])];
        let err = validate(Attribute::Gender, &output, 1).unwrap_err();
        assert!(err.to_string().contains("3 probabilities for 2 labels"));
    }

    #[test]
    fn test_zero_mass_distribution_breaks_contract() {
        let output = vec![Prediction::Distribution(vec![0.0, 0.0])];
        let err = validate(Attribute::Gender, &output, 1).unwrap_err();
        assert!(matches!(err, AnalysisError::PredictorContract { attribute: Attribute::Gender, .. }));
        assert!(err.to_string().contains("no probability mass"));
    }

    #[test]
    fn test_negative_probability_breaks_contract() {
        for probs in [vec![-1.0, 2.0], vec![-1.0, 1.0]] {
            let output = vec![Prediction::Distribution(probs)];
            let err = validate(Attribute::Gender, &output, 1).unwrap_err();
            assert!(err.to_string().contains("negative probabilities"));
        }
    }

    /// Returns a fixed gender row for every face
    struct FixedGender(Vec<f32>);

    impl AttributePredictor for FixedGender {
        fn predict(&self, faces: &[&DynamicImage]) -> anyhow::Result<Vec<Prediction>> {
            Ok(faces.iter().map(|_| Prediction::Distribution(self.0.clone())).collect())
        }
    }

    #[test]
    fn test_degenerate_distribution_rejected_by_dispatch() {
        let per_image = vec![vec![face(0, 1)]];
        for row in [vec![0.0, 0.0], vec![-1.0, 2.0]] {
            let registry = Registry::new().with_predictor(Attribute::Gender, Arc::new(FixedGender(row)));
            let err = dispatch(&per_image, &Actions::parse(["gender"]).unwrap(), &registry).unwrap_err();
            assert!(matches!(err, AnalysisError::PredictorContract { attribute: Attribute::Gender, .. }));
        }
    }

    #[test]
    fn test_missing_predictor_is_reported() {
        let per_image = vec![vec![face(0, 1)]];
        let err = dispatch(&per_image, &Actions::parse(["emotion"]).unwrap(), &Registry::new()).unwrap_err();
        assert!(matches!(err, AnalysisError::MissingPredictor(Attribute::Emotion)));
    }
}
