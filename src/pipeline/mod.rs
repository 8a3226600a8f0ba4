//! Face analysis pipeline
//!
//! `normalize -> locate (per image) -> dispatch (per attribute) -> assemble`

pub mod assemble;
pub mod attribute;
pub mod dispatch;
pub mod input;
pub mod locator;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::config::{AnalysisConfig, ZeroFacePolicy};
use crate::engine::Registry;
use crate::error::Result;

pub use assemble::{AnalysisResult, Distribution, FaceResult};
pub use attribute::{Actions, Attribute, EMOTION_LABELS, GENDER_LABELS, RACE_LABELS};
pub use dispatch::{Dispatched, FaceIndex};
pub use input::{ImageInput, ImageSource};
pub use locator::{DetectedFace, FacialArea, LocateOptions};

/// Per-call options of [`Analyzer::analyze`]
#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    pub actions: Actions,
    pub detector_backend: String,
    /// Fail with `NoFaceDetected` when an image has no face
    pub enforce_detection: bool,
    pub align: bool,
    pub min_confidence: f32,
    pub zero_face_policy: ZeroFacePolicy,
    pub max_faces: Option<NonZeroUsize>,
}

impl AnalyzeOptions {
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            actions: Actions::all(),
            detector_backend: config.default_detector_backend.clone(),
            enforce_detection: config.enforce_detection,
            align: config.align,
            min_confidence: config.min_confidence,
            zero_face_policy: config.zero_face_policy,
            max_faces: config.max_faces,
        }
    }

    fn locate_options(&self) -> LocateOptions {
        LocateOptions {
            enforce_detection: self.enforce_detection,
            align: self.align,
            min_confidence: self.min_confidence,
            zero_face_policy: self.zero_face_policy,
            max_faces: self.max_faces,
        }
    }
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self::from_config(&AnalysisConfig::default())
    }
}

/// Runs the pipeline against the backends of a shared registry
#[derive(Clone)]
pub struct Analyzer {
    registry: Arc<Registry>,
}

impl Analyzer {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Analyze every face of every input image.
    ///
    /// A single image yields a flat list of faces; a list or a stack yields
    /// one inner list per image, in input order. The first error aborts the
    /// whole call.
    pub fn analyze(&self, input: impl Into<ImageInput>, options: &AnalyzeOptions) -> Result<AnalysisResult> {
        let start = Instant::now();

        // Resolve backends before touching any pixels
        let detector = self.registry.detector(&options.detector_backend)?;
        for attribute in options.actions.iter() {
            self.registry.predictor(attribute)?;
        }

        let normalized = input::normalize(input.into())?;
        let locate_options = options.locate_options();

        let per_image = normalized
            .images
            .iter()
            .enumerate()
            .map(|(index, image)| locator::locate(image, index, &**detector, &locate_options))
            .collect::<Result<Vec<_>>>()?;

        let face_count: usize = per_image.iter().map(Vec::len).sum();
        debug!(
            "Located {} face(s) in {} image(s) with {}",
            face_count,
            per_image.len(),
            options.detector_backend
        );

        let dispatched = dispatch::dispatch(&per_image, &options.actions, &self.registry)?;
        let result = assemble::assemble(normalized.batch_mode, &per_image, &dispatched, &options.actions)?;

        info!(
            "Analyzed {} face(s) across {} image(s) in {:?}",
            face_count,
            per_image.len(),
            start.elapsed()
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use image::{DynamicImage, Rgb, RgbImage};
    use ndarray::Array4;

    use crate::engine::{AttributePredictor, DetectorBackend, Prediction, RawFace, SkipDetector};
    use crate::error::AnalysisError;

    /// Reports as many faces as the red value of pixel (0, 0), side by side
    struct RedCountDetector;

    impl DetectorBackend for RedCountDetector {
        fn name(&self) -> &str {
            "redcount"
        }

        fn detect_faces(&self, image: &DynamicImage, _align: bool) -> anyhow::Result<Vec<RawFace>> {
            let count = image.to_rgb8().get_pixel(0, 0)[0] as usize;
            Ok((0..count)
                .map(|i| {
                    let x1 = (i * 10) as f32;
                    RawFace {
                        x1,
                        y1: 0.0,
                        x2: x1 + 10.0,
                        y2: 10.0,
                        confidence: 0.9,
                        landmarks: None,
                        aligned_face: image.crop_imm(i as u32 * 10, 0, 10, 10),
                    }
                })
                .collect())
        }
    }

    #[derive(Default)]
    struct CountingAge {
        calls: AtomicUsize,
    }

    impl AttributePredictor for CountingAge {
        fn predict(&self, faces: &[&DynamicImage]) -> anyhow::Result<Vec<Prediction>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(faces.iter().map(|_| Prediction::Scalar(31.7)).collect())
        }
    }

    /// Fixed distribution with the most weight on `peak`
    struct Peaked {
        classes: usize,
        peak: usize,
    }

    impl AttributePredictor for Peaked {
        fn predict(&self, faces: &[&DynamicImage]) -> anyhow::Result<Vec<Prediction>> {
            let mut probs = vec![0.1 / (self.classes - 1) as f32; self.classes];
            probs[self.peak] = 0.9;
            Ok(faces.iter().map(|_| Prediction::Distribution(probs.clone())).collect())
        }
    }

    fn analyzer() -> (Analyzer, Arc<CountingAge>) {
        let age = Arc::new(CountingAge::default());
        let registry = Registry::new()
            .with_detector(Arc::new(RedCountDetector))
            .with_detector(Arc::new(SkipDetector))
            .with_predictor(Attribute::Age, age.clone())
            .with_predictor(Attribute::Gender, Arc::new(Peaked { classes: 2, peak: 1 }))
            .with_predictor(Attribute::Race, Arc::new(Peaked { classes: 6, peak: 3 }))
            .with_predictor(Attribute::Emotion, Arc::new(Peaked { classes: 7, peak: 3 }));
        (Analyzer::new(Arc::new(registry)), age)
    }

    fn with_faces(count: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 20, Rgb([count, 0, 0])))
    }

    fn options(actions: &[&str]) -> AnalyzeOptions {
        AnalyzeOptions {
            actions: Actions::parse(actions.iter().copied()).unwrap(),
            detector_backend: "redcount".to_string(),
            ..AnalyzeOptions::default()
        }
    }

    #[test]
    fn test_single_image_gives_flat_list() {
        let (analyzer, _) = analyzer();
        let result = analyzer.analyze(with_faces(2), &options(&["age"])).unwrap();

        let faces = result.into_single().unwrap();
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[1].region.x, 10);
        assert_eq!(faces[0].age, Some(31));
    }

    #[test]
    fn test_batch_nests_per_image_with_one_call_per_attribute() {
        let (analyzer, age) = analyzer();
        let input = vec![with_faces(1), with_faces(1), with_faces(2)];
        let result = analyzer.analyze(input, &options(&["age", "gender"])).unwrap();

        let images = result.into_batch().unwrap();
        let lengths: Vec<_> = images.iter().map(Vec::len).collect();
        assert_eq!(lengths, vec![1, 1, 2]);
        assert_eq!(age.calls.load(Ordering::SeqCst), 1);
        assert!(images.iter().flatten().all(|f| f.dominant_gender == Some("Man")));
    }

    #[test]
    fn test_stack_is_batch() {
        let (analyzer, _) = analyzer();
        let mut stack = Array4::<u8>::zeros((2, 20, 40, 3));
        stack[[0, 0, 0, 0]] = 1;
        stack[[1, 0, 0, 0]] = 3;

        let images = analyzer.analyze(stack, &options(&["age"])).unwrap().into_batch().unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[1].len(), 3);
    }

    #[test]
    fn test_record_keys_follow_actions() {
        let (analyzer, _) = analyzer();
        let result = analyzer.analyze(with_faces(1), &options(&["emotion", "race"])).unwrap();

        let json = serde_json::to_value(&result).unwrap();
        let record = json[0].as_object().unwrap();
        for key in ["region", "face_confidence", "race", "dominant_race", "emotion", "dominant_emotion"] {
            assert!(record.contains_key(key), "missing {key}");
        }
        for key in ["age", "gender", "dominant_gender"] {
            assert!(!record.contains_key(key), "unexpected {key}");
        }
        assert_eq!(json[0]["dominant_race"], "white");
        assert_eq!(json[0]["dominant_emotion"], "happy");
    }

    #[test]
    fn test_dominant_is_argmax_of_distribution() {
        let (analyzer, _) = analyzer();
        let faces = analyzer
            .analyze(with_faces(1), &AnalyzeOptions { detector_backend: "redcount".to_string(), ..AnalyzeOptions::default() })
            .unwrap()
            .into_single()
            .unwrap();

        let face = &faces[0];
        let race = face.race.as_ref().unwrap();
        let best = race.iter().fold(("", f32::MIN), |acc, (l, p)| if p > acc.1 { (l, p) } else { acc });
        assert_eq!(face.dominant_race, Some(best.0));
        let total: f32 = race.iter().map(|(_, p)| p).sum();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_repeated_calls_are_identical() {
        let (analyzer, _) = analyzer();
        let opts = options(&["age", "gender", "race", "emotion"]);
        let first = analyzer.analyze(vec![with_faces(2), with_faces(1)], &opts).unwrap();
        let second = analyzer.analyze(vec![with_faces(2), with_faces(1)], &opts).unwrap();
        assert_eq!(first, second);
    }

    /// Derives age and gender from the crop's pixels
    struct PixelMean;

    impl AttributePredictor for PixelMean {
        fn predict(&self, faces: &[&DynamicImage]) -> anyhow::Result<Vec<Prediction>> {
            Ok(faces
                .iter()
                .map(|face| {
                    let rgb = face.to_rgb8();
                    let n = (rgb.width() * rgb.height()).max(1) as f32;
                    let mean = |c: usize| rgb.pixels().map(|p| p[c] as f32).sum::<f32>() / n;
                    Prediction::Distribution(vec![1.0 + mean(0), 1.0 + mean(1)])
                })
                .collect())
        }
    }

    #[test]
    fn test_identical_crops_in_one_batch_match() {
        struct PixelAge;

        impl AttributePredictor for PixelAge {
            fn predict(&self, faces: &[&DynamicImage]) -> anyhow::Result<Vec<Prediction>> {
                Ok(faces
                    .iter()
                    .map(|face| {
                        let rgb = face.to_rgb8();
                        let total: u32 = rgb.pixels().map(|p| p[1] as u32 + p[2] as u32).sum();
                        Prediction::Scalar((total % 90) as f32 + 0.5)
                    })
                    .collect())
            }
        }

        let registry = Registry::new()
            .with_detector(Arc::new(RedCountDetector))
            .with_predictor(Attribute::Age, Arc::new(PixelAge))
            .with_predictor(Attribute::Gender, Arc::new(PixelMean));
        let analyzer = Analyzer::new(Arc::new(registry));

        let textured = |seed: u32| {
            DynamicImage::ImageRgb8(RgbImage::from_fn(40, 20, move |x, y| {
                if (x, y) == (0, 0) {
                    Rgb([1, 0, 0])
                } else {
                    Rgb([(x * 5) as u8, ((y + seed) * 9) as u8, (x * y + seed) as u8])
                }
            }))
        };
        let image = textured(0);

        let images = analyzer
            .analyze(vec![image.clone(), image, textured(3)], &options(&["age", "gender"]))
            .unwrap()
            .into_batch()
            .unwrap();

        assert_eq!(images[0], images[1]);
        assert_ne!(images[0], images[2]);
    }

    #[test]
    fn test_switching_backends_never_fails() {
        let (analyzer, _) = analyzer();
        let image = with_faces(2);

        for backend in ["redcount", "skip"] {
            let opts = AnalyzeOptions {
                detector_backend: backend.to_string(),
                enforce_detection: false,
                ..options(&["age", "emotion"])
            };
            let faces = analyzer.analyze(image.clone(), &opts).unwrap().into_single();
            assert!(faces.is_some_and(|f| !f.is_empty()), "{backend}");
        }
    }

    #[test]
    fn test_faceless_image_with_empty_policy_keeps_slot() {
        let (analyzer, age) = analyzer();
        let opts = AnalyzeOptions {
            enforce_detection: false,
            zero_face_policy: ZeroFacePolicy::Empty,
            ..options(&["age"])
        };
        let images = analyzer
            .analyze(vec![with_faces(0), with_faces(1)], &opts)
            .unwrap()
            .into_batch()
            .unwrap();

        assert!(images[0].is_empty());
        assert_eq!(images[1].len(), 1);
        assert_eq!(age.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_faceless_image_enforced_fails_whole_call() {
        let (analyzer, age) = analyzer();
        let err = analyzer
            .analyze(vec![with_faces(1), with_faces(0)], &options(&["age"]))
            .unwrap_err();
        assert!(matches!(err, AnalysisError::NoFaceDetected { index: 1 }));
        assert_eq!(age.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_skip_backend_analyzes_whole_image() {
        let (analyzer, _) = analyzer();
        let opts = AnalyzeOptions {
            detector_backend: "skip".to_string(),
            enforce_detection: false,
            ..options(&["age"])
        };
        let faces = analyzer.analyze(with_faces(3), &opts).unwrap().into_single().unwrap();

        assert_eq!(faces.len(), 1);
        let region = faces[0].region;
        assert_eq!((region.x, region.y, region.w, region.h), (0, 0, 40, 20));
        assert_eq!(faces[0].face_confidence, 0.0);
    }

    #[test]
    fn test_unknown_backend_fails_before_decoding() {
        let (analyzer, _) = analyzer();
        let opts = AnalyzeOptions { detector_backend: "retinaface".to_string(), ..options(&["age"]) };
        let input = ImageSource::Bytes(b"garbage".to_vec());

        let err = analyzer.analyze(input, &opts).unwrap_err();
        assert!(matches!(err, AnalysisError::UnknownDetectorBackend(ref name) if name == "retinaface"));
    }

    #[test]
    fn test_missing_predictor_fails_before_detection() {
        let registry = Registry::new().with_detector(Arc::new(RedCountDetector));
        let analyzer = Analyzer::new(Arc::new(registry));

        let err = analyzer.analyze(with_faces(1), &options(&["gender"])).unwrap_err();
        assert!(matches!(err, AnalysisError::MissingPredictor(Attribute::Gender)));
    }

    #[test]
    fn test_options_follow_config() {
        let config = AnalysisConfig {
            default_detector_backend: "skip".to_string(),
            max_faces: NonZeroUsize::new(1),
            ..AnalysisConfig::default()
        };
        let opts = AnalyzeOptions::from_config(&config);
        assert_eq!(opts.detector_backend, "skip");
        assert_eq!(opts.max_faces.map(NonZeroUsize::get), Some(1));
        assert_eq!(opts.actions.len(), 4);
    }
}
