//! Detector and predictor registry
//!
//! Maps backend names to detectors and attributes to predictors. Instances
//! are shared read-only behind `Arc`, so one registry serves the whole process.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::Config;
use crate::error::{AnalysisError, Result};
use crate::pipeline::Attribute;

use super::detector::{DetectorBackend, ScrfdDetector, SkipDetector};
use super::pool::ModelPool;
use super::predictor::{AttributePredictor, OpenVinoPredictor};

#[derive(Default, Clone)]
pub struct Registry {
    detectors: HashMap<String, Arc<dyn DetectorBackend>>,
    predictors: BTreeMap<Attribute, Arc<dyn AttributePredictor>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry wired to the OpenVINO models of `pool`
    pub fn with_openvino(pool: Arc<ModelPool>, config: &Config) -> Self {
        let mut registry = Self::new()
            .with_detector(Arc::new(ScrfdDetector::new(
                pool.clone(),
                config.detection.confidence_threshold,
                config.detection.nms_threshold,
            )))
            .with_detector(Arc::new(SkipDetector));

        for attribute in Attribute::ALL {
            registry = registry.with_predictor(
                attribute,
                Arc::new(OpenVinoPredictor::new(pool.clone(), attribute, config.inference.batch_max_size)),
            );
        }

        registry
    }

    /// Register a detector under its own name, replacing any previous one
    pub fn with_detector(mut self, detector: Arc<dyn DetectorBackend>) -> Self {
        self.detectors.insert(detector.name().to_string(), detector);
        self
    }

    pub fn with_predictor(mut self, attribute: Attribute, predictor: Arc<dyn AttributePredictor>) -> Self {
        self.predictors.insert(attribute, predictor);
        self
    }

    pub fn detector(&self, name: &str) -> Result<&Arc<dyn DetectorBackend>> {
        self.detectors
            .get(name)
            .ok_or_else(|| AnalysisError::UnknownDetectorBackend(name.to_string()))
    }

    pub fn predictor(&self, attribute: Attribute) -> Result<&Arc<dyn AttributePredictor>> {
        self.predictors
            .get(&attribute)
            .ok_or(AnalysisError::MissingPredictor(attribute))
    }

    /// Registered detector names, sorted
    pub fn detector_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.detectors.keys().cloned().collect();
        names.sort();
        names
    }
}
