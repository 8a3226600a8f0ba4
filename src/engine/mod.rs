//! Inference engine module
//!
//! Provides OpenVINO-based inference with:
//! - Model lazy loading and auto-unloading
//! - Pluggable face detector backends
//! - Batched attribute predictors

pub mod pool;
pub mod detector;
pub mod predictor;
pub mod preprocess;
pub mod registry;

pub use pool::ModelPool;
pub use detector::{DetectorBackend, RawFace, ScrfdDetector, SkipDetector};
pub use predictor::{AttributePredictor, OpenVinoPredictor, Prediction};
pub use registry::Registry;
