//! Face Analysis Library
//!
//! Age, gender, race and emotion estimation for every face in one image or
//! a batch of images. Detection and attribute models are pluggable through
//! [`engine::Registry`]; [`pipeline::Analyzer`] runs the analysis.

pub mod config;
pub mod error;
pub mod engine;
pub mod pipeline;
pub mod service;
pub mod api;
pub mod utils;

pub use config::Config;
pub use error::{AnalysisError, Result};
pub use pipeline::{Actions, AnalysisResult, AnalyzeOptions, Analyzer, Attribute, FaceResult, ImageInput};
