//! Service layer module

pub mod analysis_service;
pub mod types;

pub use analysis_service::AnalysisService;
pub use types::*;
