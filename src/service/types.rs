//! Service layer types

use std::collections::BTreeMap;

use serde::Serialize;

use crate::pipeline::AnalysisResult;

/// Face attribute analysis result
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeOutcome {
    pub results: AnalysisResult,
    pub inference_time_ms: u64,
}

/// Health check result
#[derive(Debug, Clone, Serialize)]
pub struct HealthResult {
    pub healthy: bool,
    pub version: String,
    pub models_loaded: BTreeMap<String, bool>,
    pub detector_backends: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsResult {
    pub models_loaded: usize,
    pub uptime_seconds: u64,
}
