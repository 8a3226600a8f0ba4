//! REST API request/response data transfer objects

use std::collections::BTreeMap;

use serde::Serialize;

use crate::pipeline::AnalysisResult;

/// Analyze response
#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    pub results: AnalysisResult,
    pub inference_time_ms: u64,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: String,
    pub models_loaded: BTreeMap<String, bool>,
    pub detector_backends: Vec<String>,
}

/// Metrics response
#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub models_loaded: usize,
    pub uptime_seconds: u64,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ErrorResponse {
    pub fn new(error: &str, code: &str) -> Self {
        Self {
            error: error.to_string(),
            code: code.to_string(),
        }
    }
}
