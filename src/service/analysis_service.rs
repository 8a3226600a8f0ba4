//! Analysis Service - async facade over the pipeline
//!
//! Inference is CPU bound, so every call runs on the blocking thread pool.

use std::sync::Arc;
use std::time::Instant;

use tracing::warn;

use crate::config::AnalysisConfig;
use crate::engine::{ModelPool, Registry};
use crate::error::{AnalysisError, Result};
use crate::pipeline::{AnalyzeOptions, Analyzer, ImageInput};

use super::types::*;

/// Face attribute analysis service
#[derive(Clone)]
pub struct AnalysisService {
    analyzer: Analyzer,
    /// Present when backends are OpenVINO models; reported by health checks
    pool: Option<Arc<ModelPool>>,
    defaults: AnalysisConfig,
    started: Instant,
}

impl AnalysisService {
    pub fn new(registry: Arc<Registry>, pool: Option<Arc<ModelPool>>, defaults: AnalysisConfig) -> Self {
        Self {
            analyzer: Analyzer::new(registry),
            pool,
            defaults,
            started: Instant::now(),
        }
    }

    /// Options built from the configured defaults, all attributes requested
    pub fn default_options(&self) -> AnalyzeOptions {
        AnalyzeOptions::from_config(&self.defaults)
    }

    /// Analyze faces in one or many images
    pub async fn analyze(&self, input: ImageInput, options: AnalyzeOptions) -> Result<AnalyzeOutcome> {
        let start = Instant::now();

        let analyzer = self.analyzer.clone();
        let results = tokio::task::spawn_blocking(move || analyzer.analyze(input, &options))
            .await
            .map_err(|e| {
                warn!("Analysis task aborted: {}", e);
                AnalysisError::backend("analysis task", e.into())
            })??;

        Ok(AnalyzeOutcome {
            results,
            inference_time_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Get health status
    pub fn health(&self) -> HealthResult {
        let models_loaded = self
            .pool
            .as_ref()
            .map(|pool| {
                pool.get_status()
                    .into_iter()
                    .map(|(t, loaded)| (t.as_str().to_string(), loaded))
                    .collect()
            })
            .unwrap_or_default();

        HealthResult {
            healthy: true,
            version: env!("CARGO_PKG_VERSION").to_string(),
            models_loaded,
            detector_backends: self.analyzer.registry().detector_names(),
        }
    }

    pub fn metrics(&self) -> MetricsResult {
        let models_loaded = self
            .pool
            .as_ref()
            .map(|pool| pool.get_status().into_iter().filter(|(_, loaded)| *loaded).count())
            .unwrap_or(0);

        MetricsResult {
            models_loaded,
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }
}
