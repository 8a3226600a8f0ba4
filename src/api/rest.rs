//! Axum REST API handlers

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
    extract::{State, Multipart, DefaultBodyLimit},
    http::StatusCode,
    response::Json,
};
use tower_http::cors::{CorsLayer, Any};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::error::AnalysisError;
use crate::pipeline::{Actions, AnalyzeOptions, ImageInput, ImageSource};
use crate::service::AnalysisService;

use super::dto::*;

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Application state shared across handlers
pub struct AppState {
    pub service: AnalysisService,
}

/// Create the REST API router
pub fn create_rest_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/analyze", post(analyze_handler))
        // System endpoints
        .route("/health", get(health_handler))
        .route("/api/v1/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        // Middleware
        .layer(DefaultBodyLimit::max(50 * 1024 * 1024)) // 50MB limit for large batches
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Multipart fields of an analyze request
#[derive(Debug, Default)]
struct AnalyzeForm {
    images: Vec<Vec<u8>>,
    actions: Option<String>,
    enforce_detection: Option<bool>,
    align: Option<bool>,
    detector_backend: Option<String>,
    batch: bool,
}

impl AnalyzeForm {
    /// Overlay the submitted fields on the service defaults
    fn options(&self, mut options: AnalyzeOptions) -> Result<AnalyzeOptions, AnalysisError> {
        if let Some(actions) = &self.actions {
            options.actions = Actions::parse(
                actions.split(',').map(str::trim).filter(|name| !name.is_empty()),
            )?;
        }
        if let Some(enforce) = self.enforce_detection {
            options.enforce_detection = enforce;
        }
        if let Some(align) = self.align {
            options.align = align;
        }
        if let Some(backend) = &self.detector_backend {
            options.detector_backend = backend.clone();
        }
        Ok(options)
    }

    /// One image is a single input unless `batch` is set; several are a list
    fn into_input(self) -> ImageInput {
        let mut sources: Vec<ImageSource> = self.images.into_iter().map(ImageSource::Bytes).collect();
        if sources.len() == 1 && !self.batch {
            ImageInput::Single(sources.remove(0))
        } else {
            ImageInput::List(sources)
        }
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ApiError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(&format!("Field {} expects a boolean, got {:?}", name, value), "INVALID_FIELD")),
        )),
    }
}

async fn read_form(mut multipart: Multipart) -> Result<AnalyzeForm, ApiError> {
    let mut form = AnalyzeForm::default();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(&e.to_string(), "MULTIPART_ERROR")))
    })? {
        let name = field.name().unwrap_or("").to_string();

        if name == "image" {
            form.images.push(field.bytes().await.map_err(|e| {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(&e.to_string(), "READ_ERROR")))
            })?.to_vec());
            continue;
        }

        let value = field.text().await.map_err(|e| {
            (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(&e.to_string(), "READ_ERROR")))
        })?;

        match name.as_str() {
            "actions" => form.actions = Some(value),
            "enforce_detection" => form.enforce_detection = Some(parse_bool(&name, &value)?),
            "align" => form.align = Some(parse_bool(&name, &value)?),
            "detector_backend" => form.detector_backend = Some(value.trim().to_string()),
            "batch" => form.batch = parse_bool(&name, &value)?,
            _ => warn!("Ignoring unknown multipart field {:?}", name),
        }
    }

    Ok(form)
}

/// Map pipeline errors to HTTP status codes
fn error_response(e: &AnalysisError) -> ApiError {
    let status = match e {
        AnalysisError::InvalidImage { .. }
        | AnalysisError::UnsupportedAttribute(_)
        | AnalysisError::UnknownDetectorBackend(_)
        | AnalysisError::EmptyActions => StatusCode::BAD_REQUEST,
        AnalysisError::NoFaceDetected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        AnalysisError::PredictorContract { .. }
        | AnalysisError::MissingPredictor(_)
        | AnalysisError::Backend { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        error!("Analysis failed: {}", e);
    }
    (status, Json(ErrorResponse::new(&e.to_string(), e.code())))
}

/// Analyze face attributes
async fn analyze_handler(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    let form = read_form(multipart).await?;

    if form.images.is_empty() {
        return Err((StatusCode::BAD_REQUEST, Json(ErrorResponse::new("Missing image field", "MISSING_IMAGE"))));
    }

    let options = form
        .options(state.service.default_options())
        .map_err(|e| error_response(&e))?;

    let outcome = state
        .service
        .analyze(form.into_input(), options)
        .await
        .map_err(|e| error_response(&e))?;

    Ok(Json(AnalyzeResponse {
        results: outcome.results,
        inference_time_ms: outcome.inference_time_ms,
    }))
}

/// Health check
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let health = state.service.health();

    Json(HealthResponse {
        healthy: health.healthy,
        version: health.version,
        models_loaded: health.models_loaded,
        detector_backends: health.detector_backends,
    })
}

/// Metrics
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Json<MetricsResponse> {
    let metrics = state.service.metrics();

    Json(MetricsResponse {
        models_loaded: metrics.models_loaded,
        uptime_seconds: metrics.uptime_seconds,
    })
}
