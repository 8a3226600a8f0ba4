//! Face Analysis Service
//!
//! Estimates age, gender, race and emotion for every face in an image,
//! with OpenVINO acceleration behind an Axum REST API.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use roface_analyze::api::{create_rest_router, AppState};
use roface_analyze::config::Config;
use roface_analyze::engine::{ModelPool, Registry};
use roface_analyze::service::AnalysisService;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    info!("Starting Face Analysis Service v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load(Config::default_path()).unwrap_or_else(|e| {
        info!("Using default config ({})", e);
        Config::default()
    });

    info!("Configuration loaded:");
    info!("  REST port: {}", config.server.rest_port);
    info!("  Device: {} ({} threads)", config.inference.device, config.inference.num_threads);
    info!("  Model idle timeout: {}s", config.inference.model_idle_timeout);
    info!("  Batch max size: {}", config.inference.batch_max_size);
    info!("  Default detector: {}", config.analysis.default_detector_backend);

    // Initialize model pool
    let pool = Arc::new(ModelPool::new(&config.inference, &config.models)?);

    // Start model cleanup task
    tokio::spawn(pool.clone().start_cleanup_task());

    // Wire detectors and predictors
    let registry = Arc::new(Registry::with_openvino(pool.clone(), &config));
    info!("Detector backends: {}", registry.detector_names().join(", "));

    let service = AnalysisService::new(registry, Some(pool.clone()), config.analysis.clone());
    let rest_router = create_rest_router(Arc::new(AppState { service }));

    // Start REST server
    let addr = format!("0.0.0.0:{}", config.server.rest_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("REST API listening on http://{}", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, rest_router).await {
            error!("REST server stopped: {}", e);
        }
    });

    info!("Face Analysis Service is ready!");
    info!("REST: http://localhost:{}/health", config.server.rest_port);

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, cleaning up...");

    // Shutdown model pool
    pool.shutdown();

    info!("Goodbye!");
    Ok(())
}
