//! Model Pool Manager
//!
//! Handles lazy loading and automatic unloading of models after idle timeout.
//! Compiled models are shared read-only across requests.

use std::sync::Arc;
use std::time::{Duration, Instant};
use std::ops::Deref;

use openvino::{Core, CompiledModel};
use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::{info, debug};
use anyhow::Context;

use crate::config::{InferenceConfig, ModelsConfig};

/// Wrapper for OpenVINO Core that implements Send + Sync
pub struct SafeCore(Core);
unsafe impl Send for SafeCore {}
unsafe impl Sync for SafeCore {}

impl Deref for SafeCore {
    type Target = Core;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::ops::DerefMut for SafeCore {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Wrapper for OpenVINO CompiledModel that implements Send + Sync
#[derive(Clone)]
pub struct SafeCompiledModel(pub Arc<CompiledModel>);
unsafe impl Send for SafeCompiledModel {}
unsafe impl Sync for SafeCompiledModel {}

impl SafeCompiledModel {
    /// Create an inference request
    /// OpenVINO CompiledModel methods are thread-safe in C++, but Rust bindings
    /// require &mut self.
    pub fn create_infer_request(&self) -> anyhow::Result<openvino::InferRequest> {
        unsafe {
            let ptr = Arc::as_ptr(&self.0) as *mut CompiledModel;
            (*ptr).create_infer_request().map_err(|e| e.into())
        }
    }
}

impl Deref for SafeCompiledModel {
    type Target = CompiledModel;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A cached model with its last access time
struct CachedModel {
    compiled: SafeCompiledModel,
    last_access: Instant,
}

/// Model types that can be loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelType {
    Detector,
    Age,
    Gender,
    Race,
    Emotion,
}

impl ModelType {
    pub const ALL: [ModelType; 5] = [
        ModelType::Detector,
        ModelType::Age,
        ModelType::Gender,
        ModelType::Race,
        ModelType::Emotion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Detector => "detector",
            ModelType::Age => "age",
            ModelType::Gender => "gender",
            ModelType::Race => "race",
            ModelType::Emotion => "emotion",
        }
    }

    fn slot(&self) -> usize {
        match self {
            ModelType::Detector => 0,
            ModelType::Age => 1,
            ModelType::Gender => 2,
            ModelType::Race => 3,
            ModelType::Emotion => 4,
        }
    }
}

/// Model Pool Manager with lazy loading and auto-unloading
pub struct ModelPool {
    core: Arc<RwLock<SafeCore>>,
    device: String,
    idle_timeout: Duration,
    paths: [String; 5],
    cache: [RwLock<Option<CachedModel>>; 5],
    shutdown: Notify,
}

impl ModelPool {
    /// Create a new model pool. No model is read until first use.
    pub fn new(config: &InferenceConfig, models: &ModelsConfig) -> anyhow::Result<Self> {
        let core = Core::new().context("Failed to initialize OpenVINO runtime")?;

        let path = |p: &std::path::Path| p.to_string_lossy().into_owned();

        Ok(Self {
            core: Arc::new(RwLock::new(SafeCore(core))),
            device: config.device.clone(),
            idle_timeout: Duration::from_secs(config.model_idle_timeout),
            paths: [
                path(&models.detector),
                path(&models.age),
                path(&models.gender),
                path(&models.race),
                path(&models.emotion),
            ],
            cache: Default::default(),
            shutdown: Notify::new(),
        })
    }

    /// Get or load a model, returns a clone of the compiled model
    pub fn get_model(&self, model_type: ModelType) -> anyhow::Result<SafeCompiledModel> {
        let cache = &self.cache[model_type.slot()];

        let hit = cache.read().as_ref().map(|cached| cached.compiled.clone());
        if let Some(compiled) = hit {
            if let Some(cached) = cache.write().as_mut() {
                cached.last_access = Instant::now();
            }
            return Ok(compiled);
        }

        let mut write_guard = cache.write();

        // Double-check after acquiring the write lock
        if let Some(cached) = write_guard.as_mut() {
            cached.last_access = Instant::now();
            return Ok(cached.compiled.clone());
        }

        let path = &self.paths[model_type.slot()];
        info!("Loading model: {} from {}", model_type.as_str(), path);
        let start = Instant::now();

        // Core methods like read_model require &mut self in the Rust bindings
        let mut core = self.core.write();
        let model = core
            .read_model_from_file(path, "")
            .with_context(|| format!("Failed to read {} model from {}", model_type.as_str(), path))?;
        let compiled = core
            .compile_model(&model, self.device.as_str().into())
            .with_context(|| format!("Failed to compile {} model for {}", model_type.as_str(), self.device))?;
        let safe_compiled = SafeCompiledModel(Arc::new(compiled));

        info!("Model {} loaded in {:?}", model_type.as_str(), start.elapsed());

        *write_guard = Some(CachedModel {
            compiled: safe_compiled.clone(),
            last_access: Instant::now(),
        });

        Ok(safe_compiled)
    }

    /// Check if a model is loaded
    pub fn is_loaded(&self, model_type: ModelType) -> bool {
        self.cache[model_type.slot()].read().is_some()
    }

    /// Get status of all models
    pub fn get_status(&self) -> Vec<(ModelType, bool)> {
        ModelType::ALL
            .iter()
            .map(|&t| (t, self.is_loaded(t)))
            .collect()
    }

    /// Check and unload idle models
    fn cleanup_idle_models(&self) {
        let now = Instant::now();

        for model_type in ModelType::ALL {
            let mut guard = self.cache[model_type.slot()].write();
            let idle = guard
                .as_ref()
                .is_some_and(|cached| now.duration_since(cached.last_access) > self.idle_timeout);

            if idle {
                info!("Unloading idle model: {}", model_type.as_str());
                *guard = None;
            }
        }
    }

    /// Start the background cleanup task
    pub async fn start_cleanup_task(self: Arc<Self>) {
        let check_interval = Duration::from_secs(60);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(check_interval) => {
                    debug!("Running model cleanup check");
                    self.cleanup_idle_models();
                }
                _ = self.shutdown.notified() => {
                    info!("Model pool cleanup task shutting down");
                    break;
                }
            }
        }
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

impl Drop for ModelPool {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}
