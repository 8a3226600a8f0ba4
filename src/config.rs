//! Face analysis service configuration

use serde::Deserialize;
use std::num::NonZeroUsize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub inference: InferenceConfig,
    pub models: ModelsConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub rest_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    pub device: String,
    /// Informational only: logged at startup, OpenVINO sizes its CPU
    /// thread pool itself
    pub num_threads: u32,
    pub model_idle_timeout: u64,
    /// Largest batch handed to a single model call; bigger pools are chunked
    pub batch_max_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    pub detector: PathBuf,
    pub age: PathBuf,
    pub gender: PathBuf,
    pub race: PathBuf,
    pub emotion: PathBuf,
}

/// SCRFD decoding parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            nms_threshold: 0.4,
        }
    }
}

/// What to do with an image that yields no face when detection is not enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroFacePolicy {
    /// Report no faces for that image
    Empty,
    /// Analyze the whole image as one unaligned face with confidence 0
    #[default]
    WholeImage,
}

/// Defaults for per-call analysis options
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub default_detector_backend: String,
    pub enforce_detection: bool,
    pub align: bool,
    /// Detections scoring below this are dropped; 0.0 keeps everything
    pub min_confidence: f32,
    pub zero_face_policy: ZeroFacePolicy,
    /// Keep only the N largest faces per image; zero is rejected at load
    pub max_faces: Option<NonZeroUsize>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            default_detector_backend: "scrfd".to_string(),
            enforce_detection: true,
            align: true,
            min_confidence: 0.0,
            zero_face_policy: ZeroFacePolicy::WholeImage,
            max_faces: None,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn default_path() -> &'static str {
        "config.toml"
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig { rest_port: 3000 },
            inference: InferenceConfig {
                device: "CPU".to_string(),
                num_threads: 4,
                model_idle_timeout: 300,
                batch_max_size: 16,
            },
            models: ModelsConfig {
                detector: PathBuf::from("models/scrfd_10g_kps.onnx"),
                age: PathBuf::from("models/age_vgg.onnx"),
                gender: PathBuf::from("models/gender_vgg.onnx"),
                race: PathBuf::from("models/race_vgg.onnx"),
                emotion: PathBuf::from("models/emotion_fer.onnx"),
            },
            detection: DetectionConfig::default(),
            analysis: AnalysisConfig::default(),
        }
    }
}
