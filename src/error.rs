//! Analysis error taxonomy

use thiserror::Error;

use crate::pipeline::Attribute;

/// Errors surfaced by an `analyze` call.
///
/// Every variant aborts the whole call. The only locally recoverable case,
/// an image without faces, is handled before it becomes an error when
/// detection is not enforced.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("invalid image at position {index}: {reason}")]
    InvalidImage { index: usize, reason: String },

    #[error("no face detected in image {index}; set enforce_detection=false to tolerate faceless images")]
    NoFaceDetected { index: usize },

    #[error("{attribute} predictor broke its batch contract: {reason}")]
    PredictorContract { attribute: Attribute, reason: String },

    #[error("unsupported attribute '{0}' (expected one of: age, gender, race, emotion)")]
    UnsupportedAttribute(String),

    #[error("unknown detector backend '{0}'")]
    UnknownDetectorBackend(String),

    #[error("no predictor registered for attribute {0}")]
    MissingPredictor(Attribute),

    #[error("actions must name at least one attribute")]
    EmptyActions,

    #[error("{stage} failed: {source:#}")]
    Backend {
        stage: String,
        #[source]
        source: anyhow::Error,
    },
}

impl AnalysisError {
    pub(crate) fn invalid_image(index: usize, reason: impl ToString) -> Self {
        Self::InvalidImage {
            index,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn backend(stage: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Backend {
            stage: stage.into(),
            source,
        }
    }

    /// Stable machine-readable code, used by the REST layer
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidImage { .. } => "INVALID_IMAGE",
            Self::NoFaceDetected { .. } => "NO_FACE_DETECTED",
            Self::PredictorContract { .. } => "PREDICTOR_CONTRACT",
            Self::UnsupportedAttribute(_) => "UNSUPPORTED_ATTRIBUTE",
            Self::UnknownDetectorBackend(_) => "UNKNOWN_DETECTOR_BACKEND",
            Self::MissingPredictor(_) => "MISSING_PREDICTOR",
            Self::EmptyActions => "EMPTY_ACTIONS",
            Self::Backend { .. } => "BACKEND_FAILED",
        }
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_offender() {
        let err = AnalysisError::invalid_image(2, "truncated file");
        assert_eq!(err.to_string(), "invalid image at position 2: truncated file");

        let err = AnalysisError::NoFaceDetected { index: 4 };
        assert!(err.to_string().contains("image 4"));

        let err = AnalysisError::PredictorContract {
            attribute: Attribute::Race,
            reason: "expected 3 predictions, got 2".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "race predictor broke its batch contract: expected 3 predictions, got 2"
        );
    }

    #[test]
    fn test_backend_error_keeps_context_chain() {
        let source = anyhow::anyhow!("tensor shape mismatch").context("emotion inference");
        let err = AnalysisError::backend("emotion prediction", source);
        let msg = err.to_string();
        assert!(msg.starts_with("emotion prediction failed"));
        assert!(msg.contains("tensor shape mismatch"));
        assert_eq!(err.code(), "BACKEND_FAILED");
    }
}
