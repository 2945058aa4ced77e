//! Error types for the Frost engine

use thiserror::Error;

/// Main error type for the Frost engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// A deployment is already in flight for the service
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// Rollback target image was pruned from the local image store
    #[error("Image no longer available: {0}")]
    ImageGone(String),

    #[error("Build failed: {0}")]
    BuildFailure(String),

    #[error("Rollout failed: {0}")]
    RolloutFailure(String),

    /// The container runtime, git or the proxy failed unexpectedly
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Short machine-readable kind, surfaced in API error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Conflict(_) => "conflict",
            EngineError::Validation(_) => "validation",
            EngineError::ImageGone(_) => "image_gone",
            EngineError::BuildFailure(_) => "build_failure",
            EngineError::RolloutFailure(_) => "rollout_failure",
            EngineError::NotFound(_) => "not_found",
            EngineError::Timeout(_) => "timeout",
            EngineError::IoError(_)
            | EngineError::HttpError(_)
            | EngineError::Infrastructure(_) => "infrastructure",
            _ => "internal",
        }
    }

    /// Rejections raised before any side effect
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            EngineError::Conflict(_)
                | EngineError::Validation(_)
                | EngineError::ImageGone(_)
                | EngineError::NotFound(_)
        )
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(EngineError::Conflict("x".into()).kind(), "conflict");
        assert_eq!(EngineError::ImageGone("x".into()).kind(), "image_gone");
        assert_eq!(EngineError::Infrastructure("x".into()).kind(), "infrastructure");
        assert_eq!(EngineError::ShutdownError("x".into()).kind(), "internal");
    }

    #[test]
    fn test_rejections() {
        assert!(EngineError::Validation("bad".into()).is_rejection());
        assert!(EngineError::ImageGone("gone".into()).is_rejection());
        assert!(!EngineError::RolloutFailure("unhealthy".into()).is_rejection());
    }
}
