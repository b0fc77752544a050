use thiserror::Error;

/// Collected validation failures for a pipeline graph.
///
/// Validation gathers every problem it can find instead of stopping at the
/// first, so callers can report all of them at once.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("graph validation failed: {}", errors.join("; "))]
pub struct GraphValidationError {
    pub errors: Vec<String>,
}

impl GraphValidationError {
    pub fn new(errors: Vec<String>) -> Self {
        Self { errors }
    }

    pub fn single(message: impl Into<String>) -> Self {
        Self {
            errors: vec![message.into()],
        }
    }
}

/// Failure starting a pipeline instance.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("algorithm '{0}' not found")]
    AlgorithmNotFound(String),
    #[error("camera '{0}' is not open")]
    CameraNotOpen(String),
    #[error("file '{0}' not found in any media directory")]
    FileNotFound(String),
    #[error("target '{0}' is a file but the graph has no file source")]
    NoFileSource(String),
    #[error(transparent)]
    InvalidGraph(#[from] GraphValidationError),
    #[error("pipeline build failed: {0}")]
    BuildFailed(String),
}
