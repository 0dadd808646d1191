//! Error types for model construction and forward passes.
//!
//! Configuration problems surface from `init`/`validate`; inconsistent
//! channel or resolution arithmetic surfaces from the first `forward` call
//! that reaches the offending fusion point.

use thiserror::Error;

/// Main error type for UNesT operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Shape mismatch at a named stage of the network.
    #[error("Shape mismatch at {stage}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        stage: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

/// Result type for UNesT operations.
pub type Result<T> = std::result::Result<T, ModelError>;

impl ModelError {
    /// Create an invalid configuration error.
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a shape mismatch error for `stage`.
    pub fn shape_mismatch(
        stage: impl Into<String>,
        expected: impl Into<Vec<usize>>,
        actual: impl Into<Vec<usize>>,
    ) -> Self {
        Self::ShapeMismatch {
            stage: stage.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}
