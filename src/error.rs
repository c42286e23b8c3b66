//! Error types for the latent dynamics model.

use thiserror::Error;

/// Result type for dynamics model operations.
pub type DynamicsResult<T> = Result<T, DynamicsError>;

/// Errors that can occur while building or querying the dynamics model.
#[derive(Debug, Error)]
pub enum DynamicsError {
    /// Tensor operation failed
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Input widths do not match the dimensions fixed at construction
    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    /// Requested compute target does not exist on this host
    #[error("Invalid device: {0}")]
    InvalidDevice(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Memo keys are single rows; a batch cannot be looked up or stored
    #[error("Batched query ({rows} rows) while memoization is active")]
    BatchedMemoQuery { rows: usize },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl DynamicsError {
    /// Create a shape mismatch error
    pub fn shape_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create an invalid device error
    pub fn invalid_device(msg: impl Into<String>) -> Self {
        Self::InvalidDevice(msg.into())
    }

    /// Create an invalid config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}
