use crate::types::{DataType, ParameterId, Rank};

pub type Result<T> = std::result::Result<T, QdpError>;

#[derive(Debug, thiserror::Error)]
pub enum QdpError {
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("unsupported {operation}: {reason}")]
    Unsupported {
        operation: &'static str,
        reason: String,
    },

    #[error("{operation} failed at rank {rank}: {reason}")]
    CollectiveFailed {
        operation: &'static str,
        rank: Rank,
        reason: String,
    },

    #[error("unsupported data type: {dtype:?} for operation {op}")]
    UnsupportedDType { dtype: DataType, op: &'static str },

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("shape mismatch in {operation}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        operation: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("no gradient supplied for parameter {id}")]
    MissingGradient { id: ParameterId },

    #[error("gradient supplied for unknown parameter {id}")]
    UnknownParameter { id: ParameterId },

    #[error("residual store is not aligned with the quantized gradients: {reason}")]
    ResidualMisaligned { reason: String },

    #[error("cannot checkpoint with {samples} locally accumulated samples pending")]
    PendingAccumulation { samples: usize },

    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

impl QdpError {
    /// Create a `Configuration` error.
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Create an `Unsupported` error for `operation`.
    pub fn unsupported(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            operation,
            reason: reason.into(),
        }
    }
}
