//! The closed error taxonomy shared by the Hybrid Service and HTTP Surface.
//!
//! Every fallible operation inside the core eventually resolves to one of
//! these kinds so the HTTP layer can pick a status code without inspecting
//! message text.

use thiserror::Error;

/// Error kinds per the error-handling design. Propagation policy lives with
/// the call sites, not the enum itself.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("transient embedding failure: {0}")]
    TransientEmbeddingFailure(String),

    #[error("partial context failure for chunk {chunk_id}: {source}")]
    PartialContextFailure {
        chunk_id: String,
        source: anyhow::Error,
    },

    #[error("request cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        CoreError::InvalidArgument(msg.into())
    }

    pub fn backend_unavailable(msg: impl Into<String>) -> Self {
        CoreError::BackendUnavailable(msg.into())
    }

    /// Machine-readable code, stable across releases, used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidArgument(_) => "invalid_argument",
            CoreError::DimensionMismatch { .. } => "dimension_mismatch",
            CoreError::BackendUnavailable(_) => "backend_unavailable",
            CoreError::TransientEmbeddingFailure(_) => "transient_embedding_failure",
            CoreError::PartialContextFailure { .. } => "partial_context_failure",
            CoreError::Cancelled => "cancelled",
            CoreError::Internal(_) => "internal",
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
