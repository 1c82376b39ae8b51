//! # Error types
//!
//! Failures surfaced by the retrieval store, the model backends and the
//! per-session query machinery.
//!
//! - [`VectorStoreError`]: shape problems with vectors handed to the store.
//! - [`RagError`]: everything a query can fail with. The dispatcher turns each
//!   variant into an outbound `error` event, except [`RagError::Cancelled`]:
//!   a cancelled task stays silent and the dispatcher reports the abort itself.

use async_openai::error::OpenAIError;
use thiserror::Error;

/// Errors raised by [`crate::vector_store::VectorStore`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VectorStoreError {
    /// Two vectors that must share a dimension do not.
    #[error("dimension mismatch: expected {expected}D, got {actual}D")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A zero-length vector was offered for storage.
    #[error("vector for key {key:?} is empty")]
    EmptyVector { key: String },
}

/// Errors raised while answering a query.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RagError {
    /// Empty prompt or malformed inbound payload.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A backend could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// A backend answered with a protocol-level failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// The task was cancelled before it finished.
    #[error("operation cancelled")]
    Cancelled,

    /// Anything else, wrapped with the call that failed.
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    VectorStore(#[from] VectorStoreError),
}

impl RagError {
    /// Classify an OpenAI-compatible client error raised by the backend call named `call`.
    pub fn from_backend(call: &str, err: OpenAIError) -> Self {
        match err {
            OpenAIError::Reqwest(e) if e.is_connect() || e.is_timeout() => {
                RagError::Connection(format!("{call}: {e}"))
            }
            OpenAIError::Reqwest(e) if e.is_status() || e.is_decode() => {
                RagError::Backend(format!("{call}: {e}"))
            }
            OpenAIError::ApiError(e) => RagError::Backend(format!("{call}: {}", e.message)),
            OpenAIError::StreamError(e) => RagError::Backend(format!("{call}: {e}")),
            OpenAIError::JSONDeserialize(e) => RagError::Backend(format!("{call}: {e}")),
            other => RagError::Internal(format!("{call}: {other}")),
        }
    }

    /// `true` when the task was cancelled rather than failed.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RagError::Cancelled)
    }
}
