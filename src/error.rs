//! Error types for nano-specdec.

use std::sync::Arc;

use thiserror::Error;

use crate::core::sequence::SequenceId;

/// Result type alias for nano-specdec operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nano-specdec.
#[derive(Error, Debug)]
pub enum Error {
    /// The block pool has no free block left.
    #[error("out of KV cache blocks: requested {requested}, available {available}")]
    ResourceExhausted { requested: usize, available: usize },

    /// Use of an unknown or already released sequence.
    #[error("sequence {0} is not live in the cache")]
    InvalidSequenceHandle(SequenceId),

    /// The model-compute collaborator failed.
    #[error("model backend failed: {0}")]
    Backend(#[from] BackendError),

    /// Inconsistent shapes or padding across batch slots.
    #[error("malformed batch: {0}")]
    MalformedBatch(String),

    /// A cache invariant was broken. Never expected in correct code.
    #[error("KV cache corruption: {0}")]
    CacheCorruption(String),

    /// Invalid decode state transition.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Errors the caller may recover from by shrinking the batch, lowering the
    /// depth, waiting, or retrying on another compute path.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. } | Self::Backend(_))
    }

    /// Errors that indicate misuse of the API by the caller.
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidSequenceHandle(_)
                | Self::MalformedBatch(_)
                | Self::InvalidStateTransition { .. }
        )
    }
}

/// Failure reported by a [`ModelBackend`](crate::model::ModelBackend).
///
/// Cloneable so one failed batched call can be reported to every slot that
/// took part in it.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct BackendError {
    message: String,
    #[source]
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl BackendError {
    /// Create a backend error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an underlying compute error.
    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<candle_core::Error> for BackendError {
    fn from(err: candle_core::Error) -> Self {
        Self::with_source("tensor computation failed", err)
    }
}
