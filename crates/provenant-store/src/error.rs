//! Error types for the persistence tier

use crate::tier::StorageLevel;
use std::time::Duration;

/// Persistence tier errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Key absent from every tier that was consulted
    #[error("state not found: {state_id} (tried {tried:?})")]
    StateNotFound {
        state_id: String,
        tried: Vec<StorageLevel>,
    },

    /// A tier did not answer within the configured bound
    #[error("{level} {operation} timed out after {}ms", after.as_millis())]
    Timeout {
        level: StorageLevel,
        operation: &'static str,
        after: Duration,
    },

    /// No store registered for the requested level
    #[error("storage level {0} is not configured")]
    TierUnavailable(StorageLevel),

    /// Key cannot be mapped onto the tier (e.g. path traversal)
    #[error("invalid state id: {0}")]
    InvalidKey(String),

    /// Filesystem failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite failure
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Compressed frame could not be decoded
    #[error("compression error: {0}")]
    Compression(String),

    /// Blocking task panicked or was cancelled
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl StoreError {
    /// Check if the operation may succeed when repeated
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Io(_) | Self::Join(_))
    }

    /// Check if this is a plain miss
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::StateNotFound { .. })
    }
}

/// Result alias for persistence operations
pub type StoreResult<T> = Result<T, StoreError>;
