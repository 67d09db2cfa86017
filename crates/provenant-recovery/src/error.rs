//! Error types for classification and recovery

use crate::attempt::{AttemptState, RecoveryAttempt};
use provenant_checkpoint::CheckpointError;
use provenant_dag::ProvenanceError;
use provenant_store::StoreError;
use provenant_types::{AttemptId, CheckpointId, DagId, FailureAnalysis, NodeId};

/// Recovery errors
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// Every strategy in the chain failed
    #[error(
        "recovery failed for node {} in dag {} ({}) after {} attempt(s)",
        analysis.node_id(),
        analysis.dag_id(),
        analysis.category,
        attempts.len()
    )]
    RecoveryFailed {
        analysis: Box<FailureAnalysis>,
        attempts: Vec<RecoveryAttempt>,
        /// Checkpoint an operator can resume from
        checkpoint_id: Option<CheckpointId>,
    },

    /// The attempt was cancelled and its effects undone
    #[error("recovery of node {node} in dag {dag} was cancelled")]
    Cancelled { dag: DagId, node: NodeId },

    #[error("illegal attempt transition for {attempt}: {from:?} -> {to:?}")]
    IllegalAttemptTransition {
        attempt: AttemptId,
        from: AttemptState,
        to: AttemptState,
    },

    /// No paused recovery matches the checkpoint
    #[error("no recovery is waiting on checkpoint {0}")]
    NothingToResume(CheckpointId),

    /// The configured rate-limit pattern does not compile
    #[error("invalid rate-limit pattern: {0}")]
    InvalidPattern(String),

    #[error("provenance error: {0}")]
    Provenance(#[from] ProvenanceError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RecoveryError {
    /// Check if the chain was exhausted
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RecoveryFailed { .. })
    }

    /// Check if the operation may succeed when repeated
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::Provenance(e) => e.is_retryable(),
            Self::Checkpoint(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Attempts made before the error, empty unless the chain was exhausted
    #[must_use]
    pub fn attempts(&self) -> &[RecoveryAttempt] {
        match self {
            Self::RecoveryFailed { attempts, .. } => attempts,
            _ => &[],
        }
    }
}

/// Result alias for classifier and engine operations
pub type EngineResult<T> = Result<T, RecoveryError>;
