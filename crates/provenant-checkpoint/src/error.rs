//! Error types for the checkpoint manager

use crate::snapshot::{BlobIntegrityError, DiffError};
use provenant_dag::ProvenanceError;
use provenant_store::StoreError;
use provenant_types::{CheckpointId, DagId, NodeId, NodeStatus, SnapshotId};

/// Checkpoint manager errors
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("unknown checkpoint: {0}")]
    UnknownCheckpoint(CheckpointId),

    /// Stored payload failed verification or could not be decoded
    #[error("checkpoint {checkpoint} is corrupt: {reason}")]
    CheckpointCorruption {
        checkpoint: CheckpointId,
        reason: String,
    },

    /// An incremental snapshot whose parent is gone
    #[error("snapshot {snapshot} references missing parent {parent}")]
    DanglingSnapshot {
        snapshot: SnapshotId,
        parent: SnapshotId,
    },

    /// The target node is not in a state that can be checkpointed
    #[error("node {node} in dag {dag} cannot be checkpointed while {status:?}")]
    InconsistentState {
        dag: DagId,
        node: NodeId,
        status: NodeStatus,
    },

    /// State contains a value the record format cannot carry
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("provenance error: {0}")]
    Provenance(#[from] ProvenanceError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CheckpointError {
    pub(crate) fn corrupt(checkpoint: CheckpointId, reason: impl ToString) -> Self {
        Self::CheckpointCorruption {
            checkpoint,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn from_blob(checkpoint: CheckpointId, err: &BlobIntegrityError) -> Self {
        Self::corrupt(checkpoint, err)
    }

    pub(crate) fn from_diff(checkpoint: CheckpointId, snapshot: SnapshotId, err: &DiffError) -> Self {
        Self::corrupt(checkpoint, format!("snapshot {snapshot}: {err}"))
    }

    /// Check if stored data failed verification
    #[inline]
    #[must_use]
    pub fn is_integrity_failure(&self) -> bool {
        match self {
            Self::CheckpointCorruption { .. } | Self::DanglingSnapshot { .. } => true,
            Self::Provenance(e) => e.is_integrity_failure(),
            _ => false,
        }
    }

    /// Check if the operation may succeed when repeated
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::Provenance(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Result alias for checkpoint operations
pub type CheckpointResult<T> = Result<T, CheckpointError>;
