//! Error types for the provenance store

use crate::dag::DagStatus;
use provenant_store::StoreError;
use provenant_types::{DagId, ElementId, NodeId, NodeStatus};

/// Provenance store errors
#[derive(Debug, thiserror::Error)]
pub enum ProvenanceError {
    #[error("unknown dag: {0}")]
    UnknownDag(DagId),

    #[error("unknown node {node} in dag {dag}")]
    UnknownNode { dag: DagId, node: NodeId },

    /// An upstream id passed to `add_node` is not in the DAG
    #[error("unknown upstream node {upstream} in dag {dag}")]
    UnknownUpstream { dag: DagId, upstream: NodeId },

    #[error("node {node} already exists in dag {dag}")]
    DuplicateNode { dag: DagId, node: NodeId },

    /// The DAG is completed and accepts no further mutation
    #[error("dag {0} is sealed")]
    DagSealed(DagId),

    #[error("illegal node transition for {node}: {from:?} -> {to:?}")]
    IllegalTransition {
        node: NodeId,
        from: NodeStatus,
        to: NodeStatus,
    },

    /// A node cannot commit before its producers
    #[error("node {node} cannot commit: upstream {upstream} is {status:?}")]
    UpstreamNotCommitted {
        node: NodeId,
        upstream: NodeId,
        status: NodeStatus,
    },

    #[error("illegal dag transition for {dag}: {from:?} -> {to:?}")]
    IllegalDagTransition {
        dag: DagId,
        from: DagStatus,
        to: DagStatus,
    },

    /// A node tried to write an element owned by another node without
    /// consuming it
    #[error("element {element} is owned by node {owner}; node {writer} does not consume it")]
    ElementConflict {
        element: ElementId,
        owner: NodeId,
        writer: NodeId,
    },

    /// The persisted mutation journal does not verify
    #[error("journal integrity violation in dag {dag} at entry {sequence}")]
    JournalIntegrity { dag: DagId, sequence: u64 },

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProvenanceError {
    /// Check if the failure is a storage hiccup worth repeating
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_retryable())
    }

    /// Check if persisted data failed verification
    #[inline]
    #[must_use]
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::JournalIntegrity { .. } | Self::Serialization(_))
    }
}

/// Result alias for provenance operations
pub type ProvenanceResult<T> = Result<T, ProvenanceError>;
