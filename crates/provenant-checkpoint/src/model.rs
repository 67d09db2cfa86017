//! Checkpoint records and restore results

use crate::tiering::Placement;
use chrono::{DateTime, Utc};
use provenant_store::StorageLevel;
use provenant_types::{
    CheckpointId, ContentHash, DagId, NodeId, RecoveryStrategy, SnapshotId, StateMap,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Granularity of a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointLevel {
    /// Whole-analysis state
    Analysis,
    /// State after one committed node
    DagNode,
    /// One partition of a node's data
    DataPartition,
    /// A single element
    Element,
}

impl CheckpointLevel {
    /// Strategy recorded with a checkpoint when the caller names none
    ///
    /// Coarse checkpoints are rollback points; a partition or element can
    /// simply be fetched again.
    #[must_use]
    pub fn default_recovery_strategy(self) -> RecoveryStrategy {
        match self {
            Self::Analysis | Self::DagNode => RecoveryStrategy::rollback(),
            Self::DataPartition | Self::Element => {
                RecoveryStrategy::retry(3, Duration::from_secs(1))
            }
        }
    }
}

impl fmt::Display for CheckpointLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Analysis => "analysis",
            Self::DagNode => "dag_node",
            Self::DataPartition => "data_partition",
            Self::Element => "element",
        };
        f.write_str(name)
    }
}

/// Expected read frequency of a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessFrequency {
    High,
    #[default]
    Medium,
    Low,
}

/// One checkpoint stream: checkpoints of the same target supersede each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointTarget {
    pub dag_id: DagId,
    pub node_id: NodeId,
    pub level: CheckpointLevel,
}

/// DAG position captured with a checkpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointDependencies {
    /// Ancestors already committed
    pub completed: Vec<NodeId>,
    /// Ancestors not yet committed
    pub pending: Vec<NodeId>,
    /// Descendants that would be affected by restoring
    pub downstream_affected: Vec<NodeId>,
}

/// How the payload snapshot is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SnapshotRef {
    Full { snapshot: SnapshotId },
    Incremental {
        snapshot: SnapshotId,
        parent: SnapshotId,
        /// Diffs between this snapshot and its nearest full ancestor
        depth: u32,
    },
}

impl SnapshotRef {
    #[must_use]
    pub fn snapshot_id(&self) -> SnapshotId {
        match self {
            Self::Full { snapshot } | Self::Incremental { snapshot, .. } => *snapshot,
        }
    }

    #[must_use]
    pub fn depth(&self) -> u32 {
        match self {
            Self::Full { .. } => 0,
            Self::Incremental { depth, .. } => *depth,
        }
    }
}

/// What a checkpoint captures: the step's execution state and the partial
/// results it has produced so far
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPayload {
    pub state: StateMap,
    #[serde(default)]
    pub partial_results: StateMap,
}

impl CheckpointPayload {
    #[must_use]
    pub fn new(state: StateMap) -> Self {
        Self {
            state,
            partial_results: StateMap::new(),
        }
    }

    #[must_use]
    pub fn with_partial_results(mut self, partial_results: StateMap) -> Self {
        self.partial_results = partial_results;
        self
    }

    /// Key holding a non-finite float, if any
    #[must_use]
    pub fn unencodable_key(&self) -> Option<&str> {
        self.state
            .iter()
            .chain(&self.partial_results)
            .find(|(_, v)| !v.is_encodable())
            .map(|(k, _)| k.as_str())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.is_empty() && self.partial_results.is_empty()
    }
}

impl From<StateMap> for CheckpointPayload {
    fn from(state: StateMap) -> Self {
        Self::new(state)
    }
}

/// Checkpoint record, stored at `checkpoint/{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub target: CheckpointTarget,
    pub created_at: DateTime<Utc>,
    /// Digest of the full reconstructed payload
    pub content_hash: ContentHash,
    pub snapshot: SnapshotRef,
    pub placement: Placement,
    pub record_level: StorageLevel,
    pub dependencies: CheckpointDependencies,
    pub state_keys: usize,
    pub partial_result_keys: usize,
    /// Strategy to apply when recovering from this checkpoint
    pub recovery_strategy: RecoveryStrategy,
    pub retention_secs: u64,
    pub access: AccessFrequency,
}

impl Checkpoint {
    #[inline]
    #[must_use]
    pub fn dag_id(&self) -> DagId {
        self.target.dag_id
    }

    #[inline]
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.target.node_id
    }

    #[inline]
    #[must_use]
    pub fn level(&self) -> CheckpointLevel {
        self.target.level
    }
}

/// Per-call checkpoint settings
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointOptions {
    pub retention: Duration,
    pub access: AccessFrequency,
    /// Always write a full snapshot
    pub force_full: bool,
    /// Falls back to [`CheckpointLevel::default_recovery_strategy`]
    pub recovery_strategy: Option<RecoveryStrategy>,
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 60 * 60),
            access: AccessFrequency::Medium,
            force_full: false,
            recovery_strategy: None,
        }
    }
}

impl CheckpointOptions {
    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    #[must_use]
    pub fn with_access(mut self, access: AccessFrequency) -> Self {
        self.access = access;
        self
    }

    #[must_use]
    pub fn full(mut self) -> Self {
        self.force_full = true;
        self
    }

    #[must_use]
    pub fn with_recovery_strategy(mut self, strategy: RecoveryStrategy) -> Self {
        self.recovery_strategy = Some(strategy);
        self
    }
}

/// Restore settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Levels to try for the payload before the recorded placement
    pub preferred_levels: Vec<StorageLevel>,
}

/// State recovered from a checkpoint
#[derive(Debug, Clone, PartialEq)]
pub struct RestorationResult {
    pub checkpoint: Checkpoint,
    pub state: StateMap,
    pub partial_results: StateMap,
    /// Snapshots read, full snapshot first
    pub chain: Vec<SnapshotId>,
    pub served_from: StorageLevel,
}

impl RestorationResult {
    #[must_use]
    pub fn completed_nodes(&self) -> &[NodeId] {
        &self.checkpoint.dependencies.completed
    }

    #[must_use]
    pub fn pending_nodes(&self) -> &[NodeId] {
        &self.checkpoint.dependencies.pending
    }

    #[must_use]
    pub fn recovery_strategy(&self) -> &RecoveryStrategy {
        &self.checkpoint.recovery_strategy
    }
}
