//! Per-DAG checkpoint index, stored at `catalog/{dag_id}`
//!
//! Entries are kept in creation order. A new checkpoint of a target marks the
//! previous one superseded; superseded checkpoints stay restorable.

use crate::model::{Checkpoint, CheckpointLevel, CheckpointTarget};
use chrono::{DateTime, Utc};
use provenant_store::StorageLevel;
use provenant_types::{CheckpointId, DagId, NodeId};
use serde::{Deserialize, Serialize};

/// Storage key of a DAG's catalog
#[must_use]
pub fn catalog_key(dag_id: DagId) -> String {
    format!("catalog/{dag_id}")
}

/// One indexed checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub checkpoint_id: CheckpointId,
    pub target: CheckpointTarget,
    pub created_at: DateTime<Utc>,
    pub record_level: StorageLevel,
    pub superseded_by: Option<CheckpointId>,
}

impl CatalogEntry {
    #[must_use]
    pub fn for_checkpoint(checkpoint: &Checkpoint) -> Self {
        Self {
            checkpoint_id: checkpoint.id,
            target: checkpoint.target,
            created_at: checkpoint.created_at,
            record_level: checkpoint.record_level,
            superseded_by: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.superseded_by.is_none()
    }
}

/// Checkpoint index of one DAG
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointCatalog {
    pub dag_id: DagId,
    pub entries: Vec<CatalogEntry>,
}

impl CheckpointCatalog {
    #[must_use]
    pub fn new(dag_id: DagId) -> Self {
        Self {
            dag_id,
            entries: Vec::new(),
        }
    }

    /// Append `entry`, superseding the current entry of the same target
    pub fn record(&mut self, entry: CatalogEntry) {
        for existing in &mut self.entries {
            if existing.target == entry.target && existing.is_current() {
                existing.superseded_by = Some(entry.checkpoint_id);
            }
        }
        self.entries.push(entry);
    }

    #[must_use]
    pub fn get(&self, checkpoint_id: CheckpointId) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.checkpoint_id == checkpoint_id)
    }

    /// Most recent checkpoint of the DAG
    #[must_use]
    pub fn latest(&self) -> Option<&CatalogEntry> {
        self.entries.last()
    }

    /// Most recent checkpoint of `node`, any level unless one is given
    #[must_use]
    pub fn latest_for(&self, node: NodeId, level: Option<CheckpointLevel>) -> Option<&CatalogEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.target.node_id == node && level.map_or(true, |l| e.target.level == l))
    }

    /// Checkpoints of the same target created before `checkpoint_id`, newest first
    #[must_use]
    pub fn older_than(&self, checkpoint_id: CheckpointId) -> Vec<&CatalogEntry> {
        let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.checkpoint_id == checkpoint_id)
        else {
            return Vec::new();
        };
        let target = self.entries[pos].target;
        self.entries[..pos]
            .iter()
            .rev()
            .filter(|e| e.target == target)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(target: CheckpointTarget) -> CatalogEntry {
        CatalogEntry {
            checkpoint_id: CheckpointId::new(),
            target,
            created_at: Utc::now(),
            record_level: StorageLevel::Database,
            superseded_by: None,
        }
    }

    #[test]
    fn newer_checkpoint_supersedes_same_target_only() {
        let dag_id = DagId::new();
        let a = CheckpointTarget {
            dag_id,
            node_id: NodeId::new(),
            level: CheckpointLevel::DagNode,
        };
        let b = CheckpointTarget {
            node_id: NodeId::new(),
            ..a
        };

        let mut catalog = CheckpointCatalog::new(dag_id);
        let first = entry(a);
        let other = entry(b);
        let second = entry(a);
        catalog.record(first.clone());
        catalog.record(other.clone());
        catalog.record(second.clone());

        assert_eq!(
            catalog.get(first.checkpoint_id).unwrap().superseded_by,
            Some(second.checkpoint_id)
        );
        assert!(catalog.get(other.checkpoint_id).unwrap().is_current());
        assert_eq!(catalog.latest().unwrap().checkpoint_id, second.checkpoint_id);

        let older: Vec<_> = catalog
            .older_than(second.checkpoint_id)
            .into_iter()
            .map(|e| e.checkpoint_id)
            .collect();
        assert_eq!(older, vec![first.checkpoint_id]);
        assert_eq!(
            catalog.latest_for(b.node_id, None).unwrap().checkpoint_id,
            other.checkpoint_id
        );
    }
}
