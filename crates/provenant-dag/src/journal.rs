//! Tamper-evident mutation journal
//!
//! Every structural change to a DAG is appended as a [`JournalEntry`] whose
//! hash covers the previous entry's hash (SHA-256 chain). Rewriting any
//! entry breaks every hash after it.

use crate::dag::DagStatus;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use provenant_types::{DagId, NodeId, NodeStatus};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One structural change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    DagCreated,
    NodeAdded { node: NodeId, upstream: Vec<NodeId> },
    NodeCommitted { node: NodeId, sequence: u64 },
    NodeStatusChanged {
        node: NodeId,
        from: NodeStatus,
        to: NodeStatus,
    },
    /// Compensating write after a cancelled recovery
    NodeReverted { node: NodeId, to: NodeStatus },
    MarkedIncomplete { nodes: Vec<NodeId> },
    DagStatusChanged { from: DagStatus, to: DagStatus },
    DagSealed,
}

/// Chained journal record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub dag_id: DagId,
    pub mutation: Mutation,
    pub prev_hash: [u8; 32],
    pub hash: [u8; 32],
}

/// Append-only, hash-chained journal for one DAG
#[derive(Debug, Default)]
pub struct MutationJournal {
    inner: Mutex<Vec<JournalEntry>>,
}

impl MutationJournal {
    /// Rebuild from persisted entries
    #[must_use]
    pub fn from_entries(entries: Vec<JournalEntry>) -> Self {
        Self {
            inner: Mutex::new(entries),
        }
    }

    /// Chain `mutations` after the current tail without appending them
    ///
    /// Callers hold the DAG writer lock between `prepare` and `commit`.
    #[must_use]
    pub fn prepare(&self, dag_id: DagId, mutations: Vec<Mutation>) -> Vec<JournalEntry> {
        let guard = self.inner.lock();
        let (mut sequence, mut prev_hash) = guard
            .last()
            .map_or((0, [0u8; 32]), |e| (e.sequence + 1, e.hash));

        mutations
            .into_iter()
            .map(|mutation| {
                let mut entry = JournalEntry {
                    sequence,
                    timestamp: Utc::now(),
                    dag_id,
                    mutation,
                    prev_hash,
                    hash: [0u8; 32],
                };
                entry.hash = compute_hash(&entry);
                prev_hash = entry.hash;
                sequence += 1;
                entry
            })
            .collect()
    }

    /// Append prepared entries
    pub fn commit(&self, entries: Vec<JournalEntry>) {
        self.inner.lock().extend(entries);
    }

    #[must_use]
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.inner.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Walk the chain, returning the sequence of the first bad entry
    ///
    /// # Errors
    /// Returns the offending entry's sequence number
    pub fn verify_integrity(&self) -> Result<(), u64> {
        verify_chain(&self.inner.lock())
    }
}

/// Verify a slice of entries forms an unbroken chain from genesis
///
/// # Errors
/// Returns the offending entry's sequence number
pub fn verify_chain(entries: &[JournalEntry]) -> Result<(), u64> {
    let mut prev = [0u8; 32];
    for (i, e) in entries.iter().enumerate() {
        let position_ok = u64::try_from(i).is_ok_and(|i| i == e.sequence);
        if !position_ok || e.prev_hash != prev || e.hash != compute_hash(e) {
            return Err(e.sequence);
        }
        prev = e.hash;
    }
    Ok(())
}

fn compute_hash(entry: &JournalEntry) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(entry.sequence.to_le_bytes());
    hasher.update(entry.timestamp.timestamp_micros().to_le_bytes());
    hasher.update(entry.dag_id.0.to_bytes());
    // Mutation is a closed enum of ids and statuses; its JSON form is stable.
    hasher.update(serde_json::to_vec(&entry.mutation).unwrap_or_default());
    hasher.update([0]);
    hasher.update(entry.prev_hash);
    hasher.finalize().into()
}
