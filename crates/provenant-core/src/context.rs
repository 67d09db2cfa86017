//! Per-analysis session handle
//!
//! A [`ProvenanceContext`] is created by [`Orchestrator::start_analysis`] or
//! [`Orchestrator::resume`] and passed to every facade call for that
//! analysis. Completing the analysis consumes it. Clones share state, so a
//! clone held elsewhere can cancel a running recovery.
//!
//! [`Orchestrator::start_analysis`]: crate::Orchestrator::start_analysis
//! [`Orchestrator::resume`]: crate::Orchestrator::resume

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use provenant_types::{DagId, NodeId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct Session {
    recovery: CancellationToken,
    failures: HashMap<NodeId, u32>,
}

/// Handle for one analysis run
#[derive(Debug, Clone)]
pub struct ProvenanceContext {
    dag_id: DagId,
    started_at: DateTime<Utc>,
    session: Arc<Mutex<Session>>,
}

impl ProvenanceContext {
    pub(crate) fn new(dag_id: DagId) -> Self {
        Self {
            dag_id,
            started_at: Utc::now(),
            session: Arc::new(Mutex::new(Session::default())),
        }
    }

    #[inline]
    #[must_use]
    pub fn dag_id(&self) -> DagId {
        self.dag_id
    }

    #[inline]
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Failures reported for `node_id` so far
    #[must_use]
    pub fn failure_count(&self, node_id: NodeId) -> u32 {
        self.session
            .lock()
            .failures
            .get(&node_id)
            .copied()
            .unwrap_or(0)
    }

    /// Count a failure; returns the number of earlier ones
    pub(crate) fn record_failure(&self, node_id: NodeId) -> u32 {
        let mut session = self.session.lock();
        let count = session.failures.entry(node_id).or_insert(0);
        let earlier = *count;
        *count += 1;
        earlier
    }

    /// Token for the next recovery of this analysis
    pub(crate) fn recovery_token(&self) -> CancellationToken {
        self.session.lock().recovery.clone()
    }

    /// Cancel the running recovery, if any; later recoveries get a fresh token
    pub fn cancel_recovery(&self) {
        let mut session = self.session.lock();
        session.recovery.cancel();
        session.recovery = CancellationToken::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_cancellation() {
        let ctx = ProvenanceContext::new(DagId::new());
        let token = ctx.recovery_token();
        let remote = ctx.clone();

        remote.cancel_recovery();
        assert!(token.is_cancelled());
        assert!(!ctx.recovery_token().is_cancelled());
    }

    #[test]
    fn failures_are_counted_per_node() {
        let ctx = ProvenanceContext::new(DagId::new());
        let node = NodeId::new();
        assert_eq!(ctx.record_failure(node), 0);
        assert_eq!(ctx.record_failure(node), 1);
        assert_eq!(ctx.failure_count(node), 2);
        assert_eq!(ctx.failure_count(NodeId::new()), 0);
    }
}
