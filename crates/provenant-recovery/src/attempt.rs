//! Recovery attempts and their lifecycle

use crate::error::RecoveryError;
use chrono::{DateTime, Utc};
use provenant_types::{
    AttemptId, CheckpointId, DagId, FailureCategory, FailureId, NodeId, RecoveryStrategy,
    StrategyId, StrategyKind,
};
use serde::{Deserialize, Serialize};

/// Storage key of an attempt record
#[must_use]
pub fn attempt_key(id: AttemptId) -> String {
    format!("{}/{id}", AttemptId::PREFIX)
}

/// Lifecycle of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Pending,
    Retrying,
    RollingBack,
    Skipping,
    AwaitingManual,
    Succeeded,
    Failed,
}

impl AttemptState {
    /// Working state for a strategy kind
    #[must_use]
    pub fn for_kind(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::Retry => Self::Retrying,
            StrategyKind::Rollback => Self::RollingBack,
            StrategyKind::Skip => Self::Skipping,
            StrategyKind::Manual => Self::AwaitingManual,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// States reachable from `from` in one step
#[must_use]
pub fn allowed_attempt_transitions(from: AttemptState) -> &'static [AttemptState] {
    use AttemptState::{AwaitingManual, Failed, Pending, RollingBack, Retrying, Skipping, Succeeded};
    match from {
        Pending => &[Retrying, RollingBack, Skipping, AwaitingManual, Failed],
        Retrying | RollingBack | Skipping | AwaitingManual => &[Succeeded, Failed],
        Succeeded | Failed => &[],
    }
}

/// One strategy application, stored at `recovery/{attempt_id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub id: AttemptId,
    pub failure_id: FailureId,
    pub dag_id: DagId,
    pub node_id: NodeId,
    pub category: FailureCategory,
    pub strategy_id: StrategyId,
    pub kind: StrategyKind,
    pub checkpoint_id: Option<CheckpointId>,
    pub state: AttemptState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Step invocations made
    pub invocations: u32,
    pub error_message: Option<String>,
    /// Category of the last step failure seen during the attempt
    pub last_failure_category: Option<FailureCategory>,
}

impl RecoveryAttempt {
    #[must_use]
    pub fn start(
        failure_id: FailureId,
        dag_id: DagId,
        node_id: NodeId,
        category: FailureCategory,
        strategy: &RecoveryStrategy,
    ) -> Self {
        Self {
            id: AttemptId::new(),
            failure_id,
            dag_id,
            node_id,
            category,
            strategy_id: strategy.id,
            kind: strategy.kind,
            checkpoint_id: None,
            state: AttemptState::Pending,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            invocations: 0,
            error_message: None,
            last_failure_category: None,
        }
    }

    /// Move to `to`
    ///
    /// # Errors
    /// `IllegalAttemptTransition` if `to` is not reachable from the current state
    pub fn transition(&mut self, to: AttemptState) -> Result<(), RecoveryError> {
        if !allowed_attempt_transitions(self.state).contains(&to) {
            return Err(RecoveryError::IllegalAttemptTransition {
                attempt: self.id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        if to.is_terminal() {
            let now = Utc::now();
            self.finished_at = Some(now);
            self.duration_ms = u64::try_from((now - self.started_at).num_milliseconds()).ok();
        }
        Ok(())
    }

    /// Fail with a reason, from whatever non-terminal state
    ///
    /// # Errors
    /// `IllegalAttemptTransition` if already terminal
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), RecoveryError> {
        self.error_message = Some(reason.into());
        self.transition(AttemptState::Failed)
    }

    #[inline]
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.state == AttemptState::Succeeded
    }
}
