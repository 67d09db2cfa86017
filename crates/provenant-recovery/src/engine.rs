//! Recovery engine: applies strategy chains to classified failures
//!
//! Each strategy in a chain runs as one [`RecoveryAttempt`]. A failed
//! attempt hands over to the strategy's fallback; when the chain is
//! exhausted the engine returns [`RecoveryError::RecoveryFailed`] with every
//! attempt attached. Cancellation undoes the node changes made so far and
//! records nothing.

use crate::attempt::{attempt_key, AttemptState, RecoveryAttempt};
use crate::classifier::FailureClassifier;
use crate::config::RecoveryConfig;
use crate::error::{EngineResult, RecoveryError};
use crate::runner::StepRunner;
use dashmap::DashMap;
use provenant_checkpoint::{CheckpointError, CheckpointManager, RestoreOptions};
use provenant_dag::{DagStatus, ProvenanceStore};
use provenant_types::{
    AnalysisNode, AttemptId, CheckpointId, DagId, FailureAnalysis, FailureId, NodeId, NodeStatus,
    Precondition, RecoveryStrategy, StateMap, StepFailure, StrategyKind, SystemMetrics,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-call recovery settings
#[derive(Debug, Clone, Default)]
pub struct RecoveryOptions {
    /// Cancelling undoes the running attempt
    pub cancel: CancellationToken,
    /// Readings checked against resource preconditions
    pub system: SystemMetrics,
}

impl RecoveryOptions {
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_system(mut self, system: SystemMetrics) -> Self {
        self.system = system;
        self
    }
}

/// How a recovery ended
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    /// The node ran again and committed
    Recovered { node: AnalysisNode },
    /// The node was abandoned; these descendants are flagged incomplete
    Skipped { incomplete: Vec<NodeId> },
    /// Paused until [`RecoveryEngine::resume_manual`]
    AwaitingManual {
        attempt_id: AttemptId,
        checkpoint_id: Option<CheckpointId>,
    },
}

/// Successful or paused recovery
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryResult {
    pub failure_id: FailureId,
    pub dag_id: DagId,
    pub node_id: NodeId,
    pub outcome: RecoveryOutcome,
    pub attempts: Vec<RecoveryAttempt>,
    /// Checkpoint restored, or the one to resume from when paused
    pub checkpoint_id: Option<CheckpointId>,
    /// State produced by the successful run
    pub state: Option<StateMap>,
}

impl RecoveryResult {
    #[inline]
    #[must_use]
    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    #[must_use]
    pub fn is_recovered(&self) -> bool {
        matches!(self.outcome, RecoveryOutcome::Recovered { .. })
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        matches!(self.outcome, RecoveryOutcome::AwaitingManual { .. })
    }
}

/// A manual attempt waiting for an operator
#[derive(Debug, Clone)]
struct Paused {
    analysis: FailureAnalysis,
    attempt: RecoveryAttempt,
}

enum AttemptOutcome {
    Resolved {
        outcome: RecoveryOutcome,
        state: Option<StateMap>,
    },
    /// `escalate` skips the rest of the chain and goes to manual
    Failed { escalate: bool },
    Cancelled,
}

enum Rerun {
    Committed(AnalysisNode, StateMap),
    Failed(StepFailure),
    Cancelled,
}

/// Strategy-driven recovery of failed analysis steps
pub struct RecoveryEngine {
    provenance: Arc<ProvenanceStore>,
    checkpoints: Arc<CheckpointManager>,
    classifier: Arc<FailureClassifier>,
    runner: Arc<dyn StepRunner>,
    config: RecoveryConfig,
    paused: DashMap<AttemptId, Paused>,
}

impl std::fmt::Debug for RecoveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryEngine")
            .field("config", &self.config)
            .field("paused", &self.paused.len())
            .finish_non_exhaustive()
    }
}

impl RecoveryEngine {
    #[must_use]
    pub fn new(
        provenance: Arc<ProvenanceStore>,
        checkpoints: Arc<CheckpointManager>,
        classifier: Arc<FailureClassifier>,
        runner: Arc<dyn StepRunner>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            provenance,
            checkpoints,
            classifier,
            runner,
            config,
            paused: DashMap::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn classifier(&self) -> &Arc<FailureClassifier> {
        &self.classifier
    }

    /// Manual attempts of a DAG waiting for an operator
    #[must_use]
    pub fn awaiting_manual(&self, dag_id: DagId) -> Vec<RecoveryAttempt> {
        let mut waiting: Vec<_> = self
            .paused
            .iter()
            .filter(|p| p.attempt.dag_id == dag_id)
            .map(|p| p.attempt.clone())
            .collect();
        waiting.sort_by_key(|a| a.started_at);
        waiting
    }

    /// Read a persisted attempt record
    ///
    /// # Errors
    /// Returns error if the record is missing or undecodable
    pub async fn load_attempt(&self, attempt_id: AttemptId) -> EngineResult<RecoveryAttempt> {
        let (bytes, _) = self
            .checkpoints
            .persistence()
            .retrieve(&attempt_key(attempt_id), &[self.config.record_level])
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Recover from a classified failure
    ///
    /// `checkpoint_id` names the checkpoint to roll back to; without one the
    /// nearest checkpoint of the node or an ancestor is used.
    ///
    /// # Errors
    /// - `RecoveryFailed` once the strategy chain is exhausted
    /// - `Cancelled` if `options.cancel` fired; node and DAG status are restored
    /// - provenance, checkpoint or storage errors, after the same restoration
    #[tracing::instrument(
        skip(self, analysis, options),
        fields(dag_id = %analysis.dag_id(), node_id = %analysis.node_id(), category = %analysis.category)
    )]
    pub async fn execute_recovery(
        &self,
        analysis: &FailureAnalysis,
        checkpoint_id: Option<CheckpointId>,
        options: RecoveryOptions,
    ) -> EngineResult<RecoveryResult> {
        let dag_id = analysis.dag_id();
        let node_id = analysis.node_id();

        let prior_status = self.provenance.snapshot(dag_id)?.status();
        self.provenance.set_status(dag_id, DagStatus::Recovering).await?;
        if let Err(e) = self.ensure_failed(dag_id, node_id).await {
            self.restore_dag_status(dag_id, prior_status).await;
            return Err(e);
        }
        let captured = vec![self.provenance.get_node(dag_id, node_id)?];

        let mut strategy = analysis.recommended_strategy.clone();
        let mut attempts = Vec::new();
        loop {
            let mut attempt = RecoveryAttempt::start(
                analysis.id,
                dag_id,
                node_id,
                analysis.category,
                &strategy,
            );
            let outcome = match self
                .run_attempt(&strategy, &mut attempt, checkpoint_id, &options)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.compensate(dag_id, prior_status, captured).await;
                    return Err(e);
                }
            };

            match outcome {
                AttemptOutcome::Cancelled => {
                    self.compensate(dag_id, prior_status, captured).await;
                    metrics::counter!("provenant_recoveries_cancelled_total").increment(1);
                    tracing::info!("recovery cancelled, node state restored");
                    return Err(RecoveryError::Cancelled {
                        dag: dag_id,
                        node: node_id,
                    });
                }
                AttemptOutcome::Resolved { outcome, state } => {
                    let used_checkpoint = attempt.checkpoint_id.or(checkpoint_id);
                    attempts.push(attempt);
                    self.record_attempts(&attempts).await?;

                    if let RecoveryOutcome::AwaitingManual { attempt_id, .. } = &outcome {
                        if let Some(last) = attempts.last() {
                            self.paused.insert(
                                *attempt_id,
                                Paused {
                                    analysis: analysis.clone(),
                                    attempt: last.clone(),
                                },
                            );
                        }
                        tracing::warn!(%attempt_id, "recovery paused for manual intervention");
                    } else {
                        self.provenance.set_status(dag_id, DagStatus::Running).await?;
                        tracing::info!(attempts = attempts.len(), "recovery succeeded");
                    }

                    return Ok(RecoveryResult {
                        failure_id: analysis.id,
                        dag_id,
                        node_id,
                        outcome,
                        attempts,
                        checkpoint_id: used_checkpoint,
                        state,
                    });
                }
                AttemptOutcome::Failed { escalate } => {
                    tracing::warn!(
                        kind = %attempt.kind,
                        reason = attempt.error_message.as_deref().unwrap_or("unknown"),
                        escalate,
                        "recovery attempt failed"
                    );
                    attempts.push(attempt);
                    let next = if escalate {
                        Some(RecoveryStrategy::manual())
                    } else {
                        strategy.take_fallback()
                    };
                    if let Some(next) = next {
                        strategy = next;
                        continue;
                    }

                    self.record_attempts(&attempts).await?;
                    self.provenance.set_status(dag_id, DagStatus::Failed).await?;
                    let resumable = match checkpoint_id {
                        Some(id) => Some(id),
                        None => self.nearest_checkpoint(dag_id, node_id).await?,
                    };
                    tracing::error!(attempts = attempts.len(), "recovery exhausted every strategy");
                    return Err(RecoveryError::RecoveryFailed {
                        analysis: Box::new(analysis.clone()),
                        attempts,
                        checkpoint_id: resumable,
                    });
                }
            }
        }
    }

    /// Resume a paused manual recovery from `checkpoint_id`
    ///
    /// The checkpoint must belong to the paused node or one of its
    /// ancestors. The node is re-executed from the restored state.
    ///
    /// # Errors
    /// - `NothingToResume` if no paused recovery matches the checkpoint
    /// - `RecoveryFailed` if the re-run fails
    /// - `Cancelled` if `options.cancel` fired; the recovery stays paused
    #[tracing::instrument(skip(self, options))]
    pub async fn resume_manual(
        &self,
        checkpoint_id: CheckpointId,
        options: RecoveryOptions,
    ) -> EngineResult<RecoveryResult> {
        let checkpoint = self.checkpoints.load_checkpoint(checkpoint_id).await?;
        let dag = self.provenance.snapshot(checkpoint.dag_id())?;
        let key = self
            .paused
            .iter()
            .filter(|p| p.analysis.dag_id() == checkpoint.dag_id())
            .find(|p| {
                let node = p.analysis.node_id();
                node == checkpoint.node_id() || dag.ancestors(node).contains(&checkpoint.node_id())
            })
            .map(|p| *p.key());
        let Some((attempt_id, paused)) = key.and_then(|k| self.paused.remove(&k)) else {
            return Err(RecoveryError::NothingToResume(checkpoint_id));
        };

        let dag_id = paused.analysis.dag_id();
        let node_id = paused.analysis.node_id();
        let captured = vec![self.provenance.get_node(dag_id, node_id)?];

        let restored = match self
            .checkpoints
            .restore(checkpoint_id, RestoreOptions::default())
            .await
        {
            Ok(restored) => restored,
            Err(e) => {
                self.paused.insert(attempt_id, paused);
                return Err(e.into());
            }
        };

        let mut attempt = paused.attempt.clone();
        attempt.checkpoint_id = Some(checkpoint_id);
        let rerun = match self
            .rerun(dag_id, node_id, Some(&restored.state), true, &mut attempt, &options)
            .await
        {
            Ok(rerun) => rerun,
            Err(e) => {
                self.compensate(dag_id, DagStatus::Recovering, captured).await;
                self.paused.insert(attempt_id, paused);
                return Err(e);
            }
        };

        match rerun {
            Rerun::Cancelled => {
                self.compensate(dag_id, DagStatus::Recovering, captured).await;
                self.paused.insert(attempt_id, paused);
                Err(RecoveryError::Cancelled {
                    dag: dag_id,
                    node: node_id,
                })
            }
            Rerun::Committed(node, state) => {
                attempt.transition(AttemptState::Succeeded)?;
                let attempts = vec![attempt];
                self.record_attempts(&attempts).await?;
                self.provenance.set_status(dag_id, DagStatus::Running).await?;
                tracing::info!(%dag_id, %node_id, "manual recovery resumed and succeeded");
                Ok(RecoveryResult {
                    failure_id: paused.analysis.id,
                    dag_id,
                    node_id,
                    outcome: RecoveryOutcome::Recovered { node },
                    attempts,
                    checkpoint_id: Some(checkpoint_id),
                    state: Some(state),
                })
            }
            Rerun::Failed(failure) => {
                attempt.fail(failure.to_string())?;
                let attempts = vec![attempt];
                self.record_attempts(&attempts).await?;
                self.provenance.set_status(dag_id, DagStatus::Failed).await?;
                Err(RecoveryError::RecoveryFailed {
                    analysis: Box::new(paused.analysis),
                    attempts,
                    checkpoint_id: Some(checkpoint_id),
                })
            }
        }
    }

    async fn run_attempt(
        &self,
        strategy: &RecoveryStrategy,
        attempt: &mut RecoveryAttempt,
        checkpoint_id: Option<CheckpointId>,
        options: &RecoveryOptions,
    ) -> EngineResult<AttemptOutcome> {
        if options.cancel.is_cancelled() {
            return Ok(AttemptOutcome::Cancelled);
        }
        if let Some(unmet) = self
            .unmet_precondition(strategy, attempt, checkpoint_id, &options.system)
            .await?
        {
            attempt.fail(format!("precondition not met: {unmet:?}"))?;
            self.count(attempt);
            return Ok(AttemptOutcome::Failed { escalate: false });
        }

        attempt.transition(AttemptState::for_kind(strategy.kind))?;
        let outcome = match strategy.kind {
            StrategyKind::Retry => self.retry(strategy, attempt, options).await?,
            StrategyKind::Rollback => self.rollback(attempt, checkpoint_id, options).await?,
            StrategyKind::Skip => self.skip(attempt).await?,
            StrategyKind::Manual => self.manual(attempt, checkpoint_id).await?,
        };
        if !matches!(outcome, AttemptOutcome::Cancelled) {
            self.count(attempt);
        }
        Ok(outcome)
    }

    async fn unmet_precondition(
        &self,
        strategy: &RecoveryStrategy,
        attempt: &RecoveryAttempt,
        checkpoint_id: Option<CheckpointId>,
        system: &SystemMetrics,
    ) -> EngineResult<Option<Precondition>> {
        for precondition in &strategy.preconditions {
            let met = match precondition {
                Precondition::CheckpointAvailable => {
                    checkpoint_id.is_some()
                        || self
                            .nearest_checkpoint(attempt.dag_id, attempt.node_id)
                            .await?
                            .is_some()
                }
                Precondition::NodeExists => self
                    .provenance
                    .snapshot(attempt.dag_id)?
                    .contains_node(attempt.node_id),
                Precondition::MinDiskBytes(bytes) => system.available_disk_bytes >= *bytes,
                Precondition::MinMemoryBytes(bytes) => system.available_memory_bytes >= *bytes,
            };
            if !met {
                return Ok(Some(precondition.clone()));
            }
        }
        Ok(None)
    }

    async fn retry(
        &self,
        strategy: &RecoveryStrategy,
        attempt: &mut RecoveryAttempt,
        options: &RecoveryOptions,
    ) -> EngineResult<AttemptOutcome> {
        let mut last_failure = None;
        for i in 0..strategy.max_attempts {
            if i > 0 {
                let delay = strategy.delay_for(i - 1);
                tokio::select! {
                    biased;
                    () = options.cancel.cancelled() => return Ok(AttemptOutcome::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            match self
                .rerun(attempt.dag_id, attempt.node_id, None, false, attempt, options)
                .await?
            {
                Rerun::Cancelled => return Ok(AttemptOutcome::Cancelled),
                Rerun::Committed(node, state) => {
                    attempt.transition(AttemptState::Succeeded)?;
                    return Ok(AttemptOutcome::Resolved {
                        outcome: RecoveryOutcome::Recovered { node },
                        state: Some(state),
                    });
                }
                Rerun::Failed(failure) => {
                    tracing::debug!(invocation = i + 1, error = %failure, "retry invocation failed");
                    last_failure = Some(failure);
                }
            }
        }
        let reason = last_failure.map_or_else(|| "no attempts made".to_string(), |f| f.to_string());
        attempt.fail(reason)?;
        Ok(AttemptOutcome::Failed { escalate: false })
    }

    async fn rollback(
        &self,
        attempt: &mut RecoveryAttempt,
        checkpoint_id: Option<CheckpointId>,
        options: &RecoveryOptions,
    ) -> EngineResult<AttemptOutcome> {
        let first = match checkpoint_id {
            Some(id) => Some(id),
            None => self.nearest_checkpoint(attempt.dag_id, attempt.node_id).await?,
        };
        let Some(first) = first else {
            attempt.fail("no checkpoint to roll back to")?;
            return Ok(AttemptOutcome::Failed { escalate: false });
        };

        let mut candidates = vec![first];
        match self.checkpoints.older_checkpoints(first).await {
            Ok(older) => candidates.extend(older.into_iter().map(|e| e.checkpoint_id)),
            Err(e) if e.is_integrity_failure() || matches!(e, CheckpointError::UnknownCheckpoint(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let mut restored = None;
        for candidate in candidates {
            if options.cancel.is_cancelled() {
                return Ok(AttemptOutcome::Cancelled);
            }
            match self
                .checkpoints
                .restore(candidate, RestoreOptions::default())
                .await
            {
                Ok(r) => {
                    restored = Some(r);
                    break;
                }
                Err(e) if e.is_integrity_failure() || matches!(e, CheckpointError::UnknownCheckpoint(_)) => {
                    tracing::warn!(checkpoint_id = %candidate, error = %e, "checkpoint unusable, trying an older one");
                }
                Err(e) => return Err(e.into()),
            }
        }
        let Some(restored) = restored else {
            attempt.fail("no restorable checkpoint")?;
            return Ok(AttemptOutcome::Failed { escalate: true });
        };
        attempt.checkpoint_id = Some(restored.checkpoint.id);

        match self
            .rerun(
                attempt.dag_id,
                attempt.node_id,
                Some(&restored.state),
                true,
                attempt,
                options,
            )
            .await?
        {
            Rerun::Cancelled => Ok(AttemptOutcome::Cancelled),
            Rerun::Committed(node, state) => {
                attempt.transition(AttemptState::Succeeded)?;
                Ok(AttemptOutcome::Resolved {
                    outcome: RecoveryOutcome::Recovered { node },
                    state: Some(state),
                })
            }
            Rerun::Failed(failure) => {
                attempt.fail(failure.to_string())?;
                Ok(AttemptOutcome::Failed { escalate: false })
            }
        }
    }

    async fn skip(&self, attempt: &mut RecoveryAttempt) -> EngineResult<AttemptOutcome> {
        let incomplete = self
            .provenance
            .mark_skipped(attempt.dag_id, attempt.node_id)
            .await?;
        attempt.transition(AttemptState::Succeeded)?;
        Ok(AttemptOutcome::Resolved {
            outcome: RecoveryOutcome::Skipped { incomplete },
            state: None,
        })
    }

    async fn manual(
        &self,
        attempt: &mut RecoveryAttempt,
        checkpoint_id: Option<CheckpointId>,
    ) -> EngineResult<AttemptOutcome> {
        let resumable = match checkpoint_id {
            Some(id) => Some(id),
            None => self.nearest_checkpoint(attempt.dag_id, attempt.node_id).await?,
        };
        attempt.checkpoint_id = resumable;
        Ok(AttemptOutcome::Resolved {
            outcome: RecoveryOutcome::AwaitingManual {
                attempt_id: attempt.id,
                checkpoint_id: resumable,
            },
            state: None,
        })
    }

    /// Run the node once more, committing on success
    ///
    /// With `reexecute` the node is first cleaned up and rolled back to
    /// pending re-execution, dropping its declared outputs.
    async fn rerun(
        &self,
        dag_id: DagId,
        node_id: NodeId,
        restored: Option<&StateMap>,
        reexecute: bool,
        attempt: &mut RecoveryAttempt,
        options: &RecoveryOptions,
    ) -> EngineResult<Rerun> {
        if options.cancel.is_cancelled() {
            return Ok(Rerun::Cancelled);
        }
        if reexecute {
            if let Err(failure) = self.runner.cleanup(dag_id, node_id).await {
                return Ok(Rerun::Failed(failure));
            }
            self.provenance.mark_for_reexecution(dag_id, node_id).await?;
        }
        self.provenance.restart_node(dag_id, node_id).await?;
        let node = self.provenance.get_node(dag_id, node_id)?;
        attempt.invocations += 1;

        let timeout = self.config.step_timeout();
        let result = tokio::select! {
            biased;
            () = options.cancel.cancelled() => return Ok(Rerun::Cancelled),
            r = tokio::time::timeout(timeout, self.runner.run(dag_id, &node, restored)) => {
                r.unwrap_or_else(|_| Err(StepFailure::timeout(timeout)))
            }
        };

        match result {
            Ok(output) => {
                let committed = self
                    .provenance
                    .commit_node(dag_id, node_id, Some(output.outputs))
                    .await?;
                Ok(Rerun::Committed(committed, output.state))
            }
            Err(failure) => {
                self.provenance.mark_failed(dag_id, node_id).await?;
                attempt.last_failure_category =
                    Some(self.classifier.categorize(&failure, &options.system));
                Ok(Rerun::Failed(failure))
            }
        }
    }

    async fn ensure_failed(&self, dag_id: DagId, node_id: NodeId) -> EngineResult<()> {
        let node = self.provenance.get_node(dag_id, node_id)?;
        if node.status == NodeStatus::Running {
            self.provenance.mark_failed(dag_id, node_id).await?;
        }
        Ok(())
    }

    async fn nearest_checkpoint(
        &self,
        dag_id: DagId,
        node_id: NodeId,
    ) -> EngineResult<Option<CheckpointId>> {
        Ok(self
            .checkpoints
            .nearest_checkpoint_before(dag_id, node_id)
            .await?
            .map(|e| e.checkpoint_id))
    }

    /// Persist finished attempts and feed the ledger
    async fn record_attempts(&self, attempts: &[RecoveryAttempt]) -> EngineResult<()> {
        let persistence = self.checkpoints.persistence();
        for attempt in attempts {
            persistence
                .persist(
                    &attempt_key(attempt.id),
                    serde_json::to_vec(attempt)?,
                    self.config.record_level,
                )
                .await?;
            if attempt.state.is_terminal() {
                self.classifier
                    .ledger()
                    .record(attempt.category, attempt.kind, attempt.succeeded());
            }
        }
        Ok(())
    }

    fn count(&self, attempt: &RecoveryAttempt) {
        let outcome = match attempt.state {
            AttemptState::Succeeded => "succeeded",
            AttemptState::Failed => "failed",
            _ => "paused",
        };
        metrics::counter!(
            "provenant_recovery_attempts_total",
            "kind" => attempt.kind.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }

    async fn restore_dag_status(&self, dag_id: DagId, status: DagStatus) {
        if let Err(e) = self.provenance.set_status(dag_id, status).await {
            tracing::error!(%dag_id, error = %e, "failed to restore dag status");
        }
    }

    /// Put captured nodes and the DAG status back
    async fn compensate(&self, dag_id: DagId, status: DagStatus, captured: Vec<AnalysisNode>) {
        if let Err(e) = self.provenance.revert_nodes(dag_id, captured).await {
            tracing::error!(%dag_id, error = %e, "failed to revert node state");
        }
        self.restore_dag_status(dag_id, status).await;
    }
}
