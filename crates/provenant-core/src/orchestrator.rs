//! Orchestrator facade
//!
//! Composes the provenance store, checkpoint manager, failure classifier and
//! recovery engine behind the calls an orchestration layer makes while it
//! runs an analysis:
//! - `start_analysis` / `complete_analysis` bracket a run
//! - `record_step`, or `begin_step` + `complete_step`, register steps and
//!   checkpoint each commit at the configured level
//! - `put_state` and `put_partial_result` stage what `checkpoint` persists
//! - `on_failure` classifies a step failure and recovers from it
//! - `resume` picks a run back up after a restart
//! - `abandon_analysis` ends a run that will not complete

use crate::config::ProvenantConfig;
use crate::context::ProvenanceContext;
use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use provenant_checkpoint::{
    CheckpointLevel, CheckpointManager, CheckpointOptions, CheckpointPayload, RestorationResult,
    RestoreOptions,
};
use provenant_dag::{AnalysisDag, DagStatus, ProvenanceStore, TraceDirection};
use provenant_recovery::{
    FailureClassifier, RecoveryEngine, RecoveryOptions, RecoveryResult, StepRunner,
    StrategyLedger,
};
use provenant_store::StatePersistence;
use provenant_types::{
    AnalysisNode, CheckpointId, DagId, DataReference, ElementId, ExecutionContext, NodeId,
    NodeStatus, StateMap, StepFailure, SystemMetrics, TracedReference, Value,
};
use std::sync::Arc;

/// What [`Orchestrator::resume`] found after a restart
#[derive(Debug, Clone)]
pub struct ResumeReport {
    pub context: ProvenanceContext,
    pub dag: Arc<AnalysisDag>,
    /// Latest usable checkpoint, restored
    pub checkpoint: Option<RestorationResult>,
    /// Committed nodes, in topological order
    pub completed: Vec<NodeId>,
    /// Nodes still to run, in topological order
    pub pending: Vec<NodeId>,
    /// Nodes that were running when the process stopped; now failed
    pub interrupted: Vec<NodeId>,
}

impl ResumeReport {
    /// State restored for the checkpointed node
    #[must_use]
    pub fn restored_state(&self) -> Option<&StateMap> {
        self.checkpoint.as_ref().map(|c| &c.state)
    }

    /// Partial results restored for the checkpointed node
    #[must_use]
    pub fn restored_partial_results(&self) -> Option<&StateMap> {
        self.checkpoint.as_ref().map(|c| &c.partial_results)
    }
}

/// Facade over provenance, checkpoints and recovery
pub struct Orchestrator {
    config: ProvenantConfig,
    provenance: Arc<ProvenanceStore>,
    checkpoints: Arc<CheckpointManager>,
    classifier: Arc<FailureClassifier>,
    engine: RecoveryEngine,
    active: DashMap<DagId, DateTime<Utc>>,
    staged: DashMap<(DagId, NodeId), CheckpointPayload>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("active", &self.active.len())
            .field("staged", &self.staged.len())
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Orchestrator over the tiers described by `config.storage`
    ///
    /// # Errors
    /// Returns error if the config is invalid or a tier cannot be opened
    pub fn open(config: ProvenantConfig, runner: Arc<dyn StepRunner>) -> CoreResult<Self> {
        config.validate()?;
        let persistence = StatePersistence::open(&config.storage)?;
        Self::with_persistence(config, persistence, runner)
    }

    /// Orchestrator whose every tier lives in memory
    ///
    /// # Errors
    /// Returns error if the config is invalid
    pub fn ephemeral(config: ProvenantConfig, runner: Arc<dyn StepRunner>) -> CoreResult<Self> {
        Self::with_persistence(config, StatePersistence::ephemeral(), runner)
    }

    /// # Errors
    /// Returns error if the config is invalid
    pub fn with_persistence(
        config: ProvenantConfig,
        persistence: StatePersistence,
        runner: Arc<dyn StepRunner>,
    ) -> CoreResult<Self> {
        config.validate()?;
        let provenance = Arc::new(
            ProvenanceStore::new()
                .with_persistence(persistence.clone(), config.checkpoint.record_level),
        );
        let checkpoints = Arc::new(CheckpointManager::new(
            Arc::clone(&provenance),
            persistence,
            config.checkpoint.clone(),
        ));
        let classifier = Arc::new(FailureClassifier::new(
            config.classifier.clone(),
            Arc::clone(&provenance),
            Arc::new(StrategyLedger::new()),
        )?);
        let engine = RecoveryEngine::new(
            Arc::clone(&provenance),
            Arc::clone(&checkpoints),
            Arc::clone(&classifier),
            runner,
            config.recovery.clone(),
        );
        Ok(Self {
            config,
            provenance,
            checkpoints,
            classifier,
            engine,
            active: DashMap::new(),
            staged: DashMap::new(),
        })
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &ProvenantConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn provenance(&self) -> &Arc<ProvenanceStore> {
        &self.provenance
    }

    #[inline]
    #[must_use]
    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    #[inline]
    #[must_use]
    pub fn classifier(&self) -> &Arc<FailureClassifier> {
        &self.classifier
    }

    #[inline]
    #[must_use]
    pub fn engine(&self) -> &RecoveryEngine {
        &self.engine
    }

    /// Ids of analyses started or resumed and not yet completed
    #[must_use]
    pub fn active_analyses(&self) -> Vec<DagId> {
        let mut ids: Vec<_> = self.active.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    fn ensure_active(&self, ctx: &ProvenanceContext) -> CoreResult<DagId> {
        let dag_id = ctx.dag_id();
        if self.active.contains_key(&dag_id) {
            Ok(dag_id)
        } else {
            Err(CoreError::InactiveAnalysis(dag_id))
        }
    }

    /// Start an analysis over `sources`
    ///
    /// # Errors
    /// Returns error if the DAG record cannot be persisted
    #[tracing::instrument(skip(self, sources), fields(sources = sources.len()))]
    pub async fn start_analysis(&self, sources: Vec<DataReference>) -> CoreResult<ProvenanceContext> {
        let dag_id = self.provenance.create_dag(sources).await?;
        self.active.insert(dag_id, Utc::now());
        metrics::counter!("provenant_analyses_started_total").increment(1);
        tracing::info!(%dag_id, "analysis started");
        Ok(ProvenanceContext::new(dag_id))
    }

    /// Register a step that has already finished and commit it
    ///
    /// The commit is checkpointed with whatever was staged for the step; a
    /// failed checkpoint is logged and does not fail the step.
    ///
    /// # Errors
    /// Structural errors from the provenance store (`UnknownUpstream`,
    /// `DuplicateNode`, `UpstreamNotCommitted`, `DagSealed`, ...)
    pub async fn record_step(
        &self,
        ctx: &ProvenanceContext,
        node: AnalysisNode,
        upstream: &[NodeId],
    ) -> CoreResult<NodeId> {
        let dag_id = self.ensure_active(ctx)?;
        let node_id = self.provenance.add_node(dag_id, node, upstream).await?;
        self.provenance.commit_node(dag_id, node_id, None).await?;
        tracing::debug!(%dag_id, %node_id, "step recorded");
        self.checkpoint_commit(dag_id, node_id).await;
        Ok(node_id)
    }

    /// Register a step about to run; its outputs stay hidden until
    /// [`Self::complete_step`]
    ///
    /// # Errors
    /// As [`Self::record_step`]
    pub async fn begin_step(
        &self,
        ctx: &ProvenanceContext,
        node: AnalysisNode,
        upstream: &[NodeId],
    ) -> CoreResult<NodeId> {
        let dag_id = self.ensure_active(ctx)?;
        Ok(self.provenance.add_node(dag_id, node, upstream).await?)
    }

    /// Commit a running step, optionally replacing its declared outputs
    ///
    /// Checkpointed like [`Self::record_step`].
    ///
    /// # Errors
    /// `IllegalTransition` if the step is not running,
    /// `UpstreamNotCommitted` if a producer has not committed, or a storage error
    pub async fn complete_step(
        &self,
        ctx: &ProvenanceContext,
        node_id: NodeId,
        outputs: Option<Vec<DataReference>>,
    ) -> CoreResult<AnalysisNode> {
        let dag_id = self.ensure_active(ctx)?;
        let committed = self.provenance.commit_node(dag_id, node_id, outputs).await?;
        self.checkpoint_commit(dag_id, node_id).await;
        Ok(committed)
    }

    /// Checkpoint a freshly committed step at the configured level
    async fn checkpoint_commit(&self, dag_id: DagId, node_id: NodeId) -> Option<CheckpointId> {
        let level = self.config.checkpoint.checkpoint_on_commit?;
        let payload = self.staged_payload(dag_id, node_id);
        match self
            .checkpoints
            .create_checkpoint(dag_id, node_id, level, payload)
            .await
        {
            Ok(checkpoint_id) => Some(checkpoint_id),
            Err(e) => {
                metrics::counter!("provenant_commit_checkpoint_failures_total").increment(1);
                tracing::warn!(%dag_id, %node_id, %level, error = %e, "commit checkpoint failed");
                None
            }
        }
    }

    fn stage(
        &self,
        ctx: &ProvenanceContext,
        node_id: NodeId,
        put: impl FnOnce(&mut CheckpointPayload),
    ) -> CoreResult<()> {
        let dag_id = self.ensure_active(ctx)?;
        self.provenance.get_node(dag_id, node_id)?;
        let mut slot = self.staged.entry((dag_id, node_id)).or_default();
        put(slot.value_mut());
        Ok(())
    }

    /// Stage one key of a step's execution state for the next checkpoint
    ///
    /// # Errors
    /// `InactiveAnalysis`, or `UnknownNode` if the step is not registered
    pub fn put_state(
        &self,
        ctx: &ProvenanceContext,
        node_id: NodeId,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> CoreResult<()> {
        self.stage(ctx, node_id, |p| {
            p.state.insert(key.into(), value.into());
        })
    }

    /// Stage one partial result of a step for the next checkpoint
    ///
    /// Partial results are kept apart from the execution state and restored
    /// separately.
    ///
    /// # Errors
    /// As [`Self::put_state`]
    pub fn put_partial_result(
        &self,
        ctx: &ProvenanceContext,
        node_id: NodeId,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> CoreResult<()> {
        self.stage(ctx, node_id, |p| {
            p.partial_results.insert(key.into(), value.into());
        })
    }

    fn staged_payload(&self, dag_id: DagId, node_id: NodeId) -> CheckpointPayload {
        self.staged
            .get(&(dag_id, node_id))
            .map(|s| s.value().clone())
            .unwrap_or_default()
    }

    /// Execution state staged for a step
    #[must_use]
    pub fn staged_state(&self, ctx: &ProvenanceContext, node_id: NodeId) -> StateMap {
        self.staged_payload(ctx.dag_id(), node_id).state
    }

    /// Partial results staged for a step
    #[must_use]
    pub fn staged_partial_results(&self, ctx: &ProvenanceContext, node_id: NodeId) -> StateMap {
        self.staged_payload(ctx.dag_id(), node_id).partial_results
    }

    /// Checkpoint the state staged for a step
    ///
    /// # Errors
    /// Any checkpoint error; nothing is written on failure
    pub async fn checkpoint(
        &self,
        ctx: &ProvenanceContext,
        node_id: NodeId,
        level: CheckpointLevel,
    ) -> CoreResult<CheckpointId> {
        let options = self.config.checkpoint.default_options();
        self.checkpoint_with(ctx, node_id, level, options).await
    }

    /// [`Self::checkpoint`] with explicit retention, access, base and
    /// recovery strategy options
    ///
    /// # Errors
    /// Any checkpoint error; nothing is written on failure
    pub async fn checkpoint_with(
        &self,
        ctx: &ProvenanceContext,
        node_id: NodeId,
        level: CheckpointLevel,
        options: CheckpointOptions,
    ) -> CoreResult<CheckpointId> {
        let dag_id = self.ensure_active(ctx)?;
        let payload = self.staged_payload(dag_id, node_id);
        Ok(self
            .checkpoints
            .create_checkpoint_with(dag_id, node_id, level, payload, options)
            .await?)
    }

    /// Classify a step failure and recover from it
    ///
    /// A recovered step's new state replaces its staged state and, once the
    /// step has committed, is checkpointed like any other commit.
    ///
    /// # Errors
    /// - `Terminal` if every strategy failed, naming the checkpoint to resume from
    /// - `Recovery(Cancelled)` if [`Self::cancel_recovery`] interrupted it
    #[tracing::instrument(skip(self, ctx, error, system), fields(dag_id = %ctx.dag_id()))]
    pub async fn on_failure(
        &self,
        ctx: &ProvenanceContext,
        node_id: NodeId,
        error: StepFailure,
        system: SystemMetrics,
    ) -> CoreResult<RecoveryResult> {
        let dag_id = self.ensure_active(ctx)?;
        let context = ExecutionContext {
            dag_id,
            node_id,
            attempt: ctx.record_failure(node_id),
        };
        let analysis = self.classifier.classify(&error, &context, &system);
        let options = RecoveryOptions::default()
            .with_cancellation(ctx.recovery_token())
            .with_system(system);

        let result = self
            .engine
            .execute_recovery(&analysis, None, options)
            .await
            .map_err(|e| {
                let e = CoreError::from(e);
                if let Some(terminal) = e.terminal_context() {
                    tracing::error!(%terminal, "recovery exhausted, operator action required");
                }
                e
            })?;
        self.adopt_state(&result).await;
        Ok(result)
    }

    /// Resume a recovery paused for manual intervention
    ///
    /// # Errors
    /// `Recovery(NothingToResume)` if nothing waits on the checkpoint,
    /// `Terminal` if the re-run fails
    pub async fn resume_manual(
        &self,
        ctx: &ProvenanceContext,
        checkpoint_id: CheckpointId,
    ) -> CoreResult<RecoveryResult> {
        self.ensure_active(ctx)?;
        let options = RecoveryOptions::default().with_cancellation(ctx.recovery_token());
        let result = self.engine.resume_manual(checkpoint_id, options).await?;
        self.adopt_state(&result).await;
        Ok(result)
    }

    /// Cancel the recovery running for `ctx`; its effects are undone
    pub fn cancel_recovery(&self, ctx: &ProvenanceContext) {
        tracing::info!(dag_id = %ctx.dag_id(), "recovery cancellation requested");
        ctx.cancel_recovery();
    }

    async fn adopt_state(&self, result: &RecoveryResult) {
        if let Some(state) = result.state.as_ref().filter(|s| !s.is_empty()) {
            self.staged
                .entry((result.dag_id, result.node_id))
                .or_default()
                .state = state.clone();
        }
        let committed = self
            .provenance
            .get_node(result.dag_id, result.node_id)
            .is_ok_and(|n| n.is_committed());
        if result.is_recovered() && committed {
            self.checkpoint_commit(result.dag_id, result.node_id).await;
        }
    }

    /// Lineage of an element
    ///
    /// # Errors
    /// `UnknownDag`
    pub fn trace(
        &self,
        ctx: &ProvenanceContext,
        element: &ElementId,
        direction: TraceDirection,
    ) -> CoreResult<Vec<TracedReference>> {
        Ok(self.provenance.trace(ctx.dag_id(), element, direction)?)
    }

    /// Pick an analysis back up after a restart
    ///
    /// Rehydrates the DAG, restores its latest usable checkpoint into the
    /// staged state and fails steps that were running when the process
    /// stopped.
    ///
    /// # Errors
    /// `UnknownDag` if no record exists, `JournalIntegrity` if it does not
    /// verify, or a storage error
    #[tracing::instrument(skip(self))]
    pub async fn resume(&self, dag_id: DagId) -> CoreResult<ResumeReport> {
        let dag = self.provenance.load_dag(dag_id).await?;

        let mut interrupted = Vec::new();
        if !dag.is_sealed() {
            for node_id in dag.nodes_with_status(NodeStatus::Running) {
                self.provenance.mark_failed(dag_id, node_id).await?;
                interrupted.push(node_id);
            }
            if dag.status() == DagStatus::Recovering {
                self.provenance.set_status(dag_id, DagStatus::Failed).await?;
            }
        }

        let checkpoint = self.restore_latest(dag_id).await?;
        if let Some(restored) = &checkpoint {
            self.staged.insert(
                (dag_id, restored.checkpoint.node_id()),
                CheckpointPayload::new(restored.state.clone())
                    .with_partial_results(restored.partial_results.clone()),
            );
        }

        let dag = self.provenance.snapshot(dag_id)?;
        let (completed, pending): (Vec<_>, Vec<_>) = dag
            .topological_order()
            .into_iter()
            .filter(|id| dag.node(*id).is_some_and(|n| n.status != NodeStatus::Skipped))
            .partition(|id| dag.node(*id).is_some_and(AnalysisNode::is_committed));

        self.active.insert(dag_id, Utc::now());
        tracing::info!(
            %dag_id,
            completed = completed.len(),
            pending = pending.len(),
            interrupted = interrupted.len(),
            checkpoint = checkpoint.is_some(),
            "analysis resumed"
        );
        Ok(ResumeReport {
            context: ProvenanceContext::new(dag_id),
            dag,
            checkpoint,
            completed,
            pending,
            interrupted,
        })
    }

    /// Restore the newest checkpoint that verifies, walking back on corruption
    async fn restore_latest(&self, dag_id: DagId) -> CoreResult<Option<RestorationResult>> {
        let entries = self.checkpoints.list_checkpoints(dag_id).await?;
        for entry in entries.into_iter().rev() {
            match self
                .checkpoints
                .restore(entry.checkpoint_id, RestoreOptions::default())
                .await
            {
                Ok(restored) => return Ok(Some(restored)),
                Err(e) if e.is_integrity_failure() => {
                    tracing::warn!(checkpoint_id = %entry.checkpoint_id, error = %e, "skipping unusable checkpoint");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Seal the analysis with its final outputs and end the session
    ///
    /// # Errors
    /// `DagSealed` if already completed, or a storage error
    #[tracing::instrument(skip(self, ctx, final_outputs), fields(dag_id = %ctx.dag_id()))]
    pub async fn complete_analysis(
        &self,
        ctx: ProvenanceContext,
        final_outputs: Vec<DataReference>,
    ) -> CoreResult<Arc<AnalysisDag>> {
        let dag_id = self.ensure_active(&ctx)?;
        self.provenance.complete_dag(dag_id, final_outputs).await?;
        self.release(dag_id).await;
        metrics::counter!("provenant_analyses_completed_total").increment(1);
        Ok(self.provenance.snapshot(dag_id)?)
    }

    /// End an analysis that will not complete
    ///
    /// The DAG is marked failed and stays on record with its checkpoints, so
    /// [`Self::resume`] can still pick it up; in-process state is dropped.
    ///
    /// # Errors
    /// `InactiveAnalysis`, or a storage error
    #[tracing::instrument(skip(self, ctx), fields(dag_id = %ctx.dag_id()))]
    pub async fn abandon_analysis(&self, ctx: ProvenanceContext) -> CoreResult<Arc<AnalysisDag>> {
        let dag_id = self.ensure_active(&ctx)?;
        ctx.cancel_recovery();
        let dag = self.provenance.snapshot(dag_id)?;
        if !dag.is_sealed() && dag.status() != DagStatus::Failed {
            self.provenance.set_status(dag_id, DagStatus::Failed).await?;
        }
        self.release(dag_id).await;
        metrics::counter!("provenant_analyses_abandoned_total").increment(1);
        tracing::info!(%dag_id, "analysis abandoned");
        Ok(self.provenance.snapshot(dag_id)?)
    }

    async fn release(&self, dag_id: DagId) {
        self.active.remove(&dag_id);
        self.staged.retain(|(dag, _), _| *dag != dag_id);
        self.checkpoints.forget_dag(dag_id).await;
    }
}
