//! Testing utilities for the Provenant workspace
//!
//! Shared fixtures: small DAGs, a scripted step runner and a wired-up
//! recovery stack over ephemeral or on-disk persistence.

#![allow(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use provenant_checkpoint::{CheckpointConfig, CheckpointManager};
use provenant_dag::ProvenanceStore;
use provenant_recovery::{
    ClassifierConfig, FailureClassifier, RecoveryConfig, RecoveryEngine, StepOutput, StepRunner,
    StrategyLedger,
};
use provenant_store::{StatePersistence, StoreConfig};
use provenant_types::{
    AnalysisNode, AnalysisType, DagId, DataReference, NodeId, StateMap, StepFailure, Value,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Integer state map from pairs
pub fn state(pairs: &[(&str, i64)]) -> StateMap {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), Value::Int(*v)))
        .collect()
}

/// Chain of `len` nodes; all but the last are committed, the last is running
pub async fn linear_dag(store: &ProvenanceStore, len: usize) -> (DagId, Vec<NodeId>) {
    let source = DataReference::document("source");
    let dag = store.create_dag(vec![source.clone()]).await.unwrap();
    let mut nodes: Vec<NodeId> = Vec::with_capacity(len);
    let mut input = source;
    for i in 0..len {
        let output = DataReference::entity(format!("step-{i}"));
        let analysis_type = if i == 0 {
            AnalysisType::SourceIngestion
        } else {
            AnalysisType::Extraction
        };
        let upstream: Vec<NodeId> = nodes.last().copied().into_iter().collect();
        let id = store
            .add_node(
                dag,
                AnalysisNode::new(analysis_type, format!("tool-{i}"))
                    .with_inputs([input.clone()])
                    .with_outputs([output.clone()]),
                &upstream,
            )
            .await
            .unwrap();
        if i + 1 < len {
            store.commit_node(dag, id, None).await.unwrap();
        }
        nodes.push(id);
        input = output;
    }
    (dag, nodes)
}

/// Temporary directory with a store config rooted in it
pub struct TempState {
    pub dir: TempDir,
    pub config: StoreConfig,
}

impl TempState {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::at(dir.path());
        Self { dir, config }
    }

    /// Fresh persistence over the same directory, as after a restart
    pub fn open(&self) -> StatePersistence {
        StatePersistence::open(&self.config).unwrap()
    }
}

impl Default for TempState {
    fn default() -> Self {
        Self::new()
    }
}

/// One recorded `run` call
#[derive(Debug, Clone, PartialEq)]
pub struct RunCall {
    pub node_id: NodeId,
    pub restored: Option<StateMap>,
}

/// Step runner replaying scripted results
///
/// Once the script is exhausted every run succeeds, echoing the restored
/// state back as the step's state.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    script: Mutex<VecDeque<Result<StepOutput, StepFailure>>>,
    delay: Option<Duration>,
    calls: Mutex<Vec<RunCall>>,
    cleanups: AtomicUsize,
}

impl ScriptedRunner {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn new(script: impl IntoIterator<Item = Result<StepOutput, StepFailure>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Fail `times` times with `failure`, then succeed
    pub fn failing(failure: StepFailure, times: usize) -> Self {
        Self::new(std::iter::repeat_with(|| Err(failure.clone())).take(times))
    }

    /// Sleep before answering each run
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<RunCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn cleanup_count(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepRunner for ScriptedRunner {
    async fn run(
        &self,
        _dag_id: DagId,
        node: &AnalysisNode,
        restored: Option<&StateMap>,
    ) -> Result<StepOutput, StepFailure> {
        self.calls.lock().push(RunCall {
            node_id: node.id,
            restored: restored.cloned(),
        });
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(StepOutput::new([DataReference::entity(format!("{}-rerun", node.tool_id))])
                .with_state(restored.cloned().unwrap_or_default()))
        })
    }

    async fn cleanup(&self, _dag_id: DagId, _node_id: NodeId) -> Result<(), StepFailure> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Provenance, checkpoints, classifier and engine sharing one persistence
pub struct RecoveryHarness {
    pub provenance: Arc<ProvenanceStore>,
    pub persistence: StatePersistence,
    pub checkpoints: Arc<CheckpointManager>,
    pub classifier: Arc<FailureClassifier>,
    pub engine: RecoveryEngine,
    pub runner: Arc<ScriptedRunner>,
}

impl RecoveryHarness {
    /// Harness over in-memory persistence with zero retry delays
    pub fn ephemeral(runner: ScriptedRunner) -> Self {
        Self::with(
            StatePersistence::ephemeral(),
            runner,
            ClassifierConfig::default().with_retry_delays(Duration::ZERO, Duration::ZERO),
            RecoveryConfig::default(),
        )
    }

    pub fn with(
        persistence: StatePersistence,
        runner: ScriptedRunner,
        classifier: ClassifierConfig,
        recovery: RecoveryConfig,
    ) -> Self {
        let provenance = Arc::new(ProvenanceStore::new());
        let checkpoints = Arc::new(CheckpointManager::new(
            Arc::clone(&provenance),
            persistence.clone(),
            CheckpointConfig::default(),
        ));
        let classifier = Arc::new(
            FailureClassifier::new(
                classifier,
                Arc::clone(&provenance),
                Arc::new(StrategyLedger::new()),
            )
            .unwrap(),
        );
        let runner = Arc::new(runner);
        let engine = RecoveryEngine::new(
            Arc::clone(&provenance),
            Arc::clone(&checkpoints),
            Arc::clone(&classifier),
            Arc::clone(&runner) as Arc<dyn StepRunner>,
            recovery,
        );
        Self {
            provenance,
            persistence,
            checkpoints,
            classifier,
            engine,
            runner,
        }
    }
}
