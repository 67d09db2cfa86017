//! Provenance store: single writer of analysis DAGs
//!
//! Each DAG has one writer lock and one published snapshot. A mutation
//! clones the snapshot (cheap, persistent structures), applies the change,
//! persists the record when a persistence tier is attached and only then
//! publishes the new snapshot. Readers never block on writers.

use crate::dag::{AnalysisDag, DagStatus};
use crate::error::{ProvenanceError, ProvenanceResult};
use crate::journal::{verify_chain, JournalEntry, Mutation, MutationJournal};
use crate::trace::{self, TraceDirection};
use crate::weighting::{ContributionWeighting, InverseFanIn};
use dashmap::DashMap;
use parking_lot::RwLock;
use provenant_store::{StatePersistence, StorageLevel};
use provenant_types::{
    AnalysisNode, DagId, DataReference, ElementId, NodeId, TracedReference,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Persisted form of one DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagRecord {
    pub dag: AnalysisDag,
    pub journal: Vec<JournalEntry>,
}

/// Storage key of a DAG record
#[must_use]
pub fn dag_key(dag_id: DagId) -> String {
    format!("{}/{dag_id}", DagId::PREFIX)
}

/// Cross-modal transformation with its quality metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossModalEntry {
    pub node_id: NodeId,
    pub tool_id: String,
    pub input_kinds: Vec<String>,
    pub output_kinds: Vec<String>,
    pub semantic_preservation: Option<f64>,
}

#[derive(Debug)]
struct DagHandle {
    current: RwLock<Arc<AnalysisDag>>,
    writer: Mutex<()>,
    journal: MutationJournal,
}

impl DagHandle {
    fn new(dag: AnalysisDag, journal: MutationJournal) -> Self {
        Self {
            current: RwLock::new(Arc::new(dag)),
            writer: Mutex::new(()),
            journal,
        }
    }
}

/// Owner of every analysis DAG in the process
#[derive(Debug)]
pub struct ProvenanceStore {
    dags: DashMap<DagId, Arc<DagHandle>>,
    persistence: Option<StatePersistence>,
    record_level: StorageLevel,
    weighting: Arc<dyn ContributionWeighting>,
}

impl Default for ProvenanceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProvenanceStore {
    /// In-memory store with inverse fan-in weighting
    #[must_use]
    pub fn new() -> Self {
        Self {
            dags: DashMap::new(),
            persistence: None,
            record_level: StorageLevel::Database,
            weighting: Arc::new(InverseFanIn),
        }
    }

    /// Persist every DAG record at `level` of `persistence`
    #[must_use]
    pub fn with_persistence(mut self, persistence: StatePersistence, level: StorageLevel) -> Self {
        self.persistence = Some(persistence);
        self.record_level = level;
        self
    }

    #[must_use]
    pub fn with_weighting(mut self, weighting: Arc<dyn ContributionWeighting>) -> Self {
        self.weighting = weighting;
        self
    }

    fn handle(&self, dag_id: DagId) -> ProvenanceResult<Arc<DagHandle>> {
        self.dags
            .get(&dag_id)
            .map(|h| Arc::clone(h.value()))
            .ok_or(ProvenanceError::UnknownDag(dag_id))
    }

    async fn persist(&self, dag: &AnalysisDag, journal: Vec<JournalEntry>) -> ProvenanceResult<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        let record = DagRecord {
            dag: dag.clone(),
            journal,
        };
        let bytes = serde_json::to_vec(&record)?;
        persistence
            .persist(&dag_key(dag.id()), bytes, self.record_level)
            .await?;
        Ok(())
    }

    /// Apply `f` to a copy of the DAG, persist, journal, then publish
    async fn mutate<T>(
        &self,
        dag_id: DagId,
        f: impl FnOnce(&mut AnalysisDag) -> ProvenanceResult<(T, Vec<Mutation>)>,
    ) -> ProvenanceResult<(T, Arc<AnalysisDag>)> {
        let handle = self.handle(dag_id)?;
        let _writer = handle.writer.lock().await;

        let mut next = AnalysisDag::clone(&handle.current.read());
        let (out, mutations) = f(&mut next)?;
        if mutations.is_empty() {
            return Ok((out, Arc::clone(&handle.current.read())));
        }

        let entries = handle.journal.prepare(dag_id, mutations);
        let mut full = handle.journal.entries();
        full.extend(entries.iter().cloned());
        self.persist(&next, full).await?;

        handle.journal.commit(entries);
        let next = Arc::new(next);
        *handle.current.write() = Arc::clone(&next);
        Ok((out, next))
    }

    /// Start a new DAG rooted at `root_sources`
    ///
    /// # Errors
    /// Returns error if the record cannot be persisted
    #[tracing::instrument(skip(self, root_sources), fields(sources = root_sources.len()))]
    pub async fn create_dag(&self, root_sources: Vec<DataReference>) -> ProvenanceResult<DagId> {
        let dag_id = DagId::new();
        let dag = AnalysisDag::new(dag_id, root_sources);
        let journal = MutationJournal::default();
        let entries = journal.prepare(dag_id, vec![Mutation::DagCreated]);
        self.persist(&dag, entries.clone()).await?;
        journal.commit(entries);

        self.dags.insert(dag_id, Arc::new(DagHandle::new(dag, journal)));
        metrics::counter!("provenant_dags_created_total").increment(1);
        tracing::info!(%dag_id, "created analysis dag");
        Ok(dag_id)
    }

    /// Register `node` (as `Running`) downstream of `upstream`
    ///
    /// # Errors
    /// `UnknownDag`, `DagSealed`, `DuplicateNode`, `UnknownUpstream`,
    /// `ElementConflict`, or a storage error
    #[tracing::instrument(skip(self, node), fields(node_id = %node.id, tool = %node.tool_id))]
    pub async fn add_node(
        &self,
        dag_id: DagId,
        node: AnalysisNode,
        upstream: &[NodeId],
    ) -> ProvenanceResult<NodeId> {
        let id = node.id;
        self.mutate(dag_id, |dag| Ok(((), dag.add_node(node, upstream)?)))
            .await?;
        tracing::debug!(%dag_id, node_id = %id, "node added");
        Ok(id)
    }

    /// Mark `node_id` committed, recording provenance for its outputs
    ///
    /// `outputs` replaces the declared outputs when given.
    ///
    /// # Errors
    /// `UnknownNode`, `IllegalTransition`, `UpstreamNotCommitted`,
    /// `ElementConflict`, `DagSealed`, or a storage error
    #[tracing::instrument(skip(self, outputs))]
    pub async fn commit_node(
        &self,
        dag_id: DagId,
        node_id: NodeId,
        outputs: Option<Vec<DataReference>>,
    ) -> ProvenanceResult<AnalysisNode> {
        let (_, dag) = self
            .mutate(dag_id, |dag| Ok(((), dag.commit_node(node_id, outputs)?)))
            .await?;
        metrics::counter!("provenant_nodes_committed_total").increment(1);
        dag.node(node_id)
            .cloned()
            .ok_or(ProvenanceError::UnknownNode { dag: dag_id, node: node_id })
    }

    /// # Errors
    /// `UnknownNode`, `IllegalTransition` or a storage error
    pub async fn mark_failed(&self, dag_id: DagId, node_id: NodeId) -> ProvenanceResult<()> {
        self.mutate(dag_id, |dag| Ok(((), dag.mark_failed(node_id)?)))
            .await?;
        tracing::warn!(%dag_id, %node_id, "node failed");
        Ok(())
    }

    /// Roll `node_id` back so it can run again
    ///
    /// # Errors
    /// `UnknownNode`, `IllegalTransition` or a storage error
    pub async fn mark_for_reexecution(&self, dag_id: DagId, node_id: NodeId) -> ProvenanceResult<()> {
        self.mutate(dag_id, |dag| Ok(((), dag.mark_for_reexecution(node_id)?)))
            .await?;
        Ok(())
    }

    /// Move a failed or rolled-back node back to `Running`
    ///
    /// # Errors
    /// `UnknownNode`, `IllegalTransition` or a storage error
    pub async fn restart_node(&self, dag_id: DagId, node_id: NodeId) -> ProvenanceResult<()> {
        self.mutate(dag_id, |dag| Ok(((), dag.restart_node(node_id)?)))
            .await?;
        Ok(())
    }

    /// Skip `node_id`; returns the descendants flagged incomplete
    ///
    /// # Errors
    /// `UnknownNode`, `IllegalTransition` or a storage error
    pub async fn mark_skipped(&self, dag_id: DagId, node_id: NodeId) -> ProvenanceResult<Vec<NodeId>> {
        let (affected, _) = self
            .mutate(dag_id, |dag| {
                let affected = dag.descendants(node_id).into_iter().collect::<Vec<_>>();
                Ok((affected, dag.mark_skipped(node_id)?))
            })
            .await?;
        tracing::warn!(%dag_id, %node_id, affected = affected.len(), "node skipped");
        Ok(affected)
    }

    /// Restore nodes exactly as captured (compensation for a cancelled
    /// recovery). Committed nodes cannot be reverted.
    ///
    /// # Errors
    /// `UnknownNode`, `IllegalTransition` or a storage error
    pub async fn revert_nodes(&self, dag_id: DagId, nodes: Vec<AnalysisNode>) -> ProvenanceResult<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        self.mutate(dag_id, |dag| Ok(((), dag.revert_nodes(nodes)?)))
            .await?;
        Ok(())
    }

    /// # Errors
    /// `IllegalDagTransition`, `DagSealed` or a storage error
    pub async fn set_status(&self, dag_id: DagId, status: DagStatus) -> ProvenanceResult<()> {
        self.mutate(dag_id, |dag| Ok(((), dag.set_status(status)?)))
            .await?;
        Ok(())
    }

    /// Seal the DAG with its final outputs
    ///
    /// # Errors
    /// `DagSealed` if already sealed, or a storage error
    #[tracing::instrument(skip(self, final_outputs))]
    pub async fn complete_dag(
        &self,
        dag_id: DagId,
        final_outputs: Vec<DataReference>,
    ) -> ProvenanceResult<()> {
        self.mutate(dag_id, |dag| Ok(((), dag.seal(final_outputs)?)))
            .await?;
        tracing::info!(%dag_id, "analysis dag sealed");
        Ok(())
    }

    /// Consistent read view of the DAG
    ///
    /// # Errors
    /// `UnknownDag`
    pub fn snapshot(&self, dag_id: DagId) -> ProvenanceResult<Arc<AnalysisDag>> {
        Ok(Arc::clone(&self.handle(dag_id)?.current.read()))
    }

    /// # Errors
    /// `UnknownDag` or `UnknownNode`
    pub fn get_node(&self, dag_id: DagId, node_id: NodeId) -> ProvenanceResult<AnalysisNode> {
        self.snapshot(dag_id)?
            .node(node_id)
            .cloned()
            .ok_or(ProvenanceError::UnknownNode { dag: dag_id, node: node_id })
    }

    fn require_node(dag: &AnalysisDag, node_id: NodeId) -> ProvenanceResult<()> {
        if dag.contains_node(node_id) {
            Ok(())
        } else {
            Err(ProvenanceError::UnknownNode { dag: dag.id(), node: node_id })
        }
    }

    /// Every node reachable from `node_id`
    ///
    /// # Errors
    /// `UnknownDag` or `UnknownNode`
    pub fn downstream_nodes(&self, dag_id: DagId, node_id: NodeId) -> ProvenanceResult<Vec<NodeId>> {
        let dag = self.snapshot(dag_id)?;
        Self::require_node(&dag, node_id)?;
        Ok(dag.descendants(node_id).into_iter().collect())
    }

    /// Every node that reaches `node_id`
    ///
    /// # Errors
    /// `UnknownDag` or `UnknownNode`
    pub fn upstream_nodes(&self, dag_id: DagId, node_id: NodeId) -> ProvenanceResult<Vec<NodeId>> {
        let dag = self.snapshot(dag_id)?;
        Self::require_node(&dag, node_id)?;
        Ok(dag.ancestors(node_id).into_iter().collect())
    }

    /// # Errors
    /// `UnknownDag`
    pub fn topological_order(&self, dag_id: DagId) -> ProvenanceResult<Vec<NodeId>> {
        Ok(self.snapshot(dag_id)?.topological_order())
    }

    /// Original inputs `element` derives from
    ///
    /// # Errors
    /// `UnknownDag`
    pub fn trace_to_sources(
        &self,
        dag_id: DagId,
        element: &ElementId,
    ) -> ProvenanceResult<Vec<TracedReference>> {
        let dag = self.snapshot(dag_id)?;
        Ok(trace::trace_to_sources(&dag, element, self.weighting.as_ref()))
    }

    /// Everything derived from `source`
    ///
    /// # Errors
    /// `UnknownDag`
    pub fn trace_from_source(
        &self,
        dag_id: DagId,
        source: &DataReference,
    ) -> ProvenanceResult<Vec<TracedReference>> {
        let dag = self.snapshot(dag_id)?;
        Ok(trace::trace_from_source(&dag, &source.id, self.weighting.as_ref()))
    }

    /// Trace in either direction
    ///
    /// # Errors
    /// `UnknownDag`
    pub fn trace(
        &self,
        dag_id: DagId,
        element: &ElementId,
        direction: TraceDirection,
    ) -> ProvenanceResult<Vec<TracedReference>> {
        match direction {
            TraceDirection::Backward => self.trace_to_sources(dag_id, element),
            TraceDirection::Forward => {
                let dag = self.snapshot(dag_id)?;
                Ok(trace::trace_from_source(&dag, element, self.weighting.as_ref()))
            }
        }
    }

    /// Cross-modal steps with their semantic-preservation scores
    ///
    /// # Errors
    /// `UnknownDag`
    pub fn cross_modal_audit(&self, dag_id: DagId) -> ProvenanceResult<Vec<CrossModalEntry>> {
        let kinds = |refs: &[DataReference]| -> Vec<String> { refs.iter().map(|r| format!("{:?}", r.kind)).collect() };
        Ok(self
            .snapshot(dag_id)?
            .nodes()
            .filter(|n| n.is_cross_modal())
            .map(|n| CrossModalEntry {
                node_id: n.id,
                tool_id: n.tool_id.clone(),
                input_kinds: kinds(&n.inputs),
                output_kinds: kinds(&n.outputs),
                semantic_preservation: n.metadata.semantic_preservation,
            })
            .collect())
    }

    /// Journal entries of a DAG
    ///
    /// # Errors
    /// `UnknownDag`
    pub fn journal(&self, dag_id: DagId) -> ProvenanceResult<Vec<JournalEntry>> {
        Ok(self.handle(dag_id)?.journal.entries())
    }

    /// # Errors
    /// `UnknownDag` or `JournalIntegrity`
    pub fn verify_integrity(&self, dag_id: DagId) -> ProvenanceResult<()> {
        self.handle(dag_id)?
            .journal
            .verify_integrity()
            .map_err(|sequence| ProvenanceError::JournalIntegrity { dag: dag_id, sequence })
    }

    /// Ids of DAGs held in memory
    #[must_use]
    pub fn dag_ids(&self) -> Vec<DagId> {
        let mut ids: Vec<_> = self.dags.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Rehydrate a DAG from the persistence tier
    ///
    /// Returns the in-memory snapshot if the DAG is already loaded.
    ///
    /// # Errors
    /// `UnknownDag` if no persistence is attached or no record exists,
    /// `JournalIntegrity` if the stored journal does not verify
    #[tracing::instrument(skip(self))]
    pub async fn load_dag(&self, dag_id: DagId) -> ProvenanceResult<Arc<AnalysisDag>> {
        if let Ok(snapshot) = self.snapshot(dag_id) {
            return Ok(snapshot);
        }
        let Some(persistence) = &self.persistence else {
            return Err(ProvenanceError::UnknownDag(dag_id));
        };

        let mut preferred = vec![self.record_level];
        preferred.extend(StorageLevel::ALL.into_iter().filter(|l| *l != self.record_level));
        let bytes = match persistence.retrieve(&dag_key(dag_id), &preferred).await {
            Ok((bytes, _)) => bytes,
            Err(e) if e.is_not_found() => return Err(ProvenanceError::UnknownDag(dag_id)),
            Err(e) => return Err(e.into()),
        };

        let record: DagRecord = serde_json::from_slice(&bytes)?;
        verify_chain(&record.journal)
            .map_err(|sequence| ProvenanceError::JournalIntegrity { dag: dag_id, sequence })?;

        let handle = Arc::clone(
            self.dags
                .entry(dag_id)
                .or_insert_with(|| {
                    Arc::new(DagHandle::new(
                        record.dag,
                        MutationJournal::from_entries(record.journal),
                    ))
                })
                .value(),
        );
        tracing::info!(%dag_id, "rehydrated analysis dag");
        let snapshot = Arc::clone(&handle.current.read());
        Ok(snapshot)
    }
}
