//! The analysis DAG value
//!
//! [`AnalysisDag`] is built on persistent maps (`im`), so cloning it is
//! cheap and every published version is an independent, immutable snapshot.
//! Mutating methods are crate-private; callers go through
//! [`ProvenanceStore`](crate::ProvenanceStore), which validates, journals and
//! persists each change before publishing the new snapshot.

use crate::error::{ProvenanceError, ProvenanceResult};
use crate::journal::Mutation;
use crate::state;
use chrono::{DateTime, Utc};
use im::{OrdMap, OrdSet};
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::{Bfs, Reversed};
use provenant_types::{
    AnalysisNode, DagId, DataReference, ElementId, ElementProvenance, NodeId, NodeStatus,
    ProvenanceStep, ReferenceKind,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Lifecycle of a whole analysis run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DagStatus {
    Running,
    /// Sealed; no further mutation
    Completed,
    Failed,
    Recovering,
}

/// One analysis run: nodes, edges and element lineage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisDag {
    id: DagId,
    nodes: OrdMap<NodeId, AnalysisNode>,
    edges: OrdSet<(NodeId, NodeId)>,
    provenance: OrdMap<ElementId, ElementProvenance>,
    references: OrdMap<ElementId, DataReference>,
    root_sources: Vec<DataReference>,
    final_outputs: Vec<DataReference>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    status: DagStatus,
    commit_sequence: u64,
}

impl AnalysisDag {
    pub(crate) fn new(id: DagId, root_sources: Vec<DataReference>) -> Self {
        let references = root_sources
            .iter()
            .map(|r| (r.id.clone(), r.clone()))
            .collect();
        Self {
            id,
            nodes: OrdMap::new(),
            edges: OrdSet::new(),
            provenance: OrdMap::new(),
            references,
            root_sources,
            final_outputs: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
            status: DagStatus::Running,
            commit_sequence: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> DagId {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn status(&self) -> DagStatus {
        self.status
    }

    #[inline]
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.status == DagStatus::Completed
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    #[must_use]
    pub fn root_sources(&self) -> &[DataReference] {
        &self.root_sources
    }

    #[must_use]
    pub fn final_outputs(&self) -> &[DataReference] {
        &self.final_outputs
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&AnalysisNode> {
        self.nodes.get(&id)
    }

    #[must_use]
    pub fn contains_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Nodes in id (creation) order
    pub fn nodes(&self) -> impl Iterator<Item = &AnalysisNode> {
        self.nodes.values()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// `(source, target)` pairs
    pub fn edges(&self) -> impl Iterator<Item = &(NodeId, NodeId)> {
        self.edges.iter()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    #[must_use]
    pub fn has_edge(&self, from: NodeId, to: NodeId) -> bool {
        self.edges.contains(&(from, to))
    }

    /// Direct predecessors of `node`
    #[must_use]
    pub fn parents(&self, node: NodeId) -> Vec<NodeId> {
        self.edges
            .iter()
            .filter(|(_, to)| *to == node)
            .map(|(from, _)| *from)
            .collect()
    }

    /// Direct successors of `node`
    #[must_use]
    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.edges
            .iter()
            .filter(|(from, _)| *from == node)
            .map(|(_, to)| *to)
            .collect()
    }

    #[must_use]
    pub fn provenance(&self, element: &ElementId) -> Option<&ElementProvenance> {
        self.provenance.get(element)
    }

    /// Elements with recorded lineage
    pub fn elements(&self) -> impl Iterator<Item = &ElementId> {
        self.provenance.keys()
    }

    /// Best known reference for `element`
    #[must_use]
    pub fn reference(&self, element: &ElementId) -> DataReference {
        self.references.get(element).cloned().unwrap_or_else(|| {
            DataReference::new(ReferenceKind::Other("unregistered".to_string()), element.clone())
        })
    }

    /// Petgraph view of the structure
    #[must_use]
    pub fn graph(&self) -> DiGraphMap<NodeId, ()> {
        let mut graph = DiGraphMap::with_capacity(self.nodes.len(), self.edges.len());
        for id in self.nodes.keys() {
            graph.add_node(*id);
        }
        for (from, to) in &self.edges {
            graph.add_edge(*from, *to, ());
        }
        graph
    }

    /// Nodes ordered so every edge points forward
    #[must_use]
    pub fn topological_order(&self) -> Vec<NodeId> {
        // Edges only ever point at a node added after its sources, so the
        // graph is acyclic and toposort cannot fail.
        petgraph::algo::toposort(&self.graph(), None).unwrap_or_default()
    }

    /// Every node reachable from `node`, excluding itself
    #[must_use]
    pub fn descendants(&self, node: NodeId) -> BTreeSet<NodeId> {
        let graph = self.graph();
        let mut out = BTreeSet::new();
        if !graph.contains_node(node) {
            return out;
        }
        let mut bfs = Bfs::new(&graph, node);
        while let Some(n) = bfs.next(&graph) {
            if n != node {
                out.insert(n);
            }
        }
        out
    }

    /// Every node that reaches `node`, excluding itself
    #[must_use]
    pub fn ancestors(&self, node: NodeId) -> BTreeSet<NodeId> {
        let graph = self.graph();
        let mut out = BTreeSet::new();
        if !graph.contains_node(node) {
            return out;
        }
        let reversed = Reversed(&graph);
        let mut bfs = Bfs::new(reversed, node);
        while let Some(n) = bfs.next(reversed) {
            if n != node {
                out.insert(n);
            }
        }
        out
    }

    /// Nodes in the given status
    #[must_use]
    pub fn nodes_with_status(&self, status: NodeStatus) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.status == status)
            .map(|n| n.id)
            .collect()
    }

    fn ensure_open(&self) -> ProvenanceResult<()> {
        if self.is_sealed() {
            Err(ProvenanceError::DagSealed(self.id))
        } else {
            Ok(())
        }
    }

    fn node_mut(&mut self, id: NodeId) -> ProvenanceResult<&mut AnalysisNode> {
        let dag = self.id;
        self.nodes
            .get_mut(&id)
            .ok_or(ProvenanceError::UnknownNode { dag, node: id })
    }

    /// Reject outputs that another node owns or has claimed
    fn check_output_ownership(&self, node: &AnalysisNode) -> ProvenanceResult<()> {
        for output in &node.outputs {
            let consumes = node.inputs.iter().any(|i| i.id == output.id);
            if consumes {
                continue;
            }
            if let Some(prov) = self.provenance.get(&output.id) {
                if prov.current_node != node.id {
                    return Err(ProvenanceError::ElementConflict {
                        element: output.id.clone(),
                        owner: prov.current_node,
                        writer: node.id,
                    });
                }
            }
            let claimant = self.nodes.values().find(|other| {
                other.id != node.id
                    && !other.status.is_terminal()
                    && other.outputs.iter().any(|o| o.id == output.id)
            });
            if let Some(other) = claimant {
                return Err(ProvenanceError::ElementConflict {
                    element: output.id.clone(),
                    owner: other.id,
                    writer: node.id,
                });
            }
        }
        Ok(())
    }

    /// Every parent must be committed (or skipped) before `id` commits, so
    /// commit sequences follow the edges
    fn ensure_upstream_settled(&self, id: NodeId) -> ProvenanceResult<()> {
        for upstream in self.parents(id) {
            let status = self
                .nodes
                .get(&upstream)
                .map_or(NodeStatus::Running, |n| n.status);
            if !matches!(status, NodeStatus::Committed | NodeStatus::Skipped) {
                return Err(ProvenanceError::UpstreamNotCommitted {
                    node: id,
                    upstream,
                    status,
                });
            }
        }
        Ok(())
    }

    fn register_references(&mut self, refs: &[DataReference]) {
        for r in refs {
            if !self.references.contains_key(&r.id) {
                self.references.insert(r.id.clone(), r.clone());
            }
        }
    }

    pub(crate) fn add_node(
        &mut self,
        mut node: AnalysisNode,
        upstream: &[NodeId],
    ) -> ProvenanceResult<Vec<Mutation>> {
        self.ensure_open()?;
        if self.nodes.contains_key(&node.id) {
            return Err(ProvenanceError::DuplicateNode {
                dag: self.id,
                node: node.id,
            });
        }
        let mut parents = Vec::with_capacity(upstream.len());
        for up in upstream {
            if !self.nodes.contains_key(up) {
                return Err(ProvenanceError::UnknownUpstream {
                    dag: self.id,
                    upstream: *up,
                });
            }
            if !parents.contains(up) {
                parents.push(*up);
            }
        }

        node.status = NodeStatus::Running;
        node.incomplete = parents.iter().any(|p| {
            self.nodes
                .get(p)
                .is_some_and(|n| n.incomplete || n.status == NodeStatus::Skipped)
        });
        self.check_output_ownership(&node)?;

        self.register_references(&node.inputs);
        self.register_references(&node.outputs);
        for p in &parents {
            self.edges.insert((*p, node.id));
        }
        let id = node.id;
        self.nodes.insert(id, node);
        Ok(vec![Mutation::NodeAdded {
            node: id,
            upstream: parents,
        }])
    }

    fn transition(&mut self, id: NodeId, to: NodeStatus) -> ProvenanceResult<Mutation> {
        self.ensure_open()?;
        let node = self.node_mut(id)?;
        let from = node.status;
        if !state::is_allowed(from, to) {
            return Err(ProvenanceError::IllegalTransition { node: id, from, to });
        }
        node.status = to;
        Ok(Mutation::NodeStatusChanged { node: id, from, to })
    }

    pub(crate) fn commit_node(
        &mut self,
        id: NodeId,
        outputs: Option<Vec<DataReference>>,
    ) -> ProvenanceResult<Vec<Mutation>> {
        self.ensure_open()?;
        let mut node = self
            .nodes
            .get(&id)
            .cloned()
            .ok_or(ProvenanceError::UnknownNode { dag: self.id, node: id })?;
        if !state::is_allowed(node.status, NodeStatus::Committed) {
            return Err(ProvenanceError::IllegalTransition {
                node: id,
                from: node.status,
                to: NodeStatus::Committed,
            });
        }
        self.ensure_upstream_settled(id)?;
        if let Some(outputs) = outputs {
            node.outputs = outputs;
            self.check_output_ownership(&node)?;
            self.register_references(&node.outputs);
        }

        node.status = NodeStatus::Committed;
        node.finish();
        self.commit_sequence += 1;
        let sequence = self.commit_sequence;

        let step = ProvenanceStep::from_node(&node).with_sequence(sequence);
        for output in &node.outputs {
            match self.provenance.get_mut(&output.id) {
                Some(prov) => prov.append(output, step.clone()),
                None => {
                    self.provenance.insert(
                        output.id.clone(),
                        ElementProvenance::new(output, step.clone()),
                    );
                }
            }
        }
        self.nodes.insert(id, node);
        Ok(vec![Mutation::NodeCommitted { node: id, sequence }])
    }

    pub(crate) fn mark_failed(&mut self, id: NodeId) -> ProvenanceResult<Vec<Mutation>> {
        Ok(vec![self.transition(id, NodeStatus::Failed)?])
    }

    /// Rollback: the node waits to run again and its uncommitted output
    /// declarations are dropped
    pub(crate) fn mark_for_reexecution(&mut self, id: NodeId) -> ProvenanceResult<Vec<Mutation>> {
        let mutation = self.transition(id, NodeStatus::PendingReexecution)?;
        let node = self.node_mut(id)?;
        let discarded = std::mem::take(&mut node.outputs);
        for output in &discarded {
            if let Some(prov) = self.provenance.get_mut(&output.id) {
                if prov.discard_steps_by(id) {
                    self.provenance.remove(&output.id);
                }
            }
        }
        Ok(vec![mutation])
    }

    pub(crate) fn restart_node(&mut self, id: NodeId) -> ProvenanceResult<Vec<Mutation>> {
        Ok(vec![self.transition(id, NodeStatus::Running)?])
    }

    /// Skip: the node is abandoned and everything downstream is flagged
    /// incomplete
    pub(crate) fn mark_skipped(&mut self, id: NodeId) -> ProvenanceResult<Vec<Mutation>> {
        let mutation = self.transition(id, NodeStatus::Skipped)?;
        let affected: Vec<NodeId> = self.descendants(id).into_iter().collect();
        for d in &affected {
            if let Some(node) = self.nodes.get_mut(d) {
                node.incomplete = true;
            }
        }
        let mut mutations = vec![mutation];
        if !affected.is_empty() {
            mutations.push(Mutation::MarkedIncomplete { nodes: affected });
        }
        Ok(mutations)
    }

    /// Put nodes back exactly as captured
    ///
    /// Committed nodes are never reverted.
    pub(crate) fn revert_nodes(&mut self, nodes: Vec<AnalysisNode>) -> ProvenanceResult<Vec<Mutation>> {
        self.ensure_open()?;
        let mut mutations = Vec::with_capacity(nodes.len());
        for captured in nodes {
            let current = self.node_mut(captured.id)?;
            if current.status == NodeStatus::Committed && captured.status != NodeStatus::Committed {
                return Err(ProvenanceError::IllegalTransition {
                    node: captured.id,
                    from: current.status,
                    to: captured.status,
                });
            }
            mutations.push(Mutation::NodeReverted {
                node: captured.id,
                to: captured.status,
            });
            *current = captured;
        }
        Ok(mutations)
    }

    pub(crate) fn set_status(&mut self, to: DagStatus) -> ProvenanceResult<Vec<Mutation>> {
        self.ensure_open()?;
        let from = self.status;
        if from == to {
            return Ok(Vec::new());
        }
        if to == DagStatus::Completed || !state::is_dag_transition_allowed(from, to) {
            return Err(ProvenanceError::IllegalDagTransition {
                dag: self.id,
                from,
                to,
            });
        }
        self.status = to;
        Ok(vec![Mutation::DagStatusChanged { from, to }])
    }

    pub(crate) fn seal(&mut self, final_outputs: Vec<DataReference>) -> ProvenanceResult<Vec<Mutation>> {
        self.ensure_open()?;
        if !state::is_dag_transition_allowed(self.status, DagStatus::Completed) {
            return Err(ProvenanceError::IllegalDagTransition {
                dag: self.id,
                from: self.status,
                to: DagStatus::Completed,
            });
        }
        let from = self.status;
        self.register_references(&final_outputs);
        self.final_outputs = final_outputs;
        self.status = DagStatus::Completed;
        self.completed_at = Some(Utc::now());
        Ok(vec![
            Mutation::DagStatusChanged {
                from,
                to: DagStatus::Completed,
            },
            Mutation::DagSealed,
        ])
    }
}
