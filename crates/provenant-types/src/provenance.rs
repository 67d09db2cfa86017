//! Element-level lineage records

use crate::ids::{ElementId, NodeId};
use crate::node::{AnalysisNode, AnalysisType};
use crate::reference::{DataReference, ReferenceKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a step turned its inputs into an element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transformation {
    pub operation: String,
    pub inputs: Vec<DataReference>,
}

/// One entry of an element's analysis path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceStep {
    pub node_id: NodeId,
    pub analysis_type: AnalysisType,
    pub tool_id: String,
    pub transformation: Transformation,
    pub recorded_at: DateTime<Utc>,
    /// Commit sequence within the DAG; orders versions of an element
    #[serde(default)]
    pub sequence: u64,
}

impl ProvenanceStep {
    /// Step describing how `node` produced its outputs
    #[must_use]
    pub fn from_node(node: &AnalysisNode) -> Self {
        Self {
            node_id: node.id,
            analysis_type: node.analysis_type,
            tool_id: node.tool_id.clone(),
            transformation: Transformation {
                operation: node.tool_id.clone(),
                inputs: node.inputs.clone(),
            },
            recorded_at: Utc::now(),
            sequence: 0,
        }
    }

    #[must_use]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    #[inline]
    #[must_use]
    pub fn is_source_ingestion(&self) -> bool {
        self.analysis_type == AnalysisType::SourceIngestion
    }

    /// Whether this step consumed `element`
    #[must_use]
    pub fn consumed(&self, element: &ElementId) -> bool {
        self.transformation.inputs.iter().any(|r| &r.id == element)
    }
}

/// Lineage of one data element
///
/// `analysis_path` is append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementProvenance {
    pub element_id: ElementId,
    pub element_type: ReferenceKind,
    analysis_path: Vec<ProvenanceStep>,
    /// Current forms of the element, keyed by representation name
    pub representations: BTreeMap<String, DataReference>,
    /// Node that last wrote this element
    pub current_node: NodeId,
}

impl ElementProvenance {
    /// Start a lineage record with its producing step
    #[must_use]
    pub fn new(reference: &DataReference, step: ProvenanceStep) -> Self {
        let current_node = step.node_id;
        let mut representations = BTreeMap::new();
        representations.insert(format!("{:?}", step.analysis_type), reference.clone());
        Self {
            element_id: reference.id.clone(),
            element_type: reference.kind.clone(),
            analysis_path: vec![step],
            representations,
            current_node,
        }
    }

    /// Append a step
    pub fn append(&mut self, reference: &DataReference, step: ProvenanceStep) {
        self.current_node = step.node_id;
        self.representations
            .insert(format!("{:?}", step.analysis_type), reference.clone());
        self.analysis_path.push(step);
    }

    #[must_use]
    pub fn analysis_path(&self) -> &[ProvenanceStep] {
        &self.analysis_path
    }

    /// Latest step committed strictly before `sequence`
    #[must_use]
    pub fn latest_before(&self, sequence: u64) -> Option<&ProvenanceStep> {
        self.analysis_path.iter().rev().find(|s| s.sequence < sequence)
    }

    /// Step written by `node`, if any
    #[must_use]
    pub fn step_by(&self, node: NodeId) -> Option<&ProvenanceStep> {
        self.analysis_path.iter().rev().find(|s| s.node_id == node)
    }

    /// Drop steps written by `node` (rollback of an uncommitted writer)
    ///
    /// Returns true when the record is left empty.
    pub fn discard_steps_by(&mut self, node: NodeId) -> bool {
        self.analysis_path.retain(|s| s.node_id != node);
        if let Some(last) = self.analysis_path.last() {
            self.current_node = last.node_id;
        }
        self.analysis_path.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_is_append_only_and_tracks_writer() {
        let input = DataReference::document("d1");
        let ingest = AnalysisNode::new(AnalysisType::SourceIngestion, "loader")
            .with_inputs([input.clone()])
            .with_outputs([input.clone()]);
        let clean = AnalysisNode::new(AnalysisType::Transformation, "cleaner")
            .with_inputs([input.clone()])
            .with_outputs([input.clone()]);

        let mut prov =
            ElementProvenance::new(&input, ProvenanceStep::from_node(&ingest).with_sequence(1));
        prov.append(&input, ProvenanceStep::from_node(&clean).with_sequence(2));

        assert_eq!(prov.analysis_path().len(), 2);
        assert_eq!(prov.current_node, clean.id);
        assert!(prov.analysis_path()[0].is_source_ingestion());
        assert!(prov.step_by(clean.id).unwrap().consumed(&"d1".into()));
        assert_eq!(prov.latest_before(2).unwrap().node_id, ingest.id);
        assert!(prov.latest_before(1).is_none());

        assert!(!prov.discard_steps_by(clean.id));
        assert_eq!(prov.current_node, ingest.id);
    }
}
