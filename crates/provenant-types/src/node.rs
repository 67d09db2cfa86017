//! Analysis nodes: one executed step of a workflow

use crate::ids::NodeId;
use crate::reference::DataReference;
use crate::value::{StateMap, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of step a node records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    /// Brings an original input into the workflow; lineage stops here
    SourceIngestion,
    Extraction,
    Transformation,
    Aggregation,
    Analysis,
    /// Changes representation (e.g. graph to table)
    CrossModalTransformation,
}

/// Lifecycle of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Registered, outputs not yet visible
    Running,
    /// Outputs visible to downstream readers
    Committed,
    Failed,
    /// Rolled back; waiting to be executed again
    PendingReexecution,
    /// Outputs absent; downstream nodes are flagged incomplete
    Skipped,
}

impl NodeStatus {
    /// No further transitions possible
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Skipped)
    }
}

/// Timing and environment recorded for a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub environment: String,
    /// Quality metric for cross-modal transformations (0.0 - 1.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_preservation: Option<f64>,
}

impl Default for ExecutionMetadata {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            environment: "default".to_string(),
            semantic_preservation: None,
        }
    }
}

/// One executed analysis step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisNode {
    pub id: NodeId,
    pub analysis_type: AnalysisType,
    pub tool_id: String,
    pub inputs: Vec<DataReference>,
    pub outputs: Vec<DataReference>,
    pub parameters: StateMap,
    pub metadata: ExecutionMetadata,
    /// Confidence carried through from the step (0.0 - 1.0)
    pub confidence: f64,
    pub status: NodeStatus,
    /// Set when an upstream node was skipped
    #[serde(default)]
    pub incomplete: bool,
}

impl AnalysisNode {
    /// Create a running node
    #[must_use]
    pub fn new(analysis_type: AnalysisType, tool_id: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(),
            analysis_type,
            tool_id: tool_id.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            parameters: StateMap::new(),
            metadata: ExecutionMetadata::default(),
            confidence: 1.0,
            status: NodeStatus::Running,
            incomplete: false,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: NodeId) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = DataReference>) -> Self {
        self.inputs = inputs.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_outputs(mut self, outputs: impl IntoIterator<Item = DataReference>) -> Self {
        self.outputs = outputs.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.metadata.environment = environment.into();
        self
    }

    /// Attach the semantic-preservation score of a cross-modal step
    #[must_use]
    pub fn with_semantic_preservation(mut self, score: f64) -> Self {
        self.metadata.semantic_preservation = Some(score.clamp(0.0, 1.0));
        self
    }

    /// Stamp end time and duration
    pub fn finish(&mut self) {
        let ended = Utc::now();
        let elapsed = ended - self.metadata.started_at;
        self.metadata.ended_at = Some(ended);
        self.metadata.duration_ms = Some(u64::try_from(elapsed.num_milliseconds()).unwrap_or(0));
    }

    /// Outputs as seen by downstream readers
    #[must_use]
    pub fn visible_outputs(&self) -> &[DataReference] {
        if self.status == NodeStatus::Committed {
            &self.outputs
        } else {
            &[]
        }
    }

    #[inline]
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.status == NodeStatus::Committed
    }

    #[inline]
    #[must_use]
    pub fn is_cross_modal(&self) -> bool {
        self.analysis_type == AnalysisType::CrossModalTransformation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outputs_hidden_until_committed() {
        let mut node = AnalysisNode::new(AnalysisType::Extraction, "ner")
            .with_outputs([DataReference::entity("e1")]);
        assert!(node.visible_outputs().is_empty());

        node.status = NodeStatus::Committed;
        assert_eq!(node.visible_outputs().len(), 1);
    }

    #[test]
    fn confidence_and_preservation_are_clamped() {
        let node = AnalysisNode::new(AnalysisType::CrossModalTransformation, "graph2table")
            .with_confidence(1.7)
            .with_semantic_preservation(-0.2);
        assert!((node.confidence - 1.0).abs() < f64::EPSILON);
        assert_eq!(node.metadata.semantic_preservation, Some(0.0));
        assert!(node.is_cross_modal());
    }

    #[test]
    fn finish_records_duration() {
        let mut node = AnalysisNode::new(AnalysisType::Analysis, "stats");
        node.finish();
        assert!(node.metadata.ended_at.is_some());
        assert!(node.metadata.duration_ms.is_some());
    }
}
