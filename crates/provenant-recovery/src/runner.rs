//! Re-invocation seam for analysis steps

use async_trait::async_trait;
use provenant_types::{AnalysisNode, DagId, DataReference, NodeId, StateMap, StepFailure};

/// Result of one successful step run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    pub outputs: Vec<DataReference>,
    /// State worth checkpointing after the run
    pub state: StateMap,
}

impl StepOutput {
    #[must_use]
    pub fn new(outputs: impl IntoIterator<Item = DataReference>) -> Self {
        Self {
            outputs: outputs.into_iter().collect(),
            state: StateMap::new(),
        }
    }

    #[must_use]
    pub fn with_state(mut self, state: StateMap) -> Self {
        self.state = state;
        self
    }
}

/// Runs analysis steps on behalf of the recovery engine
///
/// Implementations live in the orchestration layer; the engine only decides
/// when to call them.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Run `node` again; `restored` holds checkpointed state on rollback
    async fn run(
        &self,
        dag_id: DagId,
        node: &AnalysisNode,
        restored: Option<&StateMap>,
    ) -> Result<StepOutput, StepFailure>;

    /// Release partial results of a failed run before it is re-executed
    async fn cleanup(&self, _dag_id: DagId, _node_id: NodeId) -> Result<(), StepFailure> {
        Ok(())
    }
}
