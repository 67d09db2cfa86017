//! Node and DAG lifecycle transitions

use crate::dag::DagStatus;
use provenant_types::NodeStatus;

/// Statuses reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: NodeStatus) -> &'static [NodeStatus] {
    use NodeStatus::{Committed, Failed, PendingReexecution, Running, Skipped};
    match from {
        Running => &[Committed, Failed],
        Failed => &[Running, PendingReexecution, Skipped],
        PendingReexecution => &[Running, Skipped],
        Committed | Skipped => &[],
    }
}

/// Whether `from -> to` is a legal node transition
#[must_use]
pub fn is_allowed(from: NodeStatus, to: NodeStatus) -> bool {
    allowed_transitions(from).contains(&to)
}

/// DAG statuses reachable from `from` in one step
#[must_use]
pub fn allowed_dag_transitions(from: DagStatus) -> &'static [DagStatus] {
    use DagStatus::{Completed, Failed, Recovering, Running};
    match from {
        Running => &[Completed, Failed, Recovering],
        Recovering => &[Running, Failed],
        Failed => &[Recovering, Running],
        Completed => &[],
    }
}

#[must_use]
pub fn is_dag_transition_allowed(from: DagStatus, to: DagStatus) -> bool {
    allowed_dag_transitions(from).contains(&to)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_exits() {
        assert!(allowed_transitions(NodeStatus::Committed).is_empty());
        assert!(allowed_transitions(NodeStatus::Skipped).is_empty());
        assert!(allowed_dag_transitions(DagStatus::Completed).is_empty());
    }

    #[test]
    fn recovery_paths() {
        assert!(is_allowed(NodeStatus::Running, NodeStatus::Failed));
        assert!(is_allowed(NodeStatus::Failed, NodeStatus::Running));
        assert!(is_allowed(NodeStatus::Failed, NodeStatus::PendingReexecution));
        assert!(is_allowed(NodeStatus::PendingReexecution, NodeStatus::Running));
        assert!(!is_allowed(NodeStatus::Running, NodeStatus::Skipped));
        assert!(!is_allowed(NodeStatus::PendingReexecution, NodeStatus::Committed));
    }
}
