//! Failure vocabulary shared by the classifier and the recovery engine
//!
//! A step reports a recoverable failure as a [`StepFailure`] value; the
//! classifier turns it into a [`FailureAnalysis`].

use crate::ids::{DagId, FailureId, NodeId};
use crate::strategy::RecoveryStrategy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Kind tag of the error raised by a step
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    Timeout,
    OutOfMemory,
    Validation,
    Authentication,
    Io,
    Other(String),
}

/// Error raised by an analysis step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StepFailure {
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Network, message)
    }

    #[must_use]
    pub fn timeout(after: Duration) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("operation timed out after {}ms", after.as_millis()),
        )
    }

    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Other("error".to_string()), message)
    }
}

/// Failure category assigned by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCategory {
    NetworkFailure,
    ResourceExhaustion,
    DataValidationFailure,
    AuthenticationFailure,
    RateLimitFailure,
    DiskSpaceFailure,
    UnknownFailure,
}

impl FailureCategory {
    /// Recoverable without a human (retry or rollback)
    #[must_use]
    pub fn is_auto_recoverable(self) -> bool {
        matches!(
            self,
            Self::NetworkFailure
                | Self::RateLimitFailure
                | Self::ResourceExhaustion
                | Self::DiskSpaceFailure
        )
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NetworkFailure => "NETWORK_FAILURE",
            Self::ResourceExhaustion => "RESOURCE_EXHAUSTION",
            Self::DataValidationFailure => "DATA_VALIDATION_FAILURE",
            Self::AuthenticationFailure => "AUTHENTICATION_FAILURE",
            Self::RateLimitFailure => "RATE_LIMIT_FAILURE",
            Self::DiskSpaceFailure => "DISK_SPACE_FAILURE",
            Self::UnknownFailure => "UNKNOWN_FAILURE",
        };
        f.write_str(name)
    }
}

/// Where the failure happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub dag_id: DagId,
    pub node_id: NodeId,
    /// Attempts already made for this node (0 on first failure)
    pub attempt: u32,
}

impl ExecutionContext {
    #[must_use]
    pub fn new(dag_id: DagId, node_id: NodeId) -> Self {
        Self {
            dag_id,
            node_id,
            attempt: 0,
        }
    }
}

/// Resource readings at failure time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub available_disk_bytes: u64,
    pub available_memory_bytes: u64,
    pub cpu_load: f64,
}

impl Default for SystemMetrics {
    /// Readings that trigger no resource rule
    fn default() -> Self {
        Self {
            available_disk_bytes: u64::MAX,
            available_memory_bytes: u64::MAX,
            cpu_load: 0.0,
        }
    }
}

/// Severity of the downstream impact
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactSeverity {
    /// Nothing downstream
    Isolated,
    Low,
    Medium,
    High,
}

/// Downstream nodes affected by a failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactAssessment {
    pub affected_nodes: Vec<NodeId>,
    pub severity: ImpactSeverity,
}

impl ImpactAssessment {
    #[must_use]
    pub fn from_affected(affected_nodes: Vec<NodeId>) -> Self {
        let severity = match affected_nodes.len() {
            0 => ImpactSeverity::Isolated,
            1..=2 => ImpactSeverity::Low,
            3..=9 => ImpactSeverity::Medium,
            _ => ImpactSeverity::High,
        };
        Self {
            affected_nodes,
            severity,
        }
    }

    #[must_use]
    pub fn affected_count(&self) -> usize {
        self.affected_nodes.len()
    }
}

/// Estimated cost of running the recommended strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryCost {
    /// Nodes that must run again
    pub recompute_nodes: usize,
    pub estimated_ms: u64,
}

/// Classified failure with a recommended strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureAnalysis {
    pub id: FailureId,
    pub timestamp: DateTime<Utc>,
    pub context: ExecutionContext,
    pub error: StepFailure,
    pub category: FailureCategory,
    pub impact: ImpactAssessment,
    pub recommended_strategy: RecoveryStrategy,
    pub estimated_cost: RecoveryCost,
}

impl FailureAnalysis {
    #[inline]
    #[must_use]
    pub fn dag_id(&self) -> DagId {
        self.context.dag_id
    }

    #[inline]
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.context.node_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_display_matches_taxonomy() {
        assert_eq!(FailureCategory::RateLimitFailure.to_string(), "RATE_LIMIT_FAILURE");
        let json = serde_json::to_string(&FailureCategory::DiskSpaceFailure).unwrap();
        assert_eq!(json, "\"DISK_SPACE_FAILURE\"");
    }

    #[test]
    fn impact_severity_scales_with_fan_out() {
        assert_eq!(ImpactAssessment::from_affected(vec![]).severity, ImpactSeverity::Isolated);
        let many: Vec<_> = (0..12).map(|_| NodeId::new()).collect();
        assert_eq!(ImpactAssessment::from_affected(many).severity, ImpactSeverity::High);
    }

    #[test]
    fn auto_recoverable_categories() {
        assert!(FailureCategory::NetworkFailure.is_auto_recoverable());
        assert!(!FailureCategory::AuthenticationFailure.is_auto_recoverable());
        assert!(!FailureCategory::UnknownFailure.is_auto_recoverable());
    }
}
