//! Error types for the orchestrator facade

use provenant_checkpoint::CheckpointError;
use provenant_dag::ProvenanceError;
use provenant_recovery::{RecoveryAttempt, RecoveryError};
use provenant_store::StoreError;
use provenant_types::{CheckpointId, DagId, FailureCategory, NodeId};
use std::fmt;
use std::path::PathBuf;

/// What an operator needs to pick up a terminal failure by hand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalContext {
    pub dag_id: DagId,
    pub node_id: NodeId,
    pub category: FailureCategory,
    /// Checkpoint recovery can resume from, if any
    pub checkpoint_id: Option<CheckpointId>,
}

impl fmt::Display for TerminalContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dag {}, node {}, category {}",
            self.dag_id, self.node_id, self.category
        )?;
        match self.checkpoint_id {
            Some(id) => write!(f, ", resume from checkpoint {id}"),
            None => f.write_str(", no checkpoint to resume from"),
        }
    }
}

/// Facade errors
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Recovery gave up; needs an operator
    #[error("terminal failure ({context}): {source}")]
    Terminal {
        context: TerminalContext,
        #[source]
        source: Box<RecoveryError>,
    },

    /// The context does not belong to this orchestrator's DAGs
    #[error("analysis {0} is not active in this orchestrator")]
    InactiveAnalysis(DagId),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("cannot read configuration {}: {source}", path.display())]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("telemetry setup failed: {0}")]
    Telemetry(String),

    #[error("provenance error: {0}")]
    Provenance(#[from] ProvenanceError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("recovery error: {0}")]
    Recovery(RecoveryError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl From<RecoveryError> for CoreError {
    /// Exhausted recoveries become `Terminal`
    fn from(error: RecoveryError) -> Self {
        let context = match &error {
            RecoveryError::RecoveryFailed {
                analysis,
                checkpoint_id,
                ..
            } => Some(TerminalContext {
                dag_id: analysis.dag_id(),
                node_id: analysis.node_id(),
                category: analysis.category,
                checkpoint_id: *checkpoint_id,
            }),
            _ => None,
        };
        match context {
            Some(context) => Self::Terminal {
                context,
                source: Box::new(error),
            },
            None => Self::Recovery(error),
        }
    }
}

impl CoreError {
    /// Check if an operator has to step in
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal { .. })
    }

    #[must_use]
    pub fn terminal_context(&self) -> Option<&TerminalContext> {
        match self {
            Self::Terminal { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Attempts made before a terminal failure
    #[must_use]
    pub fn attempts(&self) -> &[RecoveryAttempt] {
        match self {
            Self::Terminal { source, .. } => source.attempts(),
            _ => &[],
        }
    }

    /// Check if the operation may succeed when repeated
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::Provenance(e) => e.is_retryable(),
            Self::Checkpoint(e) => e.is_retryable(),
            Self::Recovery(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Check if stored data failed verification
    #[must_use]
    pub fn is_integrity_failure(&self) -> bool {
        match self {
            Self::Provenance(e) => e.is_integrity_failure(),
            Self::Checkpoint(e) => e.is_integrity_failure(),
            Self::Recovery(RecoveryError::Checkpoint(e)) => e.is_integrity_failure(),
            _ => false,
        }
    }
}

/// Result alias for facade operations
pub type CoreResult<T> = Result<T, CoreError>;
