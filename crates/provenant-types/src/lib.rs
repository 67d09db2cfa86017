//! Provenant Types - shared data model
//!
//! Vocabulary used by every Provenant crate:
//! - Identifiers ([`DagId`], [`NodeId`], [`ElementId`], ...)
//! - [`ContentHash`] digests for integrity checks
//! - Tagged [`Value`] payloads for step parameters and checkpoint state
//! - [`AnalysisNode`] and [`ElementProvenance`] lineage records
//! - [`RecoveryStrategy`] chains and the failure vocabulary
//!
//! # Example
//!
//! ```rust
//! use provenant_types::{AnalysisNode, AnalysisType, DataReference};
//!
//! let node = AnalysisNode::new(AnalysisType::Extraction, "ner")
//!     .with_inputs([DataReference::document("d1")])
//!     .with_outputs([DataReference::entity("e1")]);
//! assert!(node.visible_outputs().is_empty());
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod failure;
pub mod hash;
pub mod ids;
pub mod node;
pub mod provenance;
pub mod reference;
pub mod strategy;
pub mod value;

pub use failure::{
    ExecutionContext, FailureAnalysis, FailureCategory, FailureKind, ImpactAssessment,
    ImpactSeverity, RecoveryCost, StepFailure, SystemMetrics,
};
pub use hash::{ContentHash, HashError};
pub use ids::{AttemptId, CheckpointId, DagId, ElementId, FailureId, NodeId, SnapshotId, StrategyId};
pub use node::{AnalysisNode, AnalysisType, ExecutionMetadata, NodeStatus};
pub use provenance::{ElementProvenance, ProvenanceStep, Transformation};
pub use reference::{DataReference, ReferenceKind, TracedReference};
pub use strategy::{FallbackChainError, Precondition, RecoveryStrategy, StrategyKind};
pub use value::{StateMap, Value};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
