//! Provenant Core - orchestrator facade
//!
//! The surface an orchestration layer drives while it runs an analysis:
//! - Records every step in the analysis DAG for lineage tracing
//! - Checkpoints every committed step with its staged state
//! - Classifies step failures and runs recovery strategies
//! - Resumes analyses after a restart
//!
//! # Example
//!
//! ```rust,ignore
//! use provenant_core::{Orchestrator, ProvenantConfig};
//! use provenant_types::{AnalysisNode, AnalysisType, DataReference};
//!
//! # async fn example(runner: std::sync::Arc<dyn provenant_recovery::StepRunner>) -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = Orchestrator::open(ProvenantConfig::load("provenant.toml")?, runner)?;
//! let d1 = DataReference::document("d1");
//! let ctx = orchestrator.start_analysis(vec![d1.clone()]).await?;
//!
//! let ingest = AnalysisNode::new(AnalysisType::SourceIngestion, "loader")
//!     .with_inputs([d1.clone()])
//!     .with_outputs([d1.clone()]);
//! orchestrator.record_step(&ctx, ingest, &[]).await?;
//! orchestrator.complete_analysis(ctx, vec![d1]).await?;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod config;
pub mod context;
pub mod error;
pub mod orchestrator;
pub mod telemetry;

pub use config::ProvenantConfig;
pub use context::ProvenanceContext;
pub use error::{CoreError, CoreResult, TerminalContext};
pub use orchestrator::{Orchestrator, ResumeReport};
pub use telemetry::{init_tracing, TelemetryConfig};

/// Common imports for driving an analysis
pub mod prelude {
    pub use crate::{CoreError, Orchestrator, ProvenanceContext, ProvenantConfig};
    pub use provenant_checkpoint::{CheckpointConfig, CheckpointLevel};
    pub use provenant_dag::TraceDirection;
    pub use provenant_recovery::{RecoveryOutcome, RecoveryResult, StepOutput, StepRunner};
    pub use provenant_types::{
        AnalysisNode, AnalysisType, DataReference, ElementId, NodeId, StepFailure, SystemMetrics,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
