//! Provenant DAG - analysis provenance store
//!
//! Records every analysis step as a node in an immutable DAG and answers
//! lineage questions over it:
//! - [`ProvenanceStore::trace_to_sources`]: which original inputs an element
//!   derives from
//! - [`ProvenanceStore::trace_from_source`]: everything derived from an input
//!
//! Writes are serialised per DAG; reads take lock-free snapshots built on
//! persistent maps. Every structural change lands in a hash-chained
//! [`MutationJournal`].
//!
//! # Example
//!
//! ```rust,ignore
//! use provenant_dag::ProvenanceStore;
//! use provenant_types::{AnalysisNode, AnalysisType, DataReference};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = ProvenanceStore::new();
//! let d1 = DataReference::document("d1");
//! let dag = store.create_dag(vec![d1.clone()]).await?;
//!
//! let ingest = AnalysisNode::new(AnalysisType::SourceIngestion, "loader")
//!     .with_inputs([d1.clone()])
//!     .with_outputs([d1.clone()]);
//! let a = store.add_node(dag, ingest, &[]).await?;
//! store.commit_node(dag, a, None).await?;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod dag;
pub mod error;
pub mod journal;
pub mod state;
pub mod store;
pub mod trace;
pub mod weighting;

pub use dag::{AnalysisDag, DagStatus};
pub use error::{ProvenanceError, ProvenanceResult};
pub use journal::{JournalEntry, Mutation, MutationJournal};
pub use store::{dag_key, CrossModalEntry, DagRecord, ProvenanceStore};
pub use trace::TraceDirection;
pub use weighting::{ContributionWeighting, FullCredit, InverseFanIn};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
