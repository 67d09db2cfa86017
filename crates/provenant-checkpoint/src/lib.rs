//! Provenant Checkpoint - resumable execution state
//!
//! Checkpoints capture the execution state and partial results of one
//! target (a DAG node at a given [`CheckpointLevel`]) together with the
//! recovery strategy to use from it, and are written atomically: a record, a payload
//! snapshot and a catalog entry. Snapshots of the same target form chains
//! of diffs over a periodic full snapshot; every blob carries its own digest
//! and restores are checked against the recorded content hash.
//!
//! Payload placement is a pure function of level, retention and expected
//! access frequency (see [`select_placement`]).

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod catalog;
pub mod error;
pub mod manager;
pub mod model;
pub mod snapshot;
pub mod tiering;

pub use catalog::{catalog_key, CatalogEntry, CheckpointCatalog};
pub use error::{CheckpointError, CheckpointResult};
pub use manager::{checkpoint_key, snapshot_key, CheckpointConfig, CheckpointManager};
pub use model::{
    AccessFrequency, Checkpoint, CheckpointDependencies, CheckpointLevel, CheckpointOptions,
    CheckpointPayload, CheckpointTarget, RestorationResult, RestoreOptions, SnapshotRef,
};
pub use snapshot::{DiffOp, SnapshotBlob, SnapshotBody, StateDiff};
pub use tiering::{select_placement, Placement};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
