//! Provenant Store - tiered state persistence
//!
//! Four storage levels behind one [`StateStore`] contract:
//! - [`StorageLevel::Memory`]: moka cache with TTL
//! - [`StorageLevel::LocalDisk`]: atomic file writes
//! - [`StorageLevel::Database`]: SQLite in WAL mode
//! - [`StorageLevel::Archive`]: file tier under a separate root
//!
//! [`StatePersistence`] routes writes to a level and reads through a
//! preference list with per-call timeouts.

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod compression;
pub mod database;
pub mod error;
pub mod file;
pub mod layered;
pub mod memory;
pub mod tier;

pub use compression::Compression;
pub use database::DatabaseStore;
pub use error::{StoreError, StoreResult};
pub use file::FileStore;
pub use layered::{StatePersistence, StoreConfig};
pub use memory::MemoryStore;
pub use tier::{RetentionGuarantee, StateStore, StorageLevel};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
