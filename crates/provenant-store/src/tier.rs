//! Storage levels and the per-tier store contract

use crate::error::StoreResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a piece of state lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageLevel {
    /// In-process cache, lost on restart
    Memory,
    /// Files on the local host
    LocalDisk,
    /// Embedded relational store
    Database,
    /// Long-term cold storage
    Archive,
}

/// How long a level keeps what it was given
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionGuarantee {
    /// Until eviction, expiry or process exit
    Volatile,
    /// Survives process restarts on the same host
    Durable,
    /// Survives restarts; intended for months or longer
    LongTerm,
}

impl StorageLevel {
    /// Every level, fastest first
    pub const ALL: [StorageLevel; 4] = [
        StorageLevel::Memory,
        StorageLevel::LocalDisk,
        StorageLevel::Database,
        StorageLevel::Archive,
    ];

    #[must_use]
    pub fn retention(self) -> RetentionGuarantee {
        match self {
            Self::Memory => RetentionGuarantee::Volatile,
            Self::LocalDisk | Self::Database => RetentionGuarantee::Durable,
            Self::Archive => RetentionGuarantee::LongTerm,
        }
    }

    /// Survives a process restart
    #[inline]
    #[must_use]
    pub fn is_durable(self) -> bool {
        self.retention() != RetentionGuarantee::Volatile
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::LocalDisk => "local_disk",
            Self::Database => "database",
            Self::Archive => "archive",
        }
    }
}

impl fmt::Display for StorageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One storage tier
///
/// Implementations store opaque bytes under string keys. Writes of an
/// existing key replace it atomically.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Level this store serves
    fn level(&self) -> StorageLevel;

    /// Store `data` under `key`
    async fn put(&self, key: &str, data: Vec<u8>) -> StoreResult<()>;

    /// Fetch the bytes under `key`, `None` on a miss
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Remove `key`; returns whether it existed
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Check for `key` without fetching it
    async fn contains(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key).await?.is_some())
    }
}
