//! In-process tier backed by a moka cache

use crate::error::StoreResult;
use crate::tier::{StateStore, StorageLevel};
use async_trait::async_trait;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

/// Concurrent cache tier with optional TTL
///
/// Entries may be evicted under capacity pressure or on expiry.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Cache<String, Arc<Vec<u8>>>,
    level: StorageLevel,
}

impl MemoryStore {
    /// Cache holding at most `max_capacity` entries
    #[inline]
    #[must_use]
    pub fn new(max_capacity: u64) -> Self {
        Self {
            inner: Cache::new(max_capacity),
            level: StorageLevel::Memory,
        }
    }

    /// Cache whose entries expire `ttl` after insertion
    #[inline]
    #[must_use]
    pub fn with_ttl(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
            level: StorageLevel::Memory,
        }
    }

    /// Serve another level from memory (tests and ephemeral setups)
    #[must_use]
    pub fn standing_in_for(mut self, level: StorageLevel) -> Self {
        self.level = level;
        self
    }

    /// Approximate entry count
    #[inline]
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    fn level(&self) -> StorageLevel {
        self.level
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> StoreResult<()> {
        self.inner.insert(key.to_string(), Arc::new(data)).await;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.inner.get(key).await.map(|v| v.as_ref().clone()))
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        Ok(self.inner.remove(key).await.is_some())
    }

    async fn contains(&self, key: &str) -> StoreResult<bool> {
        Ok(self.inner.contains_key(key))
    }
}
