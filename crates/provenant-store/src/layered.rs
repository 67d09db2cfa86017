//! Multi-tier persistence with read fall-through
//!
//! [`StatePersistence`] routes writes to one named level and reads through a
//! preference list, trying the next level on a miss. Every tier call is
//! bounded by the configured timeout.
//!
//! A write that times out keeps running in the background. Later writes and
//! deletes of the same key wait for it first, so a delete issued after a
//! timed-out write is never overtaken by it.

use crate::database::DatabaseStore;
use crate::error::{StoreError, StoreResult};
use crate::file::FileStore;
use crate::memory::MemoryStore;
use crate::tier::{StateStore, StorageLevel};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

type LateWrites = Mutex<HashMap<(StorageLevel, String), JoinHandle<StoreResult<()>>>>;

/// Persistence tier configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory for the local-disk tier and the database file
    pub root: PathBuf,
    /// Archive root; defaults to `<root>/archive`
    pub archive_root: Option<PathBuf>,
    /// Database file name under `root`
    pub database_file: String,
    /// Memory tier capacity (entries)
    pub memory_capacity: u64,
    /// Memory tier TTL in seconds
    pub memory_ttl_secs: u64,
    /// Bound on each tier call in milliseconds
    pub operation_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./provenant-state"),
            archive_root: None,
            database_file: "state.db".to_string(),
            memory_capacity: 10_000,
            memory_ttl_secs: 3600,
            operation_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    /// Config rooted at `root`
    #[must_use]
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_archive_root(mut self, archive_root: impl Into<PathBuf>) -> Self {
        self.archive_root = Some(archive_root.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    #[inline]
    #[must_use]
    pub fn memory_ttl(&self) -> Duration {
        Duration::from_secs(self.memory_ttl_secs)
    }

    #[must_use]
    pub fn archive_dir(&self) -> PathBuf {
        self.archive_root
            .clone()
            .unwrap_or_else(|| self.root.join("archive"))
    }
}

/// Tiered state persistence
#[derive(Clone)]
pub struct StatePersistence {
    tiers: HashMap<StorageLevel, Arc<dyn StateStore>>,
    timeout: Duration,
    late_writes: Arc<LateWrites>,
}

impl std::fmt::Debug for StatePersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut levels: Vec<_> = self.tiers.keys().copied().collect();
        levels.sort();
        f.debug_struct("StatePersistence")
            .field("levels", &levels)
            .field("timeout", &self.timeout)
            .field("late_writes", &self.late_writes.lock().len())
            .finish()
    }
}

impl StatePersistence {
    /// Empty persistence; register tiers with [`Self::with_tier`]
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            tiers: HashMap::new(),
            timeout,
            late_writes: Arc::default(),
        }
    }

    /// Register `store` for its level, replacing any previous one
    #[must_use]
    pub fn with_tier(mut self, store: Arc<dyn StateStore>) -> Self {
        self.tiers.insert(store.level(), store);
        self
    }

    /// All four levels on disk under the configured roots
    ///
    /// # Errors
    /// Returns error if the directories or database cannot be created
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        std::fs::create_dir_all(&config.root)?;
        let archive = config.archive_dir();
        std::fs::create_dir_all(&archive)?;
        let database = DatabaseStore::open(config.root.join(&config.database_file))?;

        tracing::info!(
            root = %config.root.display(),
            archive = %archive.display(),
            "opened state persistence"
        );

        Ok(Self::new(config.operation_timeout())
            .with_tier(Arc::new(MemoryStore::with_ttl(
                config.memory_capacity,
                config.memory_ttl(),
            )))
            .with_tier(Arc::new(FileStore::local(config.root.join("local"))))
            .with_tier(Arc::new(database))
            .with_tier(Arc::new(FileStore::archive(archive))))
    }

    /// Every level served from process memory; nothing survives a restart
    #[must_use]
    pub fn ephemeral() -> Self {
        StorageLevel::ALL
            .into_iter()
            .fold(Self::new(Duration::from_secs(5)), |p, level| {
                p.with_tier(Arc::new(MemoryStore::new(100_000).standing_in_for(level)))
            })
    }

    /// Configured levels, fastest first
    #[must_use]
    pub fn levels(&self) -> Vec<StorageLevel> {
        StorageLevel::ALL
            .into_iter()
            .filter(|l| self.tiers.contains_key(l))
            .collect()
    }

    fn tier(&self, level: StorageLevel) -> StoreResult<&Arc<dyn StateStore>> {
        self.tiers.get(&level).ok_or(StoreError::TierUnavailable(level))
    }

    async fn bounded<T>(
        &self,
        level: StorageLevel,
        operation: &'static str,
        fut: impl Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(self.timed_out(level, operation)),
        }
    }

    fn timed_out(&self, level: StorageLevel, operation: &'static str) -> StoreError {
        metrics::counter!("provenant_store_timeouts_total", "level" => level.as_str()).increment(1);
        StoreError::Timeout {
            level,
            operation,
            after: self.timeout,
        }
    }

    /// Wait for a timed-out write of `state_id` at `level` to land
    ///
    /// A write still running after another timeout stays tracked and the
    /// caller gets `Timeout`.
    async fn settle_late_write(
        &self,
        state_id: &str,
        level: StorageLevel,
        operation: &'static str,
    ) -> StoreResult<()> {
        let slot = (level, state_id.to_string());
        let pending = self.late_writes.lock().remove(&slot);
        let Some(mut write) = pending else {
            return Ok(());
        };
        match tokio::time::timeout(self.timeout, &mut write).await {
            Ok(landed) => {
                tracing::debug!(state_id, %level, ok = matches!(landed, Ok(Ok(()))), "late write settled");
                Ok(())
            }
            Err(_) => {
                self.late_writes.lock().insert(slot, write);
                Err(self.timed_out(level, operation))
            }
        }
    }

    /// Write `data` under `state_id` at `level`
    ///
    /// # Errors
    /// Returns error if the level is not configured, the tier fails or the
    /// call exceeds the timeout. A timed-out write may still land later.
    #[tracing::instrument(skip(self, data), fields(bytes = data.len()))]
    pub async fn persist(&self, state_id: &str, data: Vec<u8>, level: StorageLevel) -> StoreResult<()> {
        let tier = Arc::clone(self.tier(level)?);
        self.settle_late_write(state_id, level, "persist").await?;

        let key = state_id.to_string();
        let mut write = tokio::spawn(async move { tier.put(&key, data).await });
        match tokio::time::timeout(self.timeout, &mut write).await {
            Ok(joined) => joined??,
            Err(_) => {
                tracing::warn!(state_id, %level, "write timed out, tracking it until it lands");
                {
                    let mut late = self.late_writes.lock();
                    late.retain(|_, w| !w.is_finished());
                    late.insert((level, state_id.to_string()), write);
                }
                return Err(self.timed_out(level, "persist"));
            }
        }
        metrics::counter!("provenant_store_writes_total", "level" => level.as_str()).increment(1);
        Ok(())
    }

    /// Read `state_id`, trying `preferred` levels in order
    ///
    /// Unconfigured levels are skipped. Returns the bytes and the level that
    /// served them.
    ///
    /// # Errors
    /// Returns [`StoreError::StateNotFound`] if every consulted tier missed,
    /// or the first tier error if a tier failed and no later tier had the key
    #[tracing::instrument(skip(self))]
    pub async fn retrieve(
        &self,
        state_id: &str,
        preferred: &[StorageLevel],
    ) -> StoreResult<(Vec<u8>, StorageLevel)> {
        let mut tried = Vec::with_capacity(preferred.len());
        let mut first_error = None;

        for &level in preferred {
            let Some(tier) = self.tiers.get(&level) else {
                continue;
            };
            tried.push(level);
            match self.bounded(level, "retrieve", tier.get(state_id)).await {
                Ok(Some(bytes)) => {
                    metrics::counter!("provenant_store_hits_total", "level" => level.as_str())
                        .increment(1);
                    return Ok((bytes, level));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(%level, error = %e, "tier read failed, falling through");
                    first_error.get_or_insert(e);
                }
            }
        }

        Err(first_error.unwrap_or(StoreError::StateNotFound {
            state_id: state_id.to_string(),
            tried,
        }))
    }

    /// Read `state_id` from whichever level has it, fastest first
    ///
    /// # Errors
    /// See [`Self::retrieve`]
    pub async fn retrieve_any(&self, state_id: &str) -> StoreResult<(Vec<u8>, StorageLevel)> {
        self.retrieve(state_id, &StorageLevel::ALL).await
    }

    /// Remove `state_id` from `level`; returns whether it existed
    ///
    /// Runs after any timed-out write of the same key has landed.
    ///
    /// # Errors
    /// Returns error if the level is not configured, the tier fails or a
    /// timed-out write of the key is still running
    pub async fn delete(&self, state_id: &str, level: StorageLevel) -> StoreResult<bool> {
        let tier = self.tier(level)?;
        self.settle_late_write(state_id, level, "delete").await?;
        self.bounded(level, "delete", tier.delete(state_id)).await
    }

    /// Remove `state_id` from every configured level
    ///
    /// # Errors
    /// Returns the first tier error; remaining levels are still attempted
    pub async fn delete_everywhere(&self, state_id: &str) -> StoreResult<bool> {
        let mut existed = false;
        let mut first_error = None;
        for level in self.levels() {
            match self.delete(state_id, level).await {
                Ok(found) => existed |= found,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(existed),
        }
    }

    /// Whether `state_id` exists at `level`
    ///
    /// # Errors
    /// Returns error if the level is not configured or the tier fails
    pub async fn exists(&self, state_id: &str, level: StorageLevel) -> StoreResult<bool> {
        let tier = self.tier(level)?;
        self.bounded(level, "exists", tier.contains(state_id)).await
    }
}
