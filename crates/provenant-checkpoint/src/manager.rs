//! Checkpoint manager: atomic checkpoint creation and verified restore
//!
//! A checkpoint is written as record, then payload, then catalog entry. Any
//! failure removes what was already written, so a checkpoint id is either
//! fully visible or not at all.

use crate::catalog::{catalog_key, CatalogEntry, CheckpointCatalog};
use crate::error::{CheckpointError, CheckpointResult};
use crate::model::{
    AccessFrequency, Checkpoint, CheckpointDependencies, CheckpointLevel, CheckpointOptions,
    CheckpointPayload, CheckpointTarget, RestorationResult, RestoreOptions, SnapshotRef,
};
use crate::snapshot::{decode_blob, encode_blob, SnapshotBlob, SnapshotBody, StateDiff};
use crate::tiering::select_placement;
use chrono::Utc;
use dashmap::DashMap;
use moka::future::Cache;
use provenant_dag::{AnalysisDag, ProvenanceError, ProvenanceStore};
use provenant_store::{StatePersistence, StorageLevel};
use provenant_types::{CheckpointId, ContentHash, DagId, NodeId, NodeStatus, SnapshotId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Storage key of a checkpoint record
#[must_use]
pub fn checkpoint_key(id: CheckpointId) -> String {
    format!("{}/{id}", CheckpointId::PREFIX)
}

/// Storage key of a snapshot blob
#[must_use]
pub fn snapshot_key(id: SnapshotId) -> String {
    format!("{}/{id}", SnapshotId::PREFIX)
}

/// Checkpoint manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Longest run of snapshots sharing one full base (the base included)
    pub full_snapshot_interval: u32,
    /// Level for checkpoint records and catalogs
    pub record_level: StorageLevel,
    pub default_retention_secs: u64,
    pub default_access: AccessFrequency,
    /// Write diffs against the previous snapshot of a target
    pub incremental: bool,
    /// Targets whose last snapshot is kept for diffing; a target that
    /// falls out gets a full snapshot next
    pub head_cache_capacity: u64,
    /// Level of the checkpoint taken after each committed step; `"none"`
    /// turns it off
    #[serde(with = "commit_level")]
    pub checkpoint_on_commit: Option<CheckpointLevel>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            full_snapshot_interval: 10,
            record_level: StorageLevel::Database,
            default_retention_secs: 24 * 60 * 60,
            default_access: AccessFrequency::Medium,
            incremental: true,
            head_cache_capacity: 1024,
            checkpoint_on_commit: Some(CheckpointLevel::DagNode),
        }
    }
}

impl CheckpointConfig {
    #[must_use]
    pub fn with_full_snapshot_interval(mut self, interval: u32) -> Self {
        self.full_snapshot_interval = interval.max(1);
        self
    }

    #[must_use]
    pub fn with_record_level(mut self, level: StorageLevel) -> Self {
        self.record_level = level;
        self
    }

    #[must_use]
    pub fn with_incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    #[must_use]
    pub fn with_head_cache_capacity(mut self, capacity: u64) -> Self {
        self.head_cache_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_checkpoint_on_commit(mut self, level: Option<CheckpointLevel>) -> Self {
        self.checkpoint_on_commit = level;
        self
    }

    /// Options used by [`CheckpointManager::create_checkpoint`]
    #[must_use]
    pub fn default_options(&self) -> CheckpointOptions {
        CheckpointOptions::default()
            .with_retention(Duration::from_secs(self.default_retention_secs))
            .with_access(self.default_access)
    }
}

mod commit_level {
    use crate::model::CheckpointLevel;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    enum Repr {
        None,
        #[serde(untagged)]
        Level(CheckpointLevel),
    }

    pub(super) fn serialize<S: Serializer>(
        level: &Option<CheckpointLevel>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match level {
            Some(level) => Repr::Level(*level),
            None => Repr::None,
        }
        .serialize(serializer)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<CheckpointLevel>, D::Error> {
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Level(level) => Some(level),
            Repr::None => None,
        })
    }
}

/// Last snapshot written for a target in this process
#[derive(Debug, Clone)]
struct ChainHead {
    snapshot: SnapshotId,
    depth: u32,
    payload_level: StorageLevel,
    payload: CheckpointPayload,
}

/// Writes already done by an in-flight checkpoint
#[derive(Debug, Default)]
struct Written(Vec<(String, StorageLevel)>);

impl Written {
    async fn compensate(self, persistence: &StatePersistence) {
        for (key, level) in self.0.into_iter().rev() {
            if let Err(e) = persistence.delete(&key, level).await {
                tracing::error!(%key, %level, error = %e, "compensating delete failed");
            }
        }
    }
}

/// Owner of checkpoints, snapshots and catalogs
#[derive(Debug)]
pub struct CheckpointManager {
    provenance: Arc<ProvenanceStore>,
    persistence: StatePersistence,
    config: CheckpointConfig,
    target_locks: DashMap<CheckpointTarget, Arc<Mutex<()>>>,
    catalogs: DashMap<DagId, Arc<Mutex<Option<CheckpointCatalog>>>>,
    heads: Cache<CheckpointTarget, Arc<ChainHead>>,
}

impl CheckpointManager {
    #[must_use]
    pub fn new(
        provenance: Arc<ProvenanceStore>,
        persistence: StatePersistence,
        config: CheckpointConfig,
    ) -> Self {
        Self {
            provenance,
            persistence,
            target_locks: DashMap::new(),
            catalogs: DashMap::new(),
            heads: Cache::builder()
                .max_capacity(config.head_cache_capacity.max(1))
                .build(),
            config,
        }
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn persistence(&self) -> &StatePersistence {
        &self.persistence
    }

    fn target_lock(&self, target: CheckpointTarget) -> Arc<Mutex<()>> {
        Arc::clone(self.target_locks.entry(target).or_default().value())
    }

    fn catalog_slot(&self, dag_id: DagId) -> Arc<Mutex<Option<CheckpointCatalog>>> {
        Arc::clone(self.catalogs.entry(dag_id).or_default().value())
    }

    fn record_levels(&self) -> Vec<StorageLevel> {
        let mut levels = vec![self.config.record_level];
        levels.extend(StorageLevel::ALL.into_iter().filter(|l| *l != self.config.record_level));
        levels
    }

    /// Checkpoint `data` for a node with the configured defaults
    ///
    /// `data` is either a bare execution state or a [`CheckpointPayload`]
    /// that also carries partial results.
    ///
    /// # Errors
    /// See [`Self::create_checkpoint_with`]
    pub async fn create_checkpoint(
        &self,
        dag_id: DagId,
        node_id: NodeId,
        level: CheckpointLevel,
        data: impl Into<CheckpointPayload>,
    ) -> CheckpointResult<CheckpointId> {
        let options = self.config.default_options();
        self.create_checkpoint_with(dag_id, node_id, level, data, options)
            .await
    }

    /// Checkpoint `data` for a node
    ///
    /// Checkpoints of the same target are serialised; different targets run
    /// in parallel.
    ///
    /// # Errors
    /// - `Provenance(UnknownDag | UnknownNode)` if the target does not exist
    /// - `InconsistentState` for a node-level checkpoint of an uncommitted node
    /// - `InvalidPayload` if the payload holds non-finite floats
    /// - `Store` if a write fails; nothing of the checkpoint remains
    pub async fn create_checkpoint_with(
        &self,
        dag_id: DagId,
        node_id: NodeId,
        level: CheckpointLevel,
        data: impl Into<CheckpointPayload>,
        options: CheckpointOptions,
    ) -> CheckpointResult<CheckpointId> {
        self.create_inner(dag_id, node_id, level, data.into(), options)
            .await
    }

    #[tracing::instrument(
        skip(self, data, options),
        fields(keys = data.state.len(), partial = data.partial_results.len())
    )]
    async fn create_inner(
        &self,
        dag_id: DagId,
        node_id: NodeId,
        level: CheckpointLevel,
        data: CheckpointPayload,
        options: CheckpointOptions,
    ) -> CheckpointResult<CheckpointId> {
        let target = CheckpointTarget {
            dag_id,
            node_id,
            level,
        };
        let lock = self.target_lock(target);
        let _guard = lock.lock().await;

        let dag = self.provenance.snapshot(dag_id)?;
        let dependencies = validate_target(&dag, node_id, level)?;
        if let Some(key) = data.unencodable_key() {
            return Err(CheckpointError::InvalidPayload(format!(
                "non-finite number under key {key}"
            )));
        }
        let content_hash = ContentHash::compute_canonical(&data)
            .map_err(|e| CheckpointError::InvalidPayload(e.to_string()))?;

        let placement = select_placement(level, options.retention, options.access);
        let snapshot_id = SnapshotId::new();
        let head = self.heads.get(&target).await;
        let (snapshot, body) = match head {
            Some(head)
                if self.config.incremental
                    && !options.force_full
                    && head.payload_level == placement.payload_level
                    && head.depth + 1 < self.config.full_snapshot_interval =>
            {
                (
                    SnapshotRef::Incremental {
                        snapshot: snapshot_id,
                        parent: head.snapshot,
                        depth: head.depth + 1,
                    },
                    SnapshotBody::Incremental {
                        parent: head.snapshot,
                        diff: StateDiff::between(&head.payload.state, &data.state),
                        partial_diff: StateDiff::between(
                            &head.payload.partial_results,
                            &data.partial_results,
                        ),
                    },
                )
            }
            _ => (
                SnapshotRef::Full {
                    snapshot: snapshot_id,
                },
                SnapshotBody::Full {
                    state: data.state.clone(),
                    partial_results: data.partial_results.clone(),
                },
            ),
        };

        let now = Utc::now();
        let checkpoint = Checkpoint {
            id: CheckpointId::new(),
            target,
            created_at: now,
            content_hash,
            snapshot,
            placement,
            record_level: self.config.record_level,
            dependencies,
            state_keys: data.state.len(),
            partial_result_keys: data.partial_results.len(),
            recovery_strategy: options
                .recovery_strategy
                .unwrap_or_else(|| level.default_recovery_strategy()),
            retention_secs: options.retention.as_secs(),
            access: options.access,
        };
        let blob = SnapshotBlob {
            id: snapshot_id,
            created_at: now,
            body,
        };

        let mut written = Written::default();
        if let Err(e) = self.write_all(&checkpoint, &blob, &mut written).await {
            tracing::warn!(
                %dag_id,
                %node_id,
                checkpoint_id = %checkpoint.id,
                error = %e,
                "checkpoint aborted, removing partial writes"
            );
            written.compensate(&self.persistence).await;
            metrics::counter!("provenant_checkpoints_aborted_total").increment(1);
            return Err(e);
        }

        self.heads
            .insert(
                target,
                Arc::new(ChainHead {
                    snapshot: snapshot_id,
                    depth: snapshot.depth(),
                    payload_level: placement.payload_level,
                    payload: data,
                }),
            )
            .await;
        metrics::counter!(
            "provenant_checkpoints_created_total",
            "level" => level.to_string(),
            "tier" => placement.payload_level.as_str()
        )
        .increment(1);
        tracing::info!(
            %dag_id,
            %node_id,
            checkpoint_id = %checkpoint.id,
            %level,
            tier = %placement.payload_level,
            depth = snapshot.depth(),
            "checkpoint created"
        );
        Ok(checkpoint.id)
    }

    async fn write_all(
        &self,
        checkpoint: &Checkpoint,
        blob: &SnapshotBlob,
        written: &mut Written,
    ) -> CheckpointResult<()> {
        let record_key = checkpoint_key(checkpoint.id);
        written.0.push((record_key.clone(), checkpoint.record_level));
        self.persistence
            .persist(&record_key, serde_json::to_vec(checkpoint)?, checkpoint.record_level)
            .await?;

        let payload = encode_blob(blob, checkpoint.placement.compression)
            .map_err(|e| CheckpointError::InvalidPayload(e.to_string()))?;
        let payload_key = snapshot_key(blob.id);
        written
            .0
            .push((payload_key.clone(), checkpoint.placement.payload_level));
        self.persistence
            .persist(&payload_key, payload, checkpoint.placement.payload_level)
            .await?;

        self.append_to_catalog(checkpoint).await
    }

    async fn append_to_catalog(&self, checkpoint: &Checkpoint) -> CheckpointResult<()> {
        let slot = self.catalog_slot(checkpoint.dag_id());
        let mut cached = slot.lock().await;
        let mut catalog = match cached.take() {
            Some(catalog) => catalog,
            None => self.read_catalog(checkpoint.dag_id()).await?,
        };
        let before = catalog.clone();
        catalog.record(CatalogEntry::for_checkpoint(checkpoint));

        let bytes = serde_json::to_vec(&catalog)?;
        match self
            .persistence
            .persist(&catalog_key(catalog.dag_id), bytes, self.config.record_level)
            .await
        {
            Ok(()) => {
                *cached = Some(catalog);
                Ok(())
            }
            Err(e) => {
                *cached = Some(before);
                Err(e.into())
            }
        }
    }

    async fn read_catalog(&self, dag_id: DagId) -> CheckpointResult<CheckpointCatalog> {
        match self
            .persistence
            .retrieve(&catalog_key(dag_id), &self.record_levels())
            .await
        {
            Ok((bytes, _)) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.is_not_found() => Ok(CheckpointCatalog::new(dag_id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Current catalog of a DAG, loaded from storage on first use
    ///
    /// # Errors
    /// Returns error if the stored catalog cannot be read
    pub async fn catalog(&self, dag_id: DagId) -> CheckpointResult<CheckpointCatalog> {
        let slot = self.catalog_slot(dag_id);
        let mut cached = slot.lock().await;
        if let Some(catalog) = cached.as_ref() {
            return Ok(catalog.clone());
        }
        let catalog = self.read_catalog(dag_id).await?;
        *cached = Some(catalog.clone());
        Ok(catalog)
    }

    /// Every checkpoint of a DAG, oldest first
    ///
    /// # Errors
    /// Returns error if the catalog cannot be read
    pub async fn list_checkpoints(&self, dag_id: DagId) -> CheckpointResult<Vec<CatalogEntry>> {
        Ok(self.catalog(dag_id).await?.entries)
    }

    /// Most recent checkpoint of a DAG
    ///
    /// # Errors
    /// Returns error if the catalog cannot be read
    pub async fn latest_checkpoint(&self, dag_id: DagId) -> CheckpointResult<Option<CatalogEntry>> {
        Ok(self.catalog(dag_id).await?.latest().cloned())
    }

    /// Most recent checkpoint of `node_id` or one of its ancestors
    ///
    /// # Errors
    /// Returns error if the DAG is unknown or the catalog cannot be read
    pub async fn nearest_checkpoint_before(
        &self,
        dag_id: DagId,
        node_id: NodeId,
    ) -> CheckpointResult<Option<CatalogEntry>> {
        let dag = self.provenance.snapshot(dag_id)?;
        let mut lineage = dag.ancestors(node_id);
        lineage.insert(node_id);
        let catalog = self.catalog(dag_id).await?;
        Ok(catalog
            .entries
            .iter()
            .rev()
            .find(|e| lineage.contains(&e.target.node_id))
            .cloned())
    }

    /// Earlier checkpoints of the same target, newest first
    ///
    /// # Errors
    /// `UnknownCheckpoint` if the record does not exist
    pub async fn older_checkpoints(
        &self,
        checkpoint_id: CheckpointId,
    ) -> CheckpointResult<Vec<CatalogEntry>> {
        let checkpoint = self.load_checkpoint(checkpoint_id).await?;
        let catalog = self.catalog(checkpoint.dag_id()).await?;
        Ok(catalog
            .older_than(checkpoint_id)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Read a checkpoint record
    ///
    /// # Errors
    /// `UnknownCheckpoint` if absent, `CheckpointCorruption` if undecodable
    pub async fn load_checkpoint(&self, checkpoint_id: CheckpointId) -> CheckpointResult<Checkpoint> {
        let bytes = match self
            .persistence
            .retrieve(&checkpoint_key(checkpoint_id), &self.record_levels())
            .await
        {
            Ok((bytes, _)) => bytes,
            Err(e) if e.is_not_found() => {
                return Err(CheckpointError::UnknownCheckpoint(checkpoint_id))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|e| CheckpointError::corrupt(checkpoint_id, e))
    }

    /// Rebuild the state captured by a checkpoint
    ///
    /// Reads the snapshot chain back to its full base, applies the diffs in
    /// order and checks the result against the recorded digest.
    ///
    /// # Errors
    /// - `UnknownCheckpoint` if the record does not exist
    /// - `CheckpointCorruption` if a blob or the rebuilt state fails verification
    /// - `DanglingSnapshot` if a parent snapshot is missing
    #[tracing::instrument(skip(self, options))]
    pub async fn restore(
        &self,
        checkpoint_id: CheckpointId,
        options: RestoreOptions,
    ) -> CheckpointResult<RestorationResult> {
        let result = self.restore_inner(checkpoint_id, &options).await;
        match &result {
            Ok(restored) => {
                metrics::counter!("provenant_checkpoints_restored_total").increment(1);
                tracing::info!(
                    %checkpoint_id,
                    served_from = %restored.served_from,
                    chain = restored.chain.len(),
                    "checkpoint restored"
                );
            }
            Err(e) if e.is_integrity_failure() => {
                metrics::counter!("provenant_checkpoint_corruptions_total").increment(1);
                tracing::error!(%checkpoint_id, error = %e, "checkpoint failed verification");
            }
            Err(_) => {}
        }
        result
    }

    async fn restore_inner(
        &self,
        checkpoint_id: CheckpointId,
        options: &RestoreOptions,
    ) -> CheckpointResult<RestorationResult> {
        let checkpoint = self.load_checkpoint(checkpoint_id).await?;

        let mut levels = options.preferred_levels.clone();
        for level in std::iter::once(checkpoint.placement.payload_level).chain(StorageLevel::ALL) {
            if !levels.contains(&level) {
                levels.push(level);
            }
        }

        let mut diffs = Vec::new();
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut served_from = None;
        let mut child = None::<SnapshotId>;
        let mut current = checkpoint.snapshot.snapshot_id();

        let base = loop {
            if !seen.insert(current) {
                return Err(CheckpointError::corrupt(
                    checkpoint_id,
                    format!("snapshot chain loops at {current}"),
                ));
            }
            let (bytes, level) = match self.persistence.retrieve(&snapshot_key(current), &levels).await {
                Ok(found) => found,
                Err(e) if e.is_not_found() => {
                    return Err(match child {
                        Some(snapshot) => CheckpointError::DanglingSnapshot {
                            snapshot,
                            parent: current,
                        },
                        None => CheckpointError::corrupt(
                            checkpoint_id,
                            format!("payload snapshot {current} is missing"),
                        ),
                    })
                }
                Err(e) => return Err(e.into()),
            };
            served_from.get_or_insert(level);

            let blob = decode_blob(&bytes).map_err(|e| CheckpointError::from_blob(checkpoint_id, &e))?;
            if blob.id != current {
                return Err(CheckpointError::corrupt(
                    checkpoint_id,
                    format!("blob at {current} carries id {}", blob.id),
                ));
            }
            chain.push(current);
            match blob.body {
                SnapshotBody::Full {
                    state,
                    partial_results,
                } => break CheckpointPayload::new(state).with_partial_results(partial_results),
                SnapshotBody::Incremental {
                    parent,
                    diff,
                    partial_diff,
                } => {
                    diffs.push((current, diff, partial_diff));
                    child = Some(current);
                    current = parent;
                }
            }
        };

        let mut payload = base;
        for (snapshot, diff, partial_diff) in diffs.iter().rev() {
            diff.apply(&mut payload.state)
                .and_then(|()| partial_diff.apply(&mut payload.partial_results))
                .map_err(|e| CheckpointError::from_diff(checkpoint_id, *snapshot, &e))?;
        }

        let computed = ContentHash::compute_canonical(&payload)
            .map_err(|e| CheckpointError::corrupt(checkpoint_id, e))?;
        if computed != checkpoint.content_hash {
            return Err(CheckpointError::corrupt(
                checkpoint_id,
                format!(
                    "content hash mismatch: recorded {}, rebuilt {}",
                    checkpoint.content_hash.short(),
                    computed.short()
                ),
            ));
        }

        chain.reverse();
        Ok(RestorationResult {
            served_from: served_from.unwrap_or(checkpoint.placement.payload_level),
            checkpoint,
            state: payload.state,
            partial_results: payload.partial_results,
            chain,
        })
    }

    /// Drop every in-process cache entry of a DAG
    ///
    /// Stored checkpoints and the catalog are untouched; the next checkpoint
    /// of any target in the DAG is written as a full snapshot. Call it once
    /// no checkpoint of the DAG is in flight.
    pub async fn forget_dag(&self, dag_id: DagId) {
        self.catalogs.remove(&dag_id);
        self.target_locks.retain(|target, _| target.dag_id != dag_id);
        let stale: Vec<CheckpointTarget> = self
            .heads
            .iter()
            .filter(|(target, _)| target.dag_id == dag_id)
            .map(|(target, _)| *target)
            .collect();
        for target in &stale {
            self.heads.invalidate(target).await;
        }
        tracing::debug!(%dag_id, heads = stale.len(), "checkpoint caches released");
    }

    /// In-process cache sizes: catalogs, target locks, snapshot heads
    pub async fn cached_entries(&self) -> (usize, usize, u64) {
        self.heads.run_pending_tasks().await;
        (
            self.catalogs.len(),
            self.target_locks.len(),
            self.heads.entry_count(),
        )
    }
}

/// Check that a checkpoint target exists and capture its DAG position
fn validate_target(
    dag: &AnalysisDag,
    node_id: NodeId,
    level: CheckpointLevel,
) -> CheckpointResult<CheckpointDependencies> {
    let node = dag.node(node_id).ok_or(ProvenanceError::UnknownNode {
        dag: dag.id(),
        node: node_id,
    })?;
    if level == CheckpointLevel::DagNode && node.status != NodeStatus::Committed {
        return Err(CheckpointError::InconsistentState {
            dag: dag.id(),
            node: node_id,
            status: node.status,
        });
    }

    let (completed, pending) = dag.ancestors(node_id).into_iter().partition(|id| {
        dag.node(*id)
            .is_some_and(|n| n.status == NodeStatus::Committed)
    });
    Ok(CheckpointDependencies {
        completed,
        pending,
        downstream_affected: dag.descendants(node_id).into_iter().collect(),
    })
}
