use async_trait::async_trait;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use provenant_checkpoint::{
    checkpoint_key, snapshot_key, AccessFrequency, CheckpointConfig, CheckpointError,
    CheckpointLevel, CheckpointManager, CheckpointOptions, CheckpointPayload, RestoreOptions,
    SnapshotRef,
};
use provenant_dag::{ProvenanceError, ProvenanceStore};
use provenant_store::{
    MemoryStore, StatePersistence, StateStore, StorageLevel, StoreConfig, StoreError, StoreResult,
};
use provenant_types::{
    AnalysisNode, AnalysisType, DagId, DataReference, NodeId, RecoveryStrategy, StateMap,
    StrategyKind, Value,
};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn state(pairs: &[(&str, i64)]) -> StateMap {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), Value::Int(*v)))
        .collect()
}

/// Two-node DAG `a -> b`; `a` committed, `b` running
async fn two_nodes(store: &ProvenanceStore) -> (DagId, NodeId, NodeId) {
    let d1 = DataReference::document("d1");
    let dag = store.create_dag(vec![d1.clone()]).await.unwrap();
    let a = store
        .add_node(
            dag,
            AnalysisNode::new(AnalysisType::SourceIngestion, "loader")
                .with_inputs([d1.clone()])
                .with_outputs([d1]),
            &[],
        )
        .await
        .unwrap();
    store.commit_node(dag, a, None).await.unwrap();
    let b = store
        .add_node(dag, AnalysisNode::new(AnalysisType::Extraction, "ner"), &[a])
        .await
        .unwrap();
    (dag, a, b)
}

fn manager(config: CheckpointConfig) -> (Arc<ProvenanceStore>, StatePersistence, CheckpointManager) {
    let provenance = Arc::new(ProvenanceStore::new());
    let persistence = StatePersistence::ephemeral();
    let manager = CheckpointManager::new(Arc::clone(&provenance), persistence.clone(), config);
    (provenance, persistence, manager)
}

#[tokio::test]
async fn test_round_trip_and_dependencies() {
    let (store, _, manager) = manager(CheckpointConfig::default());
    let (dag, a, b) = two_nodes(&store).await;

    let data = state(&[("rows", 120), ("cursor", 7)]);
    let id = manager
        .create_checkpoint(dag, a, CheckpointLevel::DagNode, data.clone())
        .await
        .unwrap();

    let restored = manager.restore(id, RestoreOptions::default()).await.unwrap();
    assert_eq!(restored.state, data);
    assert_eq!(restored.chain.len(), 1);
    assert_eq!(restored.checkpoint.dependencies.downstream_affected, vec![b]);
    assert!(restored.completed_nodes().is_empty());

    let partial = manager
        .create_checkpoint(dag, b, CheckpointLevel::DataPartition, state(&[("page", 3)]))
        .await
        .unwrap();
    let restored = manager.restore(partial, RestoreOptions::default()).await.unwrap();
    assert_eq!(restored.completed_nodes(), &[a]);
    assert!(restored.pending_nodes().is_empty());
}

#[tokio::test]
async fn test_rejects_inconsistent_targets() {
    let (store, _, manager) = manager(CheckpointConfig::default());
    let (dag, _, b) = two_nodes(&store).await;

    let err = manager
        .create_checkpoint(dag, b, CheckpointLevel::DagNode, StateMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CheckpointError::InconsistentState { .. }));

    let err = manager
        .create_checkpoint(DagId::new(), b, CheckpointLevel::Analysis, StateMap::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CheckpointError::Provenance(ProvenanceError::UnknownDag(_))
    ));

    let err = manager
        .create_checkpoint(dag, NodeId::new(), CheckpointLevel::Element, StateMap::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CheckpointError::Provenance(ProvenanceError::UnknownNode { .. })
    ));

    let mut bad = StateMap::new();
    bad.insert("score".into(), Value::Float(f64::NAN));
    let err = manager
        .create_checkpoint(dag, b, CheckpointLevel::Element, bad)
        .await
        .unwrap_err();
    assert!(matches!(err, CheckpointError::InvalidPayload(_)));
    assert!(manager.list_checkpoints(dag).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_incremental_chain_resets_at_interval() {
    let (store, _, manager) =
        manager(CheckpointConfig::default().with_full_snapshot_interval(3));
    let (dag, _, b) = two_nodes(&store).await;

    let states = [
        state(&[("a", 1)]),
        state(&[("a", 1), ("b", 2)]),
        state(&[("b", 3)]),
        state(&[("b", 3), ("c", 4)]),
    ];
    let mut ids = Vec::new();
    for s in &states {
        ids.push(
            manager
                .create_checkpoint(dag, b, CheckpointLevel::DataPartition, s.clone())
                .await
                .unwrap(),
        );
    }

    let depths: Vec<u32> = {
        let mut depths = Vec::new();
        for id in &ids {
            depths.push(manager.load_checkpoint(*id).await.unwrap().snapshot.depth());
        }
        depths
    };
    assert_eq!(depths, vec![0, 1, 2, 0]);

    for (id, expected) in ids.iter().zip(&states) {
        let restored = manager.restore(*id, RestoreOptions::default()).await.unwrap();
        assert_eq!(&restored.state, expected);
    }
    let third = manager.restore(ids[2], RestoreOptions::default()).await.unwrap();
    assert_eq!(third.chain, {
        let mut chain = Vec::new();
        for id in &ids[..3] {
            chain.push(manager.load_checkpoint(*id).await.unwrap().snapshot.snapshot_id());
        }
        chain
    });
}

#[tokio::test]
async fn test_forced_full_and_placement_change_break_chain() {
    let (store, _, manager) = manager(CheckpointConfig::default());
    let (dag, _, b) = two_nodes(&store).await;

    let first = manager
        .create_checkpoint(dag, b, CheckpointLevel::Element, state(&[("x", 1)]))
        .await
        .unwrap();
    let forced = manager
        .create_checkpoint_with(
            dag,
            b,
            CheckpointLevel::Element,
            state(&[("x", 2)]),
            CheckpointOptions::default().full(),
        )
        .await
        .unwrap();
    let hot = manager
        .create_checkpoint_with(
            dag,
            b,
            CheckpointLevel::Element,
            state(&[("x", 3)]),
            CheckpointOptions::default()
                .with_access(AccessFrequency::High)
                .with_retention(Duration::from_secs(60)),
        )
        .await
        .unwrap();

    for id in [first, forced, hot] {
        let record = manager.load_checkpoint(id).await.unwrap();
        assert!(matches!(record.snapshot, SnapshotRef::Full { .. }));
    }
    let restored = manager.restore(hot, RestoreOptions::default()).await.unwrap();
    assert_eq!(restored.served_from, StorageLevel::Memory);
}

#[tokio::test]
async fn test_bit_flip_is_detected() {
    let (store, persistence, manager) = manager(CheckpointConfig::default());
    let (dag, a, _) = two_nodes(&store).await;
    let id = manager
        .create_checkpoint(dag, a, CheckpointLevel::DagNode, state(&[("rows", 5)]))
        .await
        .unwrap();

    let record = manager.load_checkpoint(id).await.unwrap();
    let key = snapshot_key(record.snapshot.snapshot_id());
    let level = record.placement.payload_level;
    let (mut bytes, _) = persistence.retrieve(&key, &[level]).await.unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x40;
    persistence.persist(&key, bytes, level).await.unwrap();

    let err = manager.restore(id, RestoreOptions::default()).await.unwrap_err();
    assert!(matches!(err, CheckpointError::CheckpointCorruption { .. }));
    assert!(err.is_integrity_failure());
}

#[tokio::test]
async fn test_missing_parent_is_dangling() {
    let (store, persistence, manager) = manager(CheckpointConfig::default());
    let (dag, _, b) = two_nodes(&store).await;

    let base = manager
        .create_checkpoint(dag, b, CheckpointLevel::Element, state(&[("x", 1)]))
        .await
        .unwrap();
    let child = manager
        .create_checkpoint(dag, b, CheckpointLevel::Element, state(&[("x", 2)]))
        .await
        .unwrap();

    let base_snapshot = manager.load_checkpoint(base).await.unwrap().snapshot.snapshot_id();
    persistence
        .delete_everywhere(&snapshot_key(base_snapshot))
        .await
        .unwrap();

    let err = manager.restore(child, RestoreOptions::default()).await.unwrap_err();
    match err {
        CheckpointError::DanglingSnapshot { parent, .. } => assert_eq!(parent, base_snapshot),
        other => panic!("expected dangling snapshot, got {other:?}"),
    }
}

#[tokio::test]
async fn test_supersession_and_rollback_queries() {
    let (store, _, manager) = manager(CheckpointConfig::default());
    let (dag, a, b) = two_nodes(&store).await;

    let a1 = manager
        .create_checkpoint(dag, a, CheckpointLevel::DagNode, state(&[("v", 1)]))
        .await
        .unwrap();
    let a2 = manager
        .create_checkpoint(dag, a, CheckpointLevel::DagNode, state(&[("v", 2)]))
        .await
        .unwrap();

    let entries = manager.list_checkpoints(dag).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].superseded_by, Some(a2));
    assert!(manager.restore(a1, RestoreOptions::default()).await.is_ok());

    let older: Vec<_> = manager
        .older_checkpoints(a2)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.checkpoint_id)
        .collect();
    assert_eq!(older, vec![a1]);

    let nearest = manager.nearest_checkpoint_before(dag, b).await.unwrap().unwrap();
    assert_eq!(nearest.checkpoint_id, a2);
    assert_eq!(manager.latest_checkpoint(dag).await.unwrap().unwrap().checkpoint_id, a2);

    let err = manager
        .restore(provenant_types::CheckpointId::new(), RestoreOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CheckpointError::UnknownCheckpoint(_)));
}

/// Tier that tracks live keys and can refuse writes under one prefix
struct Tracking {
    level: StorageLevel,
    refuse: Option<&'static str>,
    keys: Mutex<BTreeSet<String>>,
}

impl Tracking {
    fn new(level: StorageLevel, refuse: Option<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            level,
            refuse,
            keys: Mutex::new(BTreeSet::new()),
        })
    }

    fn live(&self) -> BTreeSet<String> {
        self.keys.lock().unwrap().clone()
    }
}

#[async_trait]
impl StateStore for Tracking {
    fn level(&self) -> StorageLevel {
        self.level
    }

    async fn put(&self, key: &str, _data: Vec<u8>) -> StoreResult<()> {
        if self.refuse.is_some_and(|prefix| key.starts_with(prefix)) {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        self.keys.lock().unwrap().insert(key.to_string());
        Ok(())
    }

    async fn get(&self, _key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        Ok(self.keys.lock().unwrap().remove(key))
    }
}

#[tokio::test]
async fn test_failed_catalog_update_leaves_nothing_behind() {
    let local = Tracking::new(StorageLevel::LocalDisk, None);
    let database = Tracking::new(StorageLevel::Database, Some("catalog/"));
    let persistence = StatePersistence::new(Duration::from_secs(1))
        .with_tier(Arc::new(MemoryStore::new(64)))
        .with_tier(local.clone())
        .with_tier(database.clone());

    let provenance = Arc::new(ProvenanceStore::new());
    let manager =
        CheckpointManager::new(Arc::clone(&provenance), persistence, CheckpointConfig::default());
    let (dag, a, _) = two_nodes(&provenance).await;

    let err = manager
        .create_checkpoint(dag, a, CheckpointLevel::DagNode, state(&[("v", 1)]))
        .await
        .unwrap_err();
    assert!(matches!(err, CheckpointError::Store(StoreError::Io(_))));
    assert!(err.is_retryable());

    assert!(local.live().is_empty());
    assert!(database.live().is_empty());
    assert!(manager.list_checkpoints(dag).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_targets() {
    let (store, _, manager) = manager(CheckpointConfig::default());
    let manager = Arc::new(manager);
    let dag = store.create_dag(vec![]).await.unwrap();
    let mut nodes = Vec::new();
    for i in 0..4 {
        let id = store
            .add_node(dag, AnalysisNode::new(AnalysisType::Analysis, format!("t{i}")), &[])
            .await
            .unwrap();
        nodes.push(id);
    }

    let mut tasks = Vec::new();
    for (i, node) in nodes.iter().copied().enumerate() {
        for round in 0..5_i64 {
            let manager = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move {
                manager
                    .create_checkpoint(
                        dag,
                        node,
                        CheckpointLevel::Element,
                        state(&[("node", i as i64), ("round", round)]),
                    )
                    .await
            }));
        }
    }
    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().unwrap());
    }

    let entries = manager.list_checkpoints(dag).await.unwrap();
    assert_eq!(entries.len(), 20);
    for node in &nodes {
        let current = entries
            .iter()
            .filter(|e| e.target.node_id == *node && e.is_current())
            .count();
        assert_eq!(current, 1);
    }
    for id in ids {
        assert!(manager.restore(id, RestoreOptions::default()).await.is_ok());
    }
}

#[tokio::test]
async fn test_restore_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::at(dir.path());

    let (dag, a, id) = {
        let persistence = StatePersistence::open(&config).unwrap();
        let provenance = Arc::new(
            ProvenanceStore::new().with_persistence(persistence.clone(), StorageLevel::Database),
        );
        let manager =
            CheckpointManager::new(Arc::clone(&provenance), persistence, CheckpointConfig::default());
        let (dag, a, _) = two_nodes(&provenance).await;
        manager
            .create_checkpoint(dag, a, CheckpointLevel::DagNode, state(&[("v", 1)]))
            .await
            .unwrap();
        let id = manager
            .create_checkpoint(dag, a, CheckpointLevel::DagNode, state(&[("v", 2)]))
            .await
            .unwrap();
        (dag, a, id)
    };

    let persistence = StatePersistence::open(&config).unwrap();
    let provenance = Arc::new(
        ProvenanceStore::new().with_persistence(persistence.clone(), StorageLevel::Database),
    );
    provenance.load_dag(dag).await.unwrap();
    let manager = CheckpointManager::new(Arc::clone(&provenance), persistence, CheckpointConfig::default());

    let latest = manager.latest_checkpoint(dag).await.unwrap().unwrap();
    assert_eq!(latest.checkpoint_id, id);
    let restored = manager.restore(id, RestoreOptions::default()).await.unwrap();
    assert_eq!(restored.state, state(&[("v", 2)]));
    assert_eq!(restored.chain.len(), 2);

    let next = manager
        .create_checkpoint(dag, a, CheckpointLevel::DagNode, state(&[("v", 3)]))
        .await
        .unwrap();
    let record = manager.load_checkpoint(next).await.unwrap();
    assert!(matches!(record.snapshot, SnapshotRef::Full { .. }));
    assert!(checkpoint_key(next).starts_with("checkpoint/"));
}

#[tokio::test]
async fn test_strategy_and_partial_results_survive_restore() {
    let (store, _, manager) = manager(CheckpointConfig::default());
    let (dag, _, b) = two_nodes(&store).await;

    let first = CheckpointPayload::new(state(&[("page", 1)]))
        .with_partial_results(state(&[("chunk_0", 10)]));
    manager
        .create_checkpoint(dag, b, CheckpointLevel::DataPartition, first)
        .await
        .unwrap();

    // second write is a diff over both maps
    let second = CheckpointPayload::new(state(&[("page", 2)]))
        .with_partial_results(state(&[("chunk_0", 10), ("chunk_1", 11)]));
    let strategy = RecoveryStrategy::retry(5, Duration::from_millis(250));
    let id = manager
        .create_checkpoint_with(
            dag,
            b,
            CheckpointLevel::DataPartition,
            second.clone(),
            CheckpointOptions::default().with_recovery_strategy(strategy.clone()),
        )
        .await
        .unwrap();

    let restored = manager.restore(id, RestoreOptions::default()).await.unwrap();
    assert!(matches!(restored.checkpoint.snapshot, SnapshotRef::Incremental { .. }));
    assert_eq!(restored.state, second.state);
    assert_eq!(restored.partial_results, second.partial_results);
    assert_eq!(restored.recovery_strategy(), &strategy);
    assert_eq!(restored.checkpoint.state_keys, 1);
    assert_eq!(restored.checkpoint.partial_result_keys, 2);
}

#[tokio::test]
async fn test_recovery_strategy_defaults_by_level() {
    let (store, _, manager) = manager(CheckpointConfig::default());
    let (dag, a, b) = two_nodes(&store).await;

    let node = manager
        .create_checkpoint(dag, a, CheckpointLevel::DagNode, StateMap::new())
        .await
        .unwrap();
    let element = manager
        .create_checkpoint(dag, b, CheckpointLevel::Element, StateMap::new())
        .await
        .unwrap();

    let node = manager.load_checkpoint(node).await.unwrap();
    assert_eq!(node.recovery_strategy.kind, StrategyKind::Rollback);
    let element = manager.load_checkpoint(element).await.unwrap();
    assert_eq!(element.recovery_strategy.kind, StrategyKind::Retry);
    assert_eq!(element.recovery_strategy.max_attempts, 3);
}

#[tokio::test]
async fn test_partial_results_are_part_of_the_digest() {
    let (store, persistence, manager) = manager(CheckpointConfig::default());
    let (dag, a, _) = two_nodes(&store).await;
    let id = manager
        .create_checkpoint(
            dag,
            a,
            CheckpointLevel::DagNode,
            CheckpointPayload::new(state(&[("rows", 5)])).with_partial_results(state(&[("e", 1)])),
        )
        .await
        .unwrap();

    // a record claiming the same payload without partial results no longer verifies
    let mut record = manager.load_checkpoint(id).await.unwrap();
    record.content_hash =
        provenant_types::ContentHash::compute_canonical(&state(&[("rows", 5)])).unwrap();
    persistence
        .persist(&checkpoint_key(id), serde_json::to_vec(&record).unwrap(), record.record_level)
        .await
        .unwrap();
    let err = manager.restore(id, RestoreOptions::default()).await.unwrap_err();
    assert!(err.is_integrity_failure());
}

#[tokio::test]
async fn test_forget_dag_drops_caches_but_keeps_checkpoints() {
    let (store, _, manager) = manager(CheckpointConfig::default());
    let (dag, a, b) = two_nodes(&store).await;
    let (other, other_a, _) = two_nodes(&store).await;

    for v in 1..=2 {
        manager
            .create_checkpoint(dag, a, CheckpointLevel::DagNode, state(&[("v", v)]))
            .await
            .unwrap();
    }
    manager
        .create_checkpoint(dag, b, CheckpointLevel::Element, state(&[("x", 1)]))
        .await
        .unwrap();
    manager
        .create_checkpoint(other, other_a, CheckpointLevel::DagNode, state(&[("v", 1)]))
        .await
        .unwrap();
    assert_eq!(manager.cached_entries().await, (2, 3, 3));

    manager.forget_dag(dag).await;
    assert_eq!(manager.cached_entries().await, (1, 1, 1));

    // the stored catalog is reloaded, and the next snapshot starts a new chain
    assert_eq!(manager.list_checkpoints(dag).await.unwrap().len(), 3);
    let next = manager
        .create_checkpoint(dag, a, CheckpointLevel::DagNode, state(&[("v", 3)]))
        .await
        .unwrap();
    let record = manager.load_checkpoint(next).await.unwrap();
    assert!(matches!(record.snapshot, SnapshotRef::Full { .. }));
    assert_eq!(manager.list_checkpoints(dag).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_head_cache_is_bounded() {
    let (store, _, manager) =
        manager(CheckpointConfig::default().with_head_cache_capacity(4));
    let (dag, _, b) = two_nodes(&store).await;

    // every element level write is its own target
    let mut nodes = Vec::new();
    for i in 0..16 {
        let node = store
            .add_node(
                dag,
                AnalysisNode::new(AnalysisType::Extraction, format!("worker-{i}")),
                &[b],
            )
            .await
            .unwrap();
        manager
            .create_checkpoint(dag, node, CheckpointLevel::Element, state(&[("i", i)]))
            .await
            .unwrap();
        nodes.push(node);
    }

    let (_, _, heads) = manager.cached_entries().await;
    assert!(heads <= 4, "head cache holds {heads} entries");
    for node in nodes {
        let latest = manager.nearest_checkpoint_before(dag, node).await.unwrap().unwrap();
        assert!(manager.restore(latest.checkpoint_id, RestoreOptions::default()).await.is_ok());
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn arb_state() -> impl Strategy<Value = StateMap> {
    proptest::collection::btree_map(
        "[a-e]{1,2}",
        prop_oneof![
            any::<i64>().prop_map(Value::Int),
            "[a-z]{0,6}".prop_map(Value::Text),
            any::<bool>().prop_map(Value::Bool),
        ],
        0..10,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_incremental_restore_matches_every_checkpoint(
        states in proptest::collection::vec(arb_state(), 1..12),
        interval in 1u32..6,
    ) {
        runtime().block_on(async {
            let (store, _, manager) =
                manager(CheckpointConfig::default().with_full_snapshot_interval(interval));
            let (dag, _, b) = two_nodes(&store).await;

            let mut ids = Vec::new();
            for s in &states {
                ids.push(
                    manager
                        .create_checkpoint(dag, b, CheckpointLevel::DataPartition, s.clone())
                        .await
                        .unwrap(),
                );
            }
            for (id, expected) in ids.iter().zip(&states) {
                let restored = manager.restore(*id, RestoreOptions::default()).await.unwrap();
                prop_assert_eq!(&restored.state, expected);
                prop_assert!(restored.checkpoint.snapshot.depth() < interval);
            }
            Ok(())
        })?;
    }
}
