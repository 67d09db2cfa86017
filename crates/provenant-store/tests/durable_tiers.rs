//! Durable levels survive reopening the persistence tier

use provenant_store::{StatePersistence, StorageLevel, StoreConfig, StoreError};

#[tokio::test]
async fn durable_levels_survive_reopen_memory_does_not() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::at(dir.path());

    {
        let persistence = StatePersistence::open(&config).unwrap();
        for level in StorageLevel::ALL {
            persistence
                .persist(&format!("canary/{level}"), level.as_str().as_bytes().to_vec(), level)
                .await
                .unwrap();
        }
    }

    let reopened = StatePersistence::open(&config).unwrap();
    for level in StorageLevel::ALL {
        let key = format!("canary/{level}");
        let found = reopened.exists(&key, level).await.unwrap();
        assert_eq!(found, level.is_durable(), "{level}");
    }

    let (bytes, level) = reopened.retrieve_any("canary/database").await.unwrap();
    assert_eq!(level, StorageLevel::Database);
    assert_eq!(bytes, b"database");

    let err = reopened
        .retrieve("canary/memory", &[StorageLevel::Memory])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::StateNotFound { .. }));
}

#[tokio::test]
async fn delete_everywhere_clears_every_level() {
    let dir = tempfile::tempdir().unwrap();
    let persistence = StatePersistence::open(&StoreConfig::at(dir.path())).unwrap();

    persistence.persist("k", vec![1], StorageLevel::LocalDisk).await.unwrap();
    persistence.persist("k", vec![2], StorageLevel::Archive).await.unwrap();

    assert!(persistence.delete_everywhere("k").await.unwrap());
    assert!(persistence.retrieve_any("k").await.unwrap_err().is_not_found());
    assert!(!persistence.delete_everywhere("k").await.unwrap());
}
