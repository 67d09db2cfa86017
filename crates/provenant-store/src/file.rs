//! File-backed tiers (local disk and archive)
//!
//! Keys map onto relative paths: `checkpoint/01J...` becomes
//! `<root>/checkpoint/01J....bin`. Writes go to a temp file that is synced
//! and then renamed over the target, so readers never observe a torn value.

use crate::error::{StoreError, StoreResult};
use crate::tier::{StateStore, StorageLevel};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;

const EXTENSION: &str = "bin";

/// Directory-rooted byte store
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    level: StorageLevel,
    tmp_seq: AtomicU64,
}

impl FileStore {
    /// Local-disk tier rooted at `root`
    #[must_use]
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self::with_level(root, StorageLevel::LocalDisk)
    }

    /// Archive tier rooted at `root`
    #[must_use]
    pub fn archive(root: impl Into<PathBuf>) -> Self {
        Self::with_level(root, StorageLevel::Archive)
    }

    fn with_level(root: impl Into<PathBuf>, level: StorageLevel) -> Self {
        Self {
            root: root.into(),
            level,
            tmp_seq: AtomicU64::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StoreResult<PathBuf> {
        let mut path = self.root.clone();
        let mut segments = key.split('/').peekable();
        if segments.peek().is_none() {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        for segment in segments {
            let valid = !segment.is_empty()
                && segment != "."
                && segment != ".."
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
            if !valid {
                return Err(StoreError::InvalidKey(key.to_string()));
            }
            path.push(segment);
        }
        let mut file_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        file_name.push(".");
        file_name.push(EXTENSION);
        path.set_file_name(file_name);
        Ok(path)
    }
}

#[async_trait]
impl StateStore for FileStore {
    fn level(&self) -> StorageLevel {
        self.level
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> StoreResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        tmp_name.push(format!(".tmp{seq}"));
        let tmp = path.with_file_name(tmp_name);

        let write = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp, &path).await
        };
        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        tracing::trace!(level = %self.level, key, bytes = data.len(), "wrote state file");
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn contains(&self, key: &str) -> StoreResult<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }
}
