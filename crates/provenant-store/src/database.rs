//! SQLite tier
//!
//! Single `state` table keyed by state id. The connection is shared behind a
//! mutex and every statement runs on the blocking pool.

use crate::error::StoreResult;
use crate::tier::{StateStore, StorageLevel};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS state ( \
     state_id TEXT PRIMARY KEY, \
     data BLOB NOT NULL, \
     updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')) \
 )";

/// SQLite-backed tier
#[derive(Debug, Clone)]
pub struct DatabaseStore {
    conn: Arc<Mutex<Connection>>,
}

impl DatabaseStore {
    /// Open (or create) the database file at `path`
    ///
    /// # Errors
    /// Returns error if the file cannot be opened or the schema applied
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "busy_timeout", "5000")?;
        Self::from_connection(conn)
    }

    /// Private in-memory database
    ///
    /// # Errors
    /// Returns error if the schema cannot be applied
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute(SCHEMA, ())?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let result = tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await??;
        Ok(result)
    }
}

#[async_trait]
impl StateStore for DatabaseStore {
    fn level(&self) -> StorageLevel {
        StorageLevel::Database
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> StoreResult<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO state (state_id, data) VALUES (?1, ?2) \
                 ON CONFLICT (state_id) DO UPDATE SET \
                 data = excluded.data, \
                 updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
                (&key, &data),
            )
            .map(|_| ())
        })
        .await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row("SELECT data FROM state WHERE state_id = ?1", [&key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()
        })
        .await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM state WHERE state_id = ?1", [&key])
                .map(|n| n > 0)
        })
        .await
    }

    async fn contains(&self, key: &str) -> StoreResult<bool> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM state WHERE state_id = ?1)",
                [&key],
                |row| row.get::<_, bool>(0),
            )
        })
        .await
    }
}
