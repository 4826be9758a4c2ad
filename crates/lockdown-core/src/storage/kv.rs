//! Durable key-value tiers backed by SQLite.
//!
//! Each tier is a single `kv` table. Writes go through [`KvBatch`] and are
//! applied inside one transaction, so readers never see half of a batch.

use std::path::PathBuf;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::Tier;
use crate::error::StorageError;

/// One staged mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    Put { key: String, value: String },
    Remove { key: String },
}

/// Mutations committed together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvBatch {
    ops: Vec<KvOp>,
}

impl KvBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, key: &str, value: impl Into<String>) -> Self {
        self.ops.push(KvOp::Put {
            key: key.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn remove(mut self, key: &str) -> Self {
        self.ops.push(KvOp::Remove {
            key: key.to_string(),
        });
        self
    }

    /// Put when `Some`, remove when `None`.
    pub fn put_opt(self, key: &str, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => self.put(key, v),
            None => self.remove(key),
        }
    }

    pub fn ops(&self) -> &[KvOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Durable key-value storage contract.
pub trait KeyValueStore: Send + Sync {
    fn tier(&self) -> Tier;

    fn is_reachable(&self) -> bool;

    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Apply every operation in `batch` atomically.
    fn commit(&self, batch: KvBatch) -> Result<(), StorageError>;
}

enum Backing {
    File(PathBuf),
    Memory,
}

/// SQLite-backed tier.
///
/// A credential tier is created deferred: it reports
/// [`StorageError::Unreachable`] until [`SqliteKv::connect`] succeeds.
pub struct SqliteKv {
    tier: Tier,
    backing: Backing,
    conn: Mutex<Option<Connection>>,
}

impl SqliteKv {
    /// Open a file-backed tier immediately.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or migrated.
    pub fn open(tier: Tier, path: PathBuf) -> Result<Self, StorageError> {
        let kv = Self::deferred(tier, path);
        kv.connect()?;
        Ok(kv)
    }

    /// Create a file-backed tier that stays unreachable until `connect()`.
    pub fn deferred(tier: Tier, path: PathBuf) -> Self {
        Self {
            tier,
            backing: Backing::File(path),
            conn: Mutex::new(None),
        }
    }

    /// Open an in-memory tier (for tests).
    pub fn open_memory(tier: Tier) -> Result<Self, StorageError> {
        let kv = Self::deferred_memory(tier);
        kv.connect()?;
        Ok(kv)
    }

    /// In-memory tier that stays unreachable until `connect()` (for tests).
    pub fn deferred_memory(tier: Tier) -> Self {
        Self {
            tier,
            backing: Backing::Memory,
            conn: Mutex::new(None),
        }
    }

    /// Make the tier reachable. Idempotent.
    ///
    /// # Errors
    /// Returns an error if the backing database cannot be opened.
    pub fn connect(&self) -> Result<(), StorageError> {
        let mut slot = self.conn.lock().map_err(|_| StorageError::Locked)?;
        if slot.is_some() {
            return Ok(());
        }
        let conn = match &self.backing {
            Backing::File(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| StorageError::OpenFailed {
                        path: path.clone(),
                        message: e.to_string(),
                    })?;
                }
                Connection::open(path).map_err(|e| StorageError::OpenFailed {
                    path: path.clone(),
                    message: e.to_string(),
                })?
            }
            Backing::Memory => Connection::open_in_memory()?,
        };
        Self::migrate(&conn)?;
        tracing::debug!(tier = %self.tier, "storage tier connected");
        *slot = Some(conn);
        Ok(())
    }

    /// Drop the connection, making the tier unreachable again.
    pub fn disconnect(&self) {
        if let Ok(mut slot) = self.conn.lock() {
            slot.take();
        }
    }

    fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut slot = self.conn.lock().map_err(|_| StorageError::Locked)?;
        match slot.as_mut() {
            Some(conn) => f(conn),
            None => Err(StorageError::Unreachable { tier: self.tier }),
        }
    }
}

impl KeyValueStore for SqliteKv {
    fn tier(&self) -> Tier {
        self.tier
    }

    fn is_reachable(&self) -> bool {
        self.conn.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.with_conn(|conn| {
            let value = conn
                .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                    row.get::<_, String>(0)
                })
                .optional()?;
            Ok(value)
        })
    }

    fn commit(&self, batch: KvBatch) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            for op in batch.ops() {
                match op {
                    KvOp::Put { key, value } => {
                        tx.execute(
                            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                            params![key, value],
                        )?;
                    }
                    KvOp::Remove { key } => {
                        tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                    }
                }
            }
            tx.commit()?;
            Ok(())
        })
    }
}
