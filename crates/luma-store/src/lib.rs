//! Persistent key-value state store
//!
//! A single-file embedded B-tree store holding one named `state` table of
//! `string → JSON document` entries. Writes are durable on return; readers
//! and the single writer may coexist and writers serialise on the
//! underlying write transaction. Scripts reach this store through the
//! `state.*` host API.

use luma_core::Value;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

const STATE: TableDefinition<&str, &[u8]> = TableDefinition::new("state");

/// How long to keep retrying the open when another process holds the
/// database file lock. Failure to acquire within this window is fatal at
/// startup.
const LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the state store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open state database {path}: {message}")]
    Open { path: String, message: String },

    #[error("key not found: {key}")]
    NotFound { key: String },

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("value is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// The persistent state store.
pub struct StateStore {
    db: Database,
}

impl StateStore {
    /// Open (or create) the database at `path`.
    ///
    /// Waits up to one second for a file lock held by another process,
    /// then gives up.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Open {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
            }
        }

        let deadline = Instant::now() + LOCK_TIMEOUT;
        let db = loop {
            match Database::create(path) {
                Ok(db) => break db,
                Err(e) if Instant::now() < deadline => {
                    debug!(error = %e, "State database locked, retrying");
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    return Err(StoreError::Open {
                        path: path.display().to_string(),
                        message: e.to_string(),
                    })
                }
            }
        };

        // Make sure the table exists so readers never race its creation.
        let txn = db.begin_write()?;
        txn.open_table(STATE)?;
        txn.commit()?;

        Ok(Self { db })
    }

    /// Fetch the value stored under `key`.
    pub fn get(&self, key: &str) -> StoreResult<Value> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(STATE)?;

        let guard = table.get(key)?.ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })?;

        let json: serde_json::Value = serde_json::from_slice(guard.value())?;
        Ok(Value::from_json(&json))
    }

    /// Store `value` under `key`. Durable on return; overwrites silently.
    pub fn set(&self, key: &str, value: &Value) -> StoreResult<()> {
        let bytes = serde_json::to_vec(&value.to_json())?;

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(STATE)?;
            table.insert(key, bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Remove `key`. Removing an absent key is not an error.
    pub fn delete(&self, key: &str) -> StoreResult<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(STATE)?;
            table.remove(key)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// All keys starting with `prefix`, in byte-lexicographic order.
    pub fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(STATE)?;

        let mut keys = Vec::new();
        for entry in table.range(prefix..)? {
            let (key, _) = entry?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_string());
        }
        Ok(keys)
    }
}

/// Thread-safe handle to the state store
pub type SharedStateStore = Arc<StateStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> StateStore {
        StateStore::open(dir.path().join("state.db")).unwrap()
    }

    #[test]
    fn test_set_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.set("light.mode", &Value::from("evening")).unwrap();
        assert_eq!(store.get("light.mode").unwrap(), Value::from("evening"));

        let doc = Value::Map(HashMap::from([
            ("count".to_string(), Value::Int(3)),
            ("on".to_string(), Value::Bool(true)),
        ]));
        store.set("porch.stats", &doc).unwrap();
        assert_eq!(store.get("porch.stats").unwrap(), doc);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let err = store.get("nope").unwrap_err();
        assert!(matches!(err, StoreError::NotFound { ref key } if key == "nope"));
    }

    #[test]
    fn test_last_write_wins() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.set("k", &Value::Int(1)).unwrap();
        store.set("k", &Value::Int(2)).unwrap();
        assert_eq!(store.get("k").unwrap(), Value::Int(2));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.set("gone", &Value::Null).unwrap();
        store.delete("gone").unwrap();
        store.delete("gone").unwrap();
        assert!(matches!(
            store.get("gone").unwrap_err(),
            StoreError::NotFound { .. }
        ));
    }

    #[test]
    fn test_list_prefix_ordered() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        for key in ["light.b", "light.a", "lock.front", "light.c"] {
            store.set(key, &Value::Bool(true)).unwrap();
        }

        assert_eq!(
            store.list("light.").unwrap(),
            vec!["light.a", "light.b", "light.c"]
        );
        assert_eq!(store.list("zz").unwrap(), Vec::<String>::new());
        assert_eq!(store.list("").unwrap().len(), 4);
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.db");
        {
            let store = StateStore::open(&path).unwrap();
            store.set("persisted", &Value::Int(7)).unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.get("persisted").unwrap(), Value::Int(7));
    }
}
