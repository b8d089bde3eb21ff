//! sled-backed [`KeyValueStore`]
//!
//! Every write is followed by a flush so a value is on disk before the
//! call returns.

use std::path::Path;

use sled::Db;

use crate::error::{Result, SessionError};
use crate::storage::KeyValueStore;

/// Durable store backed by an embedded `sled` database
///
/// # Examples
///
/// ```no_run
/// use sessionkeeper::storage::{KeyValueStore, SledStore};
///
/// let store = SledStore::open("/tmp/sessionkeeper-tokens").unwrap();
/// store.put("app/id-marker", b"m1").unwrap();
/// ```
#[derive(Debug)]
pub struct SledStore {
    db: Db,
}

impl SledStore {
    /// Open or create a store at `path`
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Storage`] if the database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)
            .map_err(|e| SessionError::Storage(format!("Failed to open database: {}", e)))?;
        Ok(Self { db })
    }

    fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| SessionError::Storage(format!("Flush failed: {}", e)))?;
        Ok(())
    }
}

impl KeyValueStore for SledStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self
            .db
            .get(key.as_bytes())
            .map_err(|e| SessionError::Storage(format!("Get failed: {}", e)))?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db
            .insert(key.as_bytes(), value)
            .map_err(|e| SessionError::Storage(format!("Insert failed: {}", e)))?;
        self.flush()
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.db
            .remove(key.as_bytes())
            .map_err(|e| SessionError::Storage(format!("Remove failed: {}", e)))?;
        self.flush()
    }
}
