//! Durable key-value storage for session markers
//!
//! The session engine persists two small values: the id marker and the
//! anti-CSRF token. Both go through the [`KeyValueStore`] trait so the
//! backing store can be swapped without touching the refresh logic.
//!
//! - [`MemoryStore`] -- in-process map, for tests and ephemeral sessions
//! - [`sled_store::SledStore`] -- embedded sled database, flushed on every write
//! - [`keyring_store::KeyringStore`] -- OS credential store

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use directories::ProjectDirs;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{Result, SessionError};

pub mod keyring_store;
pub mod sled_store;

pub use keyring_store::KeyringStore;
pub use sled_store::SledStore;

/// Synchronous key-value store with commit-on-return semantics.
///
/// `put` and `delete` must not return until the change is durable for the
/// backend in question; a crash right after they return must never lose or
/// corrupt the value.
pub trait KeyValueStore: Send + Sync + fmt::Debug {
    /// Returns the stored bytes for `key`, or `None` if absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value.
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Removes `key`. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> Result<()>;
}

/// In-process [`KeyValueStore`]
///
/// # Examples
///
/// ```
/// use sessionkeeper::storage::{KeyValueStore, MemoryStore};
///
/// let store = MemoryStore::new();
/// store.put("app/id-marker", b"m1").unwrap();
/// assert_eq!(store.get("app/id-marker").unwrap(), Some(b"m1".to_vec()));
/// store.delete("app/id-marker").unwrap();
/// assert!(store.get("app/id-marker").unwrap().is_none());
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| SessionError::Storage("memory store lock poisoned".into()).into())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries()?.remove(key);
        Ok(())
    }
}

/// Default sled database location under the platform data directory.
///
/// # Errors
///
/// Returns [`SessionError::Storage`] when no home directory can be found.
pub fn default_sled_path() -> Result<PathBuf> {
    let proj_dirs = ProjectDirs::from("dev", "sessionkeeper", "sessionkeeper")
        .ok_or_else(|| SessionError::Storage("Could not determine data directory".into()))?;
    Ok(proj_dirs.data_dir().join("tokens.sled"))
}

/// Opens the backend selected by `config`.
///
/// # Errors
///
/// Returns [`SessionError::Storage`] if the sled database cannot be opened
/// or its directory cannot be created.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn KeyValueStore>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::Keyring => Ok(Arc::new(KeyringStore::new(&config.namespace))),
        StorageBackend::Sled => {
            let path = match &config.path {
                Some(path) => path.clone(),
                None => default_sled_path()?,
            };
            tracing::debug!("Opening sled token store at {}", path.display());
            Ok(Arc::new(SledStore::open(path)?))
        }
    }
}
