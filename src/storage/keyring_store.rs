//! OS keyring-backed [`KeyValueStore`]
//!
//! Values are stored in the operating system's native credential store
//! (Keychain on macOS, Secret Service on Linux, Windows Credential Manager
//! on Windows). Keyring entries hold strings, so values must be UTF-8; the
//! session engine only stores JSON.

use crate::error::{Result, SessionError};
use crate::storage::KeyValueStore;

/// Namespaced accessor for the OS keyring
///
/// Each key becomes one keyring entry whose service name is derived from the
/// namespace, preventing collisions between applications.
///
/// # Examples
///
/// ```no_run
/// use sessionkeeper::storage::{KeyValueStore, KeyringStore};
///
/// let store = KeyringStore::new("myapp");
/// store.put("myapp/id-marker", br#"{"value":"m1"}"#).unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    /// Creates a store whose entries live under `sessionkeeper-<namespace>`
    pub fn new(namespace: &str) -> Self {
        Self {
            service: Self::service_name(namespace),
        }
    }

    fn service_name(namespace: &str) -> String {
        format!("sessionkeeper-{}", namespace)
    }

    fn entry(&self, key: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, key).map_err(|e| SessionError::Keyring(e).into())
    }
}

impl KeyValueStore for KeyringStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value.into_bytes())),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(SessionError::Keyring(e).into()),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let text = std::str::from_utf8(value).map_err(|_| {
            SessionError::Storage(format!("Keyring value for '{}' is not UTF-8", key))
        })?;
        self.entry(key)?
            .set_password(text)
            .map_err(SessionError::Keyring)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_password() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(SessionError::Keyring(e).into()),
        }
    }
}
