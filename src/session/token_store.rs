//! Id marker and anti-CSRF token persistence
//!
//! [`TokenStore`] owns the only shared mutable session state: the id marker
//! ("a session might exist") and the anti-CSRF token bound to it. Every
//! operation takes one internal lock, so concurrent request flows never
//! interleave a partial read-modify-write.
//!
//! Both values are written through to a [`KeyValueStore`] under
//! `<namespace>/id-marker` and `<namespace>/anti-csrf-token`. The marker is
//! loaded lazily on first use and cached in memory afterwards.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};
use crate::session::anti_csrf::{AntiForgeryCache, AntiForgeryEntry, CacheLookup};
use crate::storage::KeyValueStore;

/// Storage key for the id marker
pub const ID_MARKER_KEY: &str = "id-marker";

/// Storage key for the anti-CSRF token
pub const ANTI_CSRF_KEY: &str = "anti-csrf-token";

/// Durable record of the id marker
///
/// # Examples
///
/// ```
/// use chrono::{Duration, Utc};
/// use sessionkeeper::session::token_store::IdMarker;
///
/// let session_cookie = IdMarker::new("m1");
/// assert!(!session_cookie.is_expired());
///
/// let stale = IdMarker::new("m1").with_expiry(Utc::now() - Duration::seconds(1));
/// assert!(stale.is_expired());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMarker {
    /// Opaque marker value issued by the backend
    pub value: String,

    /// When the marker stops being valid; `None` for session-lifetime markers
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub expires_at: Option<DateTime<Utc>>,
}

impl IdMarker {
    /// A marker with no expiry
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            expires_at: None,
        }
    }

    /// Sets the expiry instant
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Whether the expiry instant has passed
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            None => false,
            Some(expires_at) => expires_at <= Utc::now(),
        }
    }
}

/// Consistent view of the stored session values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSnapshot {
    /// Current, unexpired id marker
    pub marker: Option<IdMarker>,
    /// Anti-CSRF entry as stored, whichever marker it is bound to
    pub anti_csrf: Option<AntiForgeryEntry>,
}

#[derive(Debug, Default)]
enum MarkerSlot {
    #[default]
    Unloaded,
    Loaded(Option<IdMarker>),
}

#[derive(Debug, Default)]
struct TokenState {
    marker: MarkerSlot,
    anti_csrf: AntiForgeryCache,
}

/// Serialized access to the id marker and anti-CSRF token
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use sessionkeeper::session::token_store::{IdMarker, TokenStore};
/// use sessionkeeper::storage::MemoryStore;
///
/// let tokens = TokenStore::new(Arc::new(MemoryStore::new()), "myapp");
/// tokens.set_id_marker(IdMarker::new("m1")).unwrap();
/// tokens.set_anti_forgery(Some("m1"), "t1").unwrap();
///
/// assert_eq!(tokens.anti_forgery(Some("m1")).unwrap().as_deref(), Some("t1"));
/// assert_eq!(tokens.anti_forgery(Some("m2")).unwrap(), None);
/// ```
#[derive(Debug)]
pub struct TokenStore {
    store: Arc<dyn KeyValueStore>,
    namespace: String,
    state: Mutex<TokenState>,
}

impl TokenStore {
    /// Creates a store whose keys live under `namespace`
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: &str) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
            state: Mutex::new(TokenState::default()),
        }
    }

    /// Current id marker value, if a session might exist
    ///
    /// An expired marker is removed (together with the anti-CSRF token)
    /// and reported as absent.
    pub fn id_marker(&self) -> Result<Option<String>> {
        Ok(self.marker()?.map(|m| m.value))
    }

    /// Current id marker record including its expiry
    pub fn marker(&self) -> Result<Option<IdMarker>> {
        let mut state = self.lock()?;
        self.current_marker(&mut state)
    }

    /// Stores `marker`, committing it before returning
    ///
    /// An already-expired marker clears the session instead. Changing the
    /// marker value invalidates the cached anti-CSRF token.
    pub fn set_id_marker(&self, marker: IdMarker) -> Result<()> {
        let mut state = self.lock()?;

        if marker.is_expired() {
            tracing::debug!("Received an already-expired id marker; clearing session");
            return self.remove_marker(&mut state);
        }

        let previous = self.current_marker(&mut state)?;
        self.write_json(ID_MARKER_KEY, &marker)?;

        if previous.as_ref().map(|m| m.value.as_str()) != Some(marker.value.as_str()) {
            tracing::debug!("Id marker changed; invalidating cached anti-CSRF token");
            state.anti_csrf.clear();
        }
        state.marker = MarkerSlot::Loaded(Some(marker));
        Ok(())
    }

    /// Removes the id marker and the anti-CSRF token
    pub fn clear_id_marker(&self) -> Result<()> {
        let mut state = self.lock()?;
        self.remove_marker(&mut state)
    }

    /// Anti-CSRF token valid for `current_marker`
    ///
    /// Checks the in-memory cache first and falls back to durable storage.
    /// A token bound to any other marker is never returned.
    pub fn anti_forgery(&self, current_marker: Option<&str>) -> Result<Option<String>> {
        let mut state = self.lock()?;
        self.resolve_anti_forgery(&mut state, current_marker)
    }

    /// Stores `token` bound to `marker`
    ///
    /// With no marker there is no session to bind to; the cached token is
    /// dropped and nothing is written.
    pub fn set_anti_forgery(&self, marker: Option<&str>, token: &str) -> Result<()> {
        let mut state = self.lock()?;
        self.bind_anti_forgery(&mut state, marker, token)
    }

    /// Stores `token` bound to whatever marker is current, atomically
    ///
    /// Returns `false` when no marker exists and the token was discarded.
    pub fn set_anti_forgery_for_current(&self, token: &str) -> Result<bool> {
        let mut state = self.lock()?;
        let current = self.current_marker(&mut state)?.map(|m| m.value);
        self.bind_anti_forgery(&mut state, current.as_deref(), token)?;
        Ok(current.is_some())
    }

    /// Removes the anti-CSRF token from memory and durable storage
    pub fn clear_anti_forgery(&self) -> Result<()> {
        let mut state = self.lock()?;
        self.remove_anti_forgery(&mut state)
    }

    /// Whatever anti-CSRF entry is held, without checking its binding
    pub fn stored_anti_forgery(&self) -> Result<Option<AntiForgeryEntry>> {
        let state = self.lock()?;
        if let Some(entry) = state.anti_csrf.entry() {
            return Ok(Some(entry.clone()));
        }
        self.read_json(ANTI_CSRF_KEY)
    }

    /// Marker and stored anti-CSRF entry read under one lock acquisition
    pub fn snapshot(&self) -> Result<TokenSnapshot> {
        let mut state = self.lock()?;
        let marker = self.current_marker(&mut state)?;
        let anti_csrf = match state.anti_csrf.entry() {
            Some(entry) => Some(entry.clone()),
            None => self.read_json(ANTI_CSRF_KEY)?,
        };
        Ok(TokenSnapshot { marker, anti_csrf })
    }

    fn lock(&self) -> Result<MutexGuard<'_, TokenState>> {
        self.state
            .lock()
            .map_err(|_| SessionError::Storage("token store lock poisoned".into()).into())
    }

    fn key(&self, name: &str) -> String {
        format!("{}/{}", self.namespace, name)
    }

    fn current_marker(&self, state: &mut TokenState) -> Result<Option<IdMarker>> {
        if let MarkerSlot::Unloaded = state.marker {
            let loaded = self.read_json::<IdMarker>(ID_MARKER_KEY)?;
            state.marker = MarkerSlot::Loaded(loaded);
        }

        let marker = match &state.marker {
            MarkerSlot::Loaded(marker) => marker.clone(),
            MarkerSlot::Unloaded => None,
        };

        match marker {
            Some(marker) if marker.is_expired() => {
                tracing::debug!("Stored id marker has expired; removing it");
                self.remove_marker(state)?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    fn remove_marker(&self, state: &mut TokenState) -> Result<()> {
        state.marker = MarkerSlot::Loaded(None);
        self.store.delete(&self.key(ID_MARKER_KEY))?;
        self.remove_anti_forgery(state)
    }

    fn remove_anti_forgery(&self, state: &mut TokenState) -> Result<()> {
        state.anti_csrf.clear();
        self.store.delete(&self.key(ANTI_CSRF_KEY))
    }

    fn resolve_anti_forgery(
        &self,
        state: &mut TokenState,
        current_marker: Option<&str>,
    ) -> Result<Option<String>> {
        let Some(current) = current_marker else {
            state.anti_csrf.clear();
            return Ok(None);
        };

        match state.anti_csrf.lookup(current) {
            CacheLookup::Hit(token) => return Ok(Some(token)),
            CacheLookup::Stale => {
                tracing::debug!("Cached anti-CSRF token belongs to a previous marker");
                state.anti_csrf.clear();
                return self.resolve_anti_forgery(state, current_marker);
            }
            CacheLookup::Empty => {}
        }

        match self.read_json::<AntiForgeryEntry>(ANTI_CSRF_KEY)? {
            Some(entry) if entry.is_bound_to(current) => {
                let token = entry.token.clone();
                state.anti_csrf.store(entry);
                Ok(Some(token))
            }
            Some(_) => {
                tracing::debug!("Stored anti-CSRF token belongs to a previous marker");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn bind_anti_forgery(
        &self,
        state: &mut TokenState,
        marker: Option<&str>,
        token: &str,
    ) -> Result<()> {
        let Some(marker) = marker else {
            state.anti_csrf.clear();
            return Ok(());
        };

        let entry = AntiForgeryEntry::new(token, marker);
        self.write_json(ANTI_CSRF_KEY, &entry)?;
        state.anti_csrf.store(entry);
        Ok(())
    }

    fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let Some(bytes) = self.store.get(&self.key(name))? else {
            return Ok(None);
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!("Discarding unreadable stored value for {}: {}", name, e);
                Ok(None)
            }
        }
    }

    fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.store.put(&self.key(name), &bytes)
    }
}
