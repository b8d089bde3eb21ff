//! Cookie jar that survives process restarts
//!
//! The id marker is durable, so the credential cookies it stands for have to
//! be durable too. [`PersistentCookieJar`] keeps a `reqwest` jar for domain
//! and path matching and writes every accepted `Set-Cookie` through to a
//! [`KeyValueStore`] under `<namespace>/cookies`. On open, the stored
//! cookies are replayed into a fresh jar.
//!
//! `Max-Age` is converted to an absolute `Expires` before storing, so a
//! reload never extends a cookie's lifetime.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use cookie::time::{Duration, OffsetDateTime};
use cookie::Cookie;
use reqwest::cookie::{CookieStore, Jar};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, SessionError};
use crate::storage::KeyValueStore;
use crate::transport::CookieJar;

/// Storage key for the persisted cookies
pub const COOKIES_KEY: &str = "cookies";

/// One persisted cookie and the URL that set it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredCookie {
    url: String,
    set_cookie: String,
}

#[derive(Debug, Default)]
struct JarState {
    jar: Jar,
    entries: BTreeMap<String, StoredCookie>,
}

/// [`CookieJar`] written through to a [`KeyValueStore`]
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use sessionkeeper::storage::MemoryStore;
/// use sessionkeeper::transport::CookieJar;
/// use sessionkeeper::transport::cookie_jar::PersistentCookieJar;
///
/// let store = Arc::new(MemoryStore::new());
/// let url = "https://api.example.com/items".parse().unwrap();
///
/// let jar = PersistentCookieJar::open(store.clone(), "myapp").unwrap();
/// jar.add(&url, "sAccessToken=a1; Path=/").unwrap();
///
/// let reopened = PersistentCookieJar::open(store, "myapp").unwrap();
/// assert_eq!(reopened.cookie_header(&url).as_deref(), Some("sAccessToken=a1"));
/// ```
pub struct PersistentCookieJar {
    store: Arc<dyn KeyValueStore>,
    key: String,
    state: Mutex<JarState>,
}

impl std::fmt::Debug for PersistentCookieJar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentCookieJar")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl PersistentCookieJar {
    /// Opens the jar stored under `namespace`, replaying unexpired cookies
    ///
    /// Unreadable stored data is logged and treated as an empty jar.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Storage`] if the backing store cannot be read.
    pub fn open(store: Arc<dyn KeyValueStore>, namespace: &str) -> Result<Self> {
        let key = format!("{}/{}", namespace, COOKIES_KEY);
        let mut state = JarState::default();

        if let Some(bytes) = store.get(&key)? {
            match serde_json::from_slice::<BTreeMap<String, StoredCookie>>(&bytes) {
                Ok(entries) => {
                    for (id, entry) in entries {
                        let (Ok(url), Ok(cookie)) =
                            (Url::parse(&entry.url), Cookie::parse(entry.set_cookie.as_str()))
                        else {
                            tracing::warn!("Dropping unreadable stored cookie {}", id);
                            continue;
                        };
                        if is_expired(&cookie) {
                            continue;
                        }
                        state.jar.add_cookie_str(&entry.set_cookie, &url);
                        state.entries.insert(id, entry);
                    }
                    tracing::debug!("Loaded {} stored cookies", state.entries.len());
                }
                Err(e) => tracing::warn!("Discarding unreadable stored cookies: {}", e),
            }
        }

        Ok(Self {
            store,
            key,
            state: Mutex::new(state),
        })
    }

    fn state(&self) -> MutexGuard<'_, JarState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CookieJar for PersistentCookieJar {
    fn add(&self, url: &Url, set_cookie: &str) -> Result<()> {
        let mut cookie = Cookie::parse(set_cookie.to_string()).map_err(|e| {
            SessionError::MalformedResponse(format!("invalid Set-Cookie '{}': {}", set_cookie, e))
        })?;
        if let Some(max_age) = cookie.max_age() {
            let now = OffsetDateTime::now_utc();
            cookie.set_expires(now.checked_add(max_age).unwrap_or(now));
            cookie.set_max_age(None::<Duration>);
        }

        let id = cookie_id(url, &cookie);
        let normalized = cookie.to_string();

        let mut state = self.state();
        let mut entries = state.entries.clone();
        if is_expired(&cookie) {
            entries.remove(&id);
        } else {
            entries.insert(
                id,
                StoredCookie {
                    url: url.to_string(),
                    set_cookie: normalized.clone(),
                },
            );
        }

        let bytes = serde_json::to_vec(&entries)?;
        self.store.put(&self.key, &bytes)?;

        state.jar.add_cookie_str(&normalized, url);
        state.entries = entries;
        Ok(())
    }

    fn cookie_header(&self, url: &Url) -> Option<String> {
        self.state()
            .jar
            .cookies(url)
            .and_then(|value| value.to_str().ok().map(str::to_string))
    }
}

/// Identity of a cookie: domain, path and name
fn cookie_id(url: &Url, cookie: &Cookie<'_>) -> String {
    let domain = cookie
        .domain()
        .map(|d| d.trim_start_matches('.').to_ascii_lowercase())
        .unwrap_or_else(|| url.host_str().unwrap_or_default().to_ascii_lowercase());
    let path = match cookie.path() {
        Some(path) if path.starts_with('/') => path.to_string(),
        _ => default_path(url),
    };
    format!("{};{};{}", domain, path, cookie.name())
}

/// Default cookie path: the request path up to its last `/`
fn default_path(url: &Url) -> String {
    match url.path().rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(end) => url.path()[..end].to_string(),
    }
}

fn is_expired(cookie: &Cookie<'_>) -> bool {
    cookie
        .expires_datetime()
        .is_some_and(|at| at <= OffsetDateTime::now_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn stored(store: &MemoryStore) -> BTreeMap<String, StoredCookie> {
        let bytes = store.get("test/cookies").unwrap().unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_cookies_survive_reopen() {
        let store = Arc::new(MemoryStore::new());
        let items = url("https://api.example.com/items");
        let refresh = url("https://api.example.com/auth/session/refresh");
        {
            let jar = PersistentCookieJar::open(store.clone(), "test").unwrap();
            jar.add(&items, "sAccessToken=a1; Path=/").unwrap();
            jar.add(&items, "sRefreshToken=r1; Path=/auth/session/refresh")
                .unwrap();
        }

        let jar = PersistentCookieJar::open(store, "test").unwrap();
        assert_eq!(jar.cookie_header(&items).as_deref(), Some("sAccessToken=a1"));
        let header = jar.cookie_header(&refresh).unwrap();
        assert!(header.contains("sAccessToken=a1"));
        assert!(header.contains("sRefreshToken=r1"));
    }

    #[test]
    fn test_replacing_cookie_keeps_one_entry() {
        let store = Arc::new(MemoryStore::new());
        let jar = PersistentCookieJar::open(store.clone(), "test").unwrap();
        let target = url("https://api.example.com/");

        jar.add(&target, "sAccessToken=a1; Path=/").unwrap();
        jar.add(&target, "sAccessToken=a2; Path=/").unwrap();

        assert_eq!(stored(&store).len(), 1);
        assert_eq!(jar.cookie_header(&target).as_deref(), Some("sAccessToken=a2"));
    }

    #[test]
    fn test_expired_cookie_removes_stored_entry() {
        let store = Arc::new(MemoryStore::new());
        let jar = PersistentCookieJar::open(store.clone(), "test").unwrap();
        let target = url("https://api.example.com/");

        jar.add(&target, "sAccessToken=a1; Path=/").unwrap();
        jar.add(&target, "sAccessToken=; Path=/; Max-Age=0").unwrap();

        assert!(stored(&store).is_empty());
        assert!(jar.cookie_header(&target).is_none());

        let reopened = PersistentCookieJar::open(store, "test").unwrap();
        assert!(reopened.cookie_header(&target).is_none());
    }

    #[test]
    fn test_max_age_is_stored_as_absolute_expiry() {
        let store = Arc::new(MemoryStore::new());
        let jar = PersistentCookieJar::open(store.clone(), "test").unwrap();
        jar.add(&url("https://api.example.com/"), "sAccessToken=a1; Path=/; Max-Age=3600")
            .unwrap();

        let entry = stored(&store).into_values().next().unwrap();
        assert!(!entry.set_cookie.contains("Max-Age"));
        assert!(entry.set_cookie.contains("Expires="));
    }

    #[test]
    fn test_lapsed_cookie_is_not_replayed() {
        let store = Arc::new(MemoryStore::new());
        let target = url("https://api.example.com/");
        let mut entries = BTreeMap::new();
        entries.insert(
            "api.example.com;/;sAccessToken".to_string(),
            StoredCookie {
                url: target.to_string(),
                set_cookie: "sAccessToken=a1; Path=/; Expires=Thu, 01 Jan 1970 00:00:00 GMT"
                    .to_string(),
            },
        );
        store
            .put("test/cookies", &serde_json::to_vec(&entries).unwrap())
            .unwrap();

        let jar = PersistentCookieJar::open(store, "test").unwrap();
        assert!(jar.cookie_header(&target).is_none());
    }

    #[test]
    fn test_unreadable_store_starts_empty() {
        let store = Arc::new(MemoryStore::new());
        store.put("test/cookies", b"not json").unwrap();

        let jar = PersistentCookieJar::open(store, "test").unwrap();
        assert!(jar.cookie_header(&url("https://api.example.com/")).is_none());
    }

    #[test]
    fn test_malformed_set_cookie_is_rejected() {
        let jar = PersistentCookieJar::open(Arc::new(MemoryStore::new()), "test").unwrap();
        let err = jar
            .add(&url("https://api.example.com/"), "no-equals-sign")
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_cookie_identity_uses_domain_path_and_name() {
        let target = url("https://api.example.com/auth/session/refresh");
        let host_only = Cookie::parse("a=1").unwrap();
        assert_eq!(cookie_id(&target, &host_only), "api.example.com;/auth/session;a");

        let scoped = Cookie::parse("a=1; Domain=.Example.com; Path=/").unwrap();
        assert_eq!(cookie_id(&target, &scoped), "example.com;/;a");
    }
}
