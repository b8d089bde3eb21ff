//! In-memory anti-CSRF token cache
//!
//! The backend issues an anti-CSRF token per session. The token is only
//! meaningful for the id marker it was issued against, so the cache stores
//! the pair and refuses to answer for any other marker.

use serde::{Deserialize, Serialize};

/// An anti-CSRF token and the id marker it was issued against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AntiForgeryEntry {
    /// Token value sent in the `anti-csrf` request header
    pub token: String,
    /// Id marker value current when the token was received
    pub bound_marker: String,
}

impl AntiForgeryEntry {
    /// Pairs `token` with `bound_marker`
    pub fn new(token: impl Into<String>, bound_marker: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            bound_marker: bound_marker.into(),
        }
    }

    /// Whether this entry may be used while `marker` is current
    pub fn is_bound_to(&self, marker: &str) -> bool {
        self.bound_marker == marker
    }
}

/// Result of a cache lookup for a given marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CacheLookup {
    /// Entry present and bound to the requested marker
    Hit(String),
    /// Entry present but bound to a different marker
    Stale,
    /// Nothing cached
    Empty,
}

/// Single-slot cache; callers hold the token store lock around every call
#[derive(Debug, Default)]
pub(crate) struct AntiForgeryCache {
    entry: Option<AntiForgeryEntry>,
}

impl AntiForgeryCache {
    pub(crate) fn lookup(&self, marker: &str) -> CacheLookup {
        match &self.entry {
            Some(entry) if entry.is_bound_to(marker) => CacheLookup::Hit(entry.token.clone()),
            Some(_) => CacheLookup::Stale,
            None => CacheLookup::Empty,
        }
    }

    pub(crate) fn entry(&self) -> Option<&AntiForgeryEntry> {
        self.entry.as_ref()
    }

    pub(crate) fn store(&mut self, entry: AntiForgeryEntry) {
        self.entry = Some(entry);
    }

    pub(crate) fn clear(&mut self) {
        self.entry = None;
    }
}
