//! Response cookie and header bookkeeping
//!
//! [`CookieSynchronizer::apply`] runs on every response the session engine
//! sees. It records each `Set-Cookie` value in the shared jar, keeps the id
//! marker in step with the `sIdRefreshToken` cookie (or the
//! `id-refresh-token` header), and stores any `anti-csrf` header bound to
//! the marker that is current once cookies have been processed.
//! [`CookieSynchronizer::record_cookies`] is the jar-only half, used for
//! responses from outside the session's origin.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use cookie::Cookie;
use reqwest::header::HeaderValue;

use crate::error::{Result, SessionError};
use crate::session::token_store::{IdMarker, TokenStore};
use crate::transport::{CookieJar, SessionResponse};

/// Cookie carrying the id marker
pub const ID_MARKER_COOKIE: &str = "sIdRefreshToken";

/// Header carrying the anti-CSRF token, in both directions
pub const ANTI_CSRF_HEADER: &str = "anti-csrf";

/// Header form of the id marker: `<value>;<expiry-millis>` or `remove`
pub const ID_REFRESH_HEADER: &str = "id-refresh-token";

/// Header naming the client SDK
pub const SDK_NAME_HEADER: &str = "supertokens-sdk-name";

/// Header carrying the client SDK version
pub const SDK_VERSION_HEADER: &str = "supertokens-sdk-version";

/// Value sent in [`SDK_NAME_HEADER`]
pub const SDK_NAME: &str = "rust";

/// Value sent in [`SDK_VERSION_HEADER`]
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

const REMOVE_MARKER: &str = "remove";

/// What a response did to the id marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerUpdate {
    /// The response did not mention the marker
    Unchanged,
    /// The response set a fresh, unexpired marker
    Set,
    /// The response removed or expired the marker
    Cleared,
}

impl MarkerUpdate {
    fn then(self, next: MarkerUpdate) -> MarkerUpdate {
        match next {
            MarkerUpdate::Unchanged => self,
            other => other,
        }
    }
}

/// Applies response cookies and headers to the jar and token store
pub struct CookieSynchronizer {
    jar: Arc<dyn CookieJar>,
    tokens: Arc<TokenStore>,
}

impl std::fmt::Debug for CookieSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieSynchronizer")
            .field("tokens", &self.tokens)
            .finish_non_exhaustive()
    }
}

impl CookieSynchronizer {
    /// Creates a synchronizer writing to `jar` and `tokens`
    pub fn new(jar: Arc<dyn CookieJar>, tokens: Arc<TokenStore>) -> Self {
        Self { jar, tokens }
    }

    /// Processes `response` and reports what happened to the id marker
    ///
    /// Malformed cookies and headers are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error only when the token store or the cookie jar cannot
    /// be written.
    pub fn apply(&self, response: &SessionResponse) -> Result<MarkerUpdate> {
        let mut update = MarkerUpdate::Unchanged;

        for cookie in self.store_cookies(response)? {
            if cookie.name() == ID_MARKER_COOKIE {
                update = update.then(self.apply_marker_cookie(&cookie)?);
            }
        }

        if let Some(value) = response.header(ID_REFRESH_HEADER) {
            update = update.then(self.apply_marker_header(value)?);
        }

        if let Some(token) = response.header(ANTI_CSRF_HEADER) {
            if self.tokens.set_anti_forgery_for_current(token)? {
                tracing::debug!("Stored anti-CSRF token from {}", response.url);
            } else {
                tracing::debug!("Ignoring anti-CSRF token received without an id marker");
            }
        }

        Ok(update)
    }

    /// Records the `Set-Cookie` values of `response` in the jar only
    ///
    /// The id marker and anti-CSRF token are left alone.
    ///
    /// # Errors
    ///
    /// Returns an error when the cookie jar cannot be written.
    pub fn record_cookies(&self, response: &SessionResponse) -> Result<()> {
        self.store_cookies(response).map(|_| ())
    }

    /// Adds every well-formed `Set-Cookie` value to the jar and returns them
    fn store_cookies(&self, response: &SessionResponse) -> Result<Vec<Cookie<'static>>> {
        let mut stored = Vec::new();
        for raw in response.set_cookie_values() {
            match parse_set_cookie(raw) {
                Ok(cookie) => {
                    self.jar.add(&response.url, &cookie.to_string())?;
                    stored.push(cookie);
                }
                Err(e) => tracing::warn!("Skipping Set-Cookie from {}: {}", response.url, e),
            }
        }
        Ok(stored)
    }

    fn apply_marker_cookie(&self, cookie: &Cookie<'_>) -> Result<MarkerUpdate> {
        let marker = match cookie_expiry(cookie) {
            Some(expires_at) => IdMarker::new(cookie.value()).with_expiry(expires_at),
            None => IdMarker::new(cookie.value()),
        };
        self.store_marker(marker)
    }

    fn apply_marker_header(&self, value: &str) -> Result<MarkerUpdate> {
        if value.trim() == REMOVE_MARKER {
            tracing::debug!("Response asked to remove the id marker");
            self.tokens.clear_id_marker()?;
            return Ok(MarkerUpdate::Cleared);
        }

        match parse_marker_header(value) {
            Ok(marker) => self.store_marker(marker),
            Err(e) => {
                tracing::warn!("Skipping {} header: {}", ID_REFRESH_HEADER, e);
                Ok(MarkerUpdate::Unchanged)
            }
        }
    }

    fn store_marker(&self, marker: IdMarker) -> Result<MarkerUpdate> {
        if marker.is_expired() || marker.value.is_empty() {
            tracing::debug!("Id marker expired by response; clearing session");
            self.tokens.clear_id_marker()?;
            Ok(MarkerUpdate::Cleared)
        } else {
            self.tokens.set_id_marker(marker)?;
            Ok(MarkerUpdate::Set)
        }
    }
}

/// Expiry instant from `Max-Age` (preferred) or `Expires`
fn cookie_expiry(cookie: &Cookie<'_>) -> Option<DateTime<Utc>> {
    if let Some(max_age) = cookie.max_age() {
        let millis = i64::try_from(max_age.whole_milliseconds()).unwrap_or(i64::MAX);
        if millis <= 0 {
            return Some(Utc::now() - Duration::seconds(1));
        }
        return Utc::now().checked_add_signed(Duration::milliseconds(millis));
    }

    cookie
        .expires_datetime()
        .and_then(|at| Utc.timestamp_opt(at.unix_timestamp(), 0).single())
}

/// Parses one raw `Set-Cookie` value
fn parse_set_cookie(raw: &HeaderValue) -> Result<Cookie<'static>> {
    let raw = raw.to_str().map_err(|_| {
        SessionError::MalformedResponse("Set-Cookie value is not visible ASCII".to_string())
    })?;
    Cookie::parse(raw.to_string()).map_err(|e| {
        SessionError::MalformedResponse(format!("invalid Set-Cookie '{}': {}", raw, e)).into()
    })
}

/// Parses `<value>;<expiry-millis>`
fn parse_marker_header(value: &str) -> Result<IdMarker> {
    let malformed =
        || SessionError::MalformedResponse(format!("expected '<marker>;<expiry-millis>', got '{}'", value));

    let (marker, millis) = value.split_once(';').ok_or_else(malformed)?;
    let marker = marker.trim();
    if marker.is_empty() {
        return Err(malformed().into());
    }
    let millis: i64 = millis.trim().parse().map_err(|_| malformed())?;
    let expires_at = Utc
        .timestamp_millis_opt(millis)
        .single()
        .ok_or_else(malformed)?;
    Ok(IdMarker::new(marker).with_expiry(expires_at))
}
