//! HTTP transport abstraction
//!
//! The session engine never talks to the network directly. It builds a
//! [`SessionRequest`], hands it to an [`HttpTransport`], and inspects the
//! buffered [`SessionResponse`] that comes back. Cookies set by responses
//! are recorded in a [`CookieJar`] shared with the transport.
//!
//! - [`http::ReqwestTransport`] -- production transport built on `reqwest`
//! - [`cookie_jar::PersistentCookieJar`] -- jar written through to a
//!   [`crate::storage::KeyValueStore`] so cookies outlive the process
//! - [`fake::FakeTransport`] -- scripted in-process transport (cfg(test) only)
//!
//! # Retrying
//!
//! A retry after refresh must reproduce the original call exactly apart
//! from the anti-CSRF header. [`SessionRequest`] is therefore a plain value
//! object: cloning it copies method, URL, headers, body, timeout and
//! redirect policy in one step.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, SET_COOKIE};
use reqwest::Method;
use url::Url;

use crate::error::{Result, SessionError};

pub mod cookie_jar;
pub mod http;

#[cfg(test)]
pub mod fake;

/// Description of one outgoing HTTP call
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use sessionkeeper::transport::SessionRequest;
///
/// let request = SessionRequest::post("https://api.example.com/items".parse().unwrap())
///     .try_header("content-type", "application/json")
///     .unwrap()
///     .body(r#"{"name":"widget"}"#)
///     .timeout(Duration::from_secs(5));
///
/// let retry = request.clone();
/// assert_eq!(retry.method, request.method);
/// assert_eq!(retry.body, request.body);
/// ```
#[derive(Debug, Clone)]
pub struct SessionRequest {
    /// HTTP method
    pub method: Method,
    /// Target URL
    pub url: Url,
    /// Request headers; multiple values per name are preserved
    pub headers: HeaderMap,
    /// Optional request body
    pub body: Option<Bytes>,
    /// Per-call timeout; `None` uses the transport default
    pub timeout: Option<Duration>,
    /// Whether redirects are followed
    pub follow_redirects: bool,
}

impl SessionRequest {
    /// Creates a request with no headers, no body and default policies
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            follow_redirects: true,
        }
    }

    /// Shorthand for a GET request
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Shorthand for a POST request
    pub fn post(url: Url) -> Self {
        Self::new(Method::POST, url)
    }

    /// Appends a header value
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Appends a header given as strings
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`] if the name or value is not a
    /// valid HTTP header.
    pub fn try_header(self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| SessionError::Configuration(format!("Invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            SessionError::Configuration(format!("Invalid value for header '{}': {}", name, e))
        })?;
        Ok(self.header(name, value))
    }

    /// Sets the request body
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Sets the per-call timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the redirect policy
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }
}

/// A fully buffered HTTP response
#[derive(Debug, Clone)]
pub struct SessionResponse {
    /// Status code
    pub status: u16,
    /// Response headers
    pub headers: HeaderMap,
    /// URL of the request that produced this response (after redirects)
    pub url: Url,
    /// Response body
    pub body: Bytes,
}

impl SessionResponse {
    /// Creates an empty-bodied response; mostly useful for fakes and tests
    pub fn new(status: u16, url: Url) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            url,
            body: Bytes::new(),
        }
    }

    /// Returns the first value of `name` as a string
    ///
    /// Values that are not visible ASCII are treated as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Raw `Set-Cookie` header values in the order received
    pub fn set_cookie_values(&self) -> impl Iterator<Item = &HeaderValue> {
        self.headers.get_all(SET_COOKIE).iter()
    }

    /// Body decoded as UTF-8, lossily
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends one request and returns the buffered response
///
/// Implementations send exactly once: no retries, no session handling.
/// Network failures map to [`SessionError::Transport`].
#[async_trait::async_trait]
pub trait HttpTransport: Send + Sync + fmt::Debug {
    /// Send `request` and buffer the response
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Transport`] on connection, timeout, DNS, or
    /// body read failures. Non-2xx statuses are responses, not errors.
    async fn send(&self, request: &SessionRequest) -> Result<SessionResponse>;
}

/// Cookie storage shared between the transport and the session engine
///
/// Cookies are only ever appended; removal happens through expired
/// `Set-Cookie` values that the jar itself honors.
pub trait CookieJar: Send + Sync {
    /// Record one raw `Set-Cookie` value received from `url`
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Storage`] when a persistent jar cannot write
    /// the change through.
    fn add(&self, url: &Url, set_cookie: &str) -> Result<()>;

    /// The `Cookie` request header value for `url`, if any cookie matches
    fn cookie_header(&self, url: &Url) -> Option<String>;
}

impl CookieJar for reqwest::cookie::Jar {
    fn add(&self, url: &Url, set_cookie: &str) -> Result<()> {
        self.add_cookie_str(set_cookie, url);
        Ok(())
    }

    fn cookie_header(&self, url: &Url) -> Option<String> {
        use reqwest::cookie::CookieStore;

        self.cookies(url)
            .and_then(|value| value.to_str().ok().map(str::to_string))
    }
}
