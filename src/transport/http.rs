//! `reqwest`-backed [`HttpTransport`]
//!
//! The client never follows redirects or touches cookies on its own.
//! Redirects are followed here, hop by hop, so every hop sends the jar's
//! cookies and records the `Set-Cookie` values of the responses it skips
//! past. The final response is returned untouched; recording its cookies is
//! left to the session engine.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{
    HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, LOCATION,
    PROXY_AUTHORIZATION, SET_COOKIE, TRANSFER_ENCODING,
};
use reqwest::redirect::Policy;
use reqwest::{Method, StatusCode};
use tokio::time::Instant;
use url::Url;

use crate::error::{Result, SessionError};
use crate::transport::{CookieJar, HttpTransport, SessionRequest, SessionResponse};

/// Redirect hops followed before giving up
pub const MAX_REDIRECTS: usize = 10;

/// Production transport built on `reqwest`
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use sessionkeeper::transport::http::ReqwestTransport;
///
/// let jar = Arc::new(reqwest::cookie::Jar::default());
/// let transport = ReqwestTransport::new(jar, Duration::from_secs(30)).unwrap();
/// ```
pub struct ReqwestTransport {
    client: reqwest::Client,
    /// Cookie jar shared with the session engine
    jar: Arc<dyn CookieJar>,
    /// Timeout for requests that do not set their own
    default_timeout: Duration,
}

impl std::fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestTransport")
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl ReqwestTransport {
    /// Builds a transport that reads cookies from `jar`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Http`] if TLS initialisation fails.
    pub fn new(jar: Arc<dyn CookieJar>, default_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .build()
            .map_err(SessionError::Http)?;

        Ok(Self {
            client,
            jar,
            default_timeout,
        })
    }

    async fn send_hop(&self, hop: &SessionRequest, timeout: Duration) -> Result<SessionResponse> {
        let mut builder = self
            .client
            .request(hop.method.clone(), hop.url.clone())
            .headers(hop.headers.clone())
            .timeout(timeout);

        if !hop.headers.contains_key(COOKIE) {
            if let Some(cookies) = self.jar.cookie_header(&hop.url) {
                if let Ok(value) = HeaderValue::from_str(&cookies) {
                    builder = builder.header(COOKIE, value);
                }
            }
        }

        if let Some(body) = &hop.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            SessionError::Transport(format!("{} {} failed: {}", hop.method, hop.url, e))
        })?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await.map_err(|e| {
            SessionError::Transport(format!(
                "failed to read response body from {}: {}",
                url, e
            ))
        })?;

        Ok(SessionResponse {
            status,
            headers,
            url,
            body,
        })
    }

    /// Stores the cookies of a response the caller will never see
    fn record_hop_cookies(&self, response: &SessionResponse) {
        for raw in response.headers.get_all(SET_COOKIE) {
            let Ok(raw) = raw.to_str() else {
                tracing::warn!("Skipping Set-Cookie header that is not valid ASCII");
                continue;
            };
            if let Err(e) = self.jar.add(&response.url, raw) {
                tracing::warn!("Failed to record cookie from redirect {}: {}", response.url, e);
            }
        }
    }
}

#[async_trait::async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &SessionRequest) -> Result<SessionResponse> {
        let deadline = Instant::now() + request.timeout.unwrap_or(self.default_timeout);
        let mut hop = request.clone();
        let mut redirects = 0;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::Transport(format!(
                    "{} {} timed out",
                    request.method, request.url
                ))
                .into());
            }

            let response = self.send_hop(&hop, remaining).await?;
            if !request.follow_redirects {
                return Ok(response);
            }

            let Some(next) = redirect_target(&response) else {
                return Ok(response);
            };

            redirects += 1;
            if redirects > MAX_REDIRECTS {
                return Err(SessionError::Transport(format!(
                    "{} {} exceeded {} redirects",
                    request.method, request.url, MAX_REDIRECTS
                ))
                .into());
            }

            tracing::debug!("Following {} redirect to {}", response.status, next);
            self.record_hop_cookies(&response);
            hop = redirected(hop, response.status, next);
        }
    }
}

/// Absolute `Location` of a redirect response, if it is one
fn redirect_target(response: &SessionResponse) -> Option<Url> {
    let status = StatusCode::from_u16(response.status).ok()?;
    if !matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    ) {
        return None;
    }

    let location = response.headers.get(LOCATION)?.to_str().ok()?;
    match response.url.join(location) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Some(url),
        _ => {
            tracing::warn!("Not following redirect to '{}'", location);
            None
        }
    }
}

/// The next hop after a `status` redirect to `next`
///
/// 303, and 301/302 after a POST, become a bodiless GET. Credentials set by
/// the caller are dropped when the redirect leaves the origin.
fn redirected(mut hop: SessionRequest, status: u16, next: Url) -> SessionRequest {
    let to_get = status == 303 || (matches!(status, 301 | 302) && hop.method == Method::POST);
    if to_get {
        if hop.method != Method::HEAD {
            hop.method = Method::GET;
        }
        hop.body = None;
        strip(&mut hop.headers, &[CONTENT_TYPE, CONTENT_LENGTH, TRANSFER_ENCODING]);
    }

    if next.origin() != hop.url.origin() {
        strip(&mut hop.headers, &[AUTHORIZATION, PROXY_AUTHORIZATION, COOKIE]);
    }

    hop.url = next;
    hop
}

fn strip(headers: &mut HeaderMap, names: &[reqwest::header::HeaderName]) {
    for name in names {
        headers.remove(name);
    }
}
