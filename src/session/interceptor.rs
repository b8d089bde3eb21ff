//! Per-call session handling
//!
//! [`RequestInterceptor::execute`] wraps one outgoing call: it attaches the
//! anti-CSRF header, sends the request, runs every response through the
//! [`CookieSynchronizer`], and when the backend reports an expired session
//! it waits for a refresh and retries the call exactly once.

use std::sync::Arc;

use reqwest::header::{HeaderName, HeaderValue};
use url::Url;

use crate::config::SessionConfig;
use crate::error::Result;
use crate::session::coordinator::{RefreshCoordinator, RefreshOutcome};
use crate::session::cookies::{
    CookieSynchronizer, ANTI_CSRF_HEADER, SDK_NAME, SDK_NAME_HEADER, SDK_VERSION,
    SDK_VERSION_HEADER,
};
use crate::session::token_store::TokenStore;
use crate::transport::{HttpTransport, SessionRequest, SessionResponse};

/// Wraps outgoing calls to the session's backend
#[derive(Debug)]
pub struct RequestInterceptor {
    config: SessionConfig,
    refresh_url: Url,
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<TokenStore>,
    synchronizer: Arc<CookieSynchronizer>,
    coordinator: RefreshCoordinator,
}

impl RequestInterceptor {
    /// Builds an interceptor and its refresh coordinator
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::SessionError::Configuration`] if `config`
    /// does not validate.
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn HttpTransport>,
        tokens: Arc<TokenStore>,
        synchronizer: Arc<CookieSynchronizer>,
    ) -> Result<Self> {
        config.validate()?;
        let refresh_url = config.refresh_url()?;

        let coordinator = RefreshCoordinator::new(
            config.clone(),
            refresh_url.clone(),
            Arc::clone(&transport),
            Arc::clone(&tokens),
            Arc::clone(&synchronizer),
        );

        Ok(Self {
            config,
            refresh_url,
            transport,
            tokens,
            synchronizer,
            coordinator,
        })
    }

    /// Session settings in effect
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The refresh coordinator shared by every call through this interceptor
    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Whether calls to `url` get session handling
    ///
    /// Only URLs on the refresh endpoint's origin are handled, and never the
    /// refresh endpoint itself.
    pub fn intercepts(&self, url: &Url) -> bool {
        url.origin() == self.refresh_url.origin() && url.path() != self.refresh_url.path()
    }

    /// Sends `request` with session handling
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::SessionError::Transport`] when the original
    /// or retried call fails to produce a response, and
    /// [`crate::error::SessionError::Storage`] when the id marker cannot be
    /// read. An expired session that cannot be refreshed is not an error:
    /// the original expired response is returned.
    pub async fn execute(&self, request: SessionRequest) -> Result<SessionResponse> {
        if !self.intercepts(&request.url) {
            tracing::debug!("Passing through request outside the session domain: {}", request.url);
            let response = self.transport.send(&request).await?;
            if let Err(e) = self.synchronizer.record_cookies(&response) {
                tracing::error!("Failed to record cookies from {}: {}", response.url, e);
            }
            return Ok(response);
        }

        let result = self.execute_intercepted(&request).await;
        self.reconcile();
        result
    }

    async fn execute_intercepted(&self, request: &SessionRequest) -> Result<SessionResponse> {
        let prior_marker = self.tokens.id_marker()?;
        let response = self.send_once(request, prior_marker.as_deref()).await?;

        if response.status != self.config.session_expired_status_code {
            return Ok(response);
        }

        let Some(prior_marker) = prior_marker else {
            tracing::debug!("Session expired response without an id marker; not refreshing");
            return Ok(response);
        };

        tracing::debug!("Session expired calling {}; refreshing", request.url);
        match self.coordinator.refresh(Some(prior_marker)).await {
            RefreshOutcome::Success => {
                let current = self.tokens.id_marker()?;
                tracing::debug!("Retrying {} {} after refresh", request.method, request.url);
                self.send_once(request, current.as_deref()).await
            }
            RefreshOutcome::Failure(reason) => {
                tracing::warn!("Returning expired response for {}: {}", request.url, reason);
                Ok(response)
            }
        }
    }

    /// Sends one attempt of `request` with headers for `marker`
    async fn send_once(
        &self,
        request: &SessionRequest,
        marker: Option<&str>,
    ) -> Result<SessionResponse> {
        let mut attempt = request.clone();
        if attempt.timeout.is_none() {
            attempt.timeout = Some(self.config.request_timeout());
        }

        attempt.headers.remove(ANTI_CSRF_HEADER);
        if let Some(token) = self.tokens.anti_forgery(marker)? {
            match HeaderValue::from_str(&token) {
                Ok(value) => {
                    tracing::debug!("Attaching anti-CSRF header");
                    attempt
                        .headers
                        .insert(HeaderName::from_static(ANTI_CSRF_HEADER), value);
                }
                Err(_) => tracing::warn!("Stored anti-CSRF token is not a valid header value"),
            }
        }

        if self.config.send_sdk_headers {
            attempt.headers.insert(
                HeaderName::from_static(SDK_NAME_HEADER),
                HeaderValue::from_static(SDK_NAME),
            );
            attempt.headers.insert(
                HeaderName::from_static(SDK_VERSION_HEADER),
                HeaderValue::from_static(SDK_VERSION),
            );
        }

        let response = self.transport.send(&attempt).await?;

        if let Err(e) = self.synchronizer.apply(&response) {
            tracing::error!("Failed to record session cookies from {}: {}", response.url, e);
        }

        Ok(response)
    }

    /// Drops the anti-CSRF token when no id marker remains
    fn reconcile(&self) {
        match self.tokens.id_marker() {
            Ok(Some(_)) => {}
            Ok(None) => {
                if let Err(e) = self.tokens.clear_anti_forgery() {
                    tracing::error!("Failed to clear anti-CSRF token: {}", e);
                }
            }
            Err(e) => tracing::error!("Failed to read id marker: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::session::token_store::IdMarker;
    use crate::storage::MemoryStore;
    use crate::transport::fake::FakeTransport;
    use crate::transport::CookieJar;
    use reqwest::header::SET_COOKIE;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const REFRESH: &str = "https://api.example.com/auth/session/refresh";

    struct Harness {
        interceptor: RequestInterceptor,
        tokens: Arc<TokenStore>,
        transport: Arc<FakeTransport>,
    }

    fn harness(transport: FakeTransport) -> Harness {
        let transport = Arc::new(transport);
        let jar = Arc::new(reqwest::cookie::Jar::default());
        let tokens = Arc::new(TokenStore::new(Arc::new(MemoryStore::new()), "test"));
        let synchronizer = Arc::new(CookieSynchronizer::new(jar, tokens.clone()));
        let interceptor = RequestInterceptor::new(
            SessionConfig::new(REFRESH),
            transport.clone(),
            tokens.clone(),
            synchronizer,
        )
        .unwrap();
        Harness {
            interceptor,
            tokens,
            transport,
        }
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn refresh_rotates(request: &SessionRequest) -> SessionResponse {
        let mut response = SessionResponse::new(200, request.url.clone());
        response.headers.append(
            SET_COOKIE,
            HeaderValue::from_static("sIdRefreshToken=m2; Path=/"),
        );
        response
            .headers
            .insert("anti-csrf", HeaderValue::from_static("t2"));
        response
    }

    /// Answers 440 until the request carries the rotated token
    fn expiring_backend(request: &SessionRequest) -> Result<SessionResponse> {
        if request.url.path().ends_with("/refresh") {
            return Ok(refresh_rotates(request));
        }
        let status = match request.headers.get("anti-csrf") {
            Some(value) if value == "t2" => 200,
            _ => 440,
        };
        Ok(SessionResponse::new(status, request.url.clone()))
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let transport = Arc::new(FakeTransport::new(|r| Ok(SessionResponse::new(200, r.url.clone()))));
        let tokens = Arc::new(TokenStore::new(Arc::new(MemoryStore::new()), "test"));
        let synchronizer = Arc::new(CookieSynchronizer::new(
            Arc::new(reqwest::cookie::Jar::default()),
            tokens.clone(),
        ));
        let err = RequestInterceptor::new(
            SessionConfig::new("ftp://api.example.com/refresh"),
            transport,
            tokens,
            synchronizer,
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::Configuration(_))
        ));
    }

    #[test]
    fn test_domain_scoping() {
        let h = harness(FakeTransport::new(|r| Ok(SessionResponse::new(200, r.url.clone()))));
        assert!(h.interceptor.intercepts(&url("https://api.example.com/items")));
        assert!(!h.interceptor.intercepts(&url(REFRESH)));
        assert!(!h.interceptor.intercepts(&url("https://other.example.com/items")));
        assert!(!h.interceptor.intercepts(&url("http://api.example.com/items")));
        assert!(!h.interceptor.intercepts(&url("https://api.example.com:8443/items")));
    }

    #[tokio::test]
    async fn test_attaches_bound_anti_csrf_and_sdk_headers() {
        let h = harness(FakeTransport::new(|r| Ok(SessionResponse::new(200, r.url.clone()))));
        h.tokens.set_id_marker(IdMarker::new("m1")).unwrap();
        h.tokens.set_anti_forgery(Some("m1"), "t1").unwrap();

        let request = SessionRequest::get(url("https://api.example.com/items"));
        h.interceptor.execute(request).await.unwrap();

        let sent = &h.transport.requests()[0];
        assert_eq!(sent.headers.get("anti-csrf").unwrap(), "t1");
        assert_eq!(sent.headers.get(SDK_NAME_HEADER).unwrap(), SDK_NAME);
        assert_eq!(sent.timeout, Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_outside_domain_is_sent_untouched() {
        let h = harness(FakeTransport::new(|r| Ok(SessionResponse::new(440, r.url.clone()))));
        h.tokens.set_id_marker(IdMarker::new("m1")).unwrap();
        h.tokens.set_anti_forgery(Some("m1"), "t1").unwrap();

        let request = SessionRequest::get(url("https://cdn.example.org/logo.png"));
        let response = h.interceptor.execute(request).await.unwrap();

        assert_eq!(response.status, 440);
        let sent = h.transport.requests();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].headers.get("anti-csrf").is_none());
        assert_eq!(h.interceptor.coordinator().refresh_attempts(), 0);
    }

    #[tokio::test]
    async fn test_outside_domain_cookies_reach_jar_only() {
        let transport = Arc::new(FakeTransport::new(|r| {
            let mut response = SessionResponse::new(200, r.url.clone());
            response.headers.append(
                SET_COOKIE,
                HeaderValue::from_static("sIdRefreshToken=foreign; Path=/"),
            );
            response
                .headers
                .insert("anti-csrf", HeaderValue::from_static("foreign"));
            Ok(response)
        }));
        let jar = Arc::new(reqwest::cookie::Jar::default());
        let tokens = Arc::new(TokenStore::new(Arc::new(MemoryStore::new()), "test"));
        let synchronizer = Arc::new(CookieSynchronizer::new(jar.clone(), tokens.clone()));
        let interceptor =
            RequestInterceptor::new(SessionConfig::new(REFRESH), transport, tokens.clone(), synchronizer)
                .unwrap();

        let target = url("https://cdn.example.org/assets");
        interceptor
            .execute(SessionRequest::get(target.clone()))
            .await
            .unwrap();

        assert!(jar.cookie_header(&target).unwrap().contains("sIdRefreshToken=foreign"));
        assert!(tokens.id_marker().unwrap().is_none());
        assert!(tokens.stored_anti_forgery().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_call_is_refreshed_and_retried_once() {
        let h = harness(FakeTransport::new(expiring_backend));
        h.tokens.set_id_marker(IdMarker::new("m1")).unwrap();
        h.tokens.set_anti_forgery(Some("m1"), "t1").unwrap();

        let request = SessionRequest::post(url("https://api.example.com/items"))
            .try_header("content-type", "application/json")
            .unwrap()
            .body("{}");
        let response = h.interceptor.execute(request).await.unwrap();

        assert_eq!(response.status, 200);
        let sent = h.transport.requests();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].headers.get("anti-csrf").unwrap(), "t1");
        assert!(sent[1].url.path().ends_with("/refresh"));
        assert_eq!(sent[2].headers.get("anti-csrf").unwrap(), "t2");
        assert_eq!(sent[2].method, reqwest::Method::POST);
        assert_eq!(sent[2].body.as_deref(), Some(&b"{}"[..]));
        assert_eq!(sent[2].headers.get("content-type").unwrap(), "application/json");
    }

    #[tokio::test]
    async fn test_retry_happens_at_most_once() {
        let h = harness(FakeTransport::new(|request| {
            if request.url.path().ends_with("/refresh") {
                return Ok(refresh_rotates(request));
            }
            Ok(SessionResponse::new(440, request.url.clone()))
        }));
        h.tokens.set_id_marker(IdMarker::new("m1")).unwrap();

        let response = h
            .interceptor
            .execute(SessionRequest::get(url("https://api.example.com/items")))
            .await
            .unwrap();

        assert_eq!(response.status, 440);
        assert_eq!(h.transport.count("/items"), 2);
        assert_eq!(h.transport.count("/refresh"), 1);
    }

    #[tokio::test]
    async fn test_expired_without_marker_is_returned_as_is() {
        let h = harness(FakeTransport::new(|r| Ok(SessionResponse::new(440, r.url.clone()))));

        let response = h
            .interceptor
            .execute(SessionRequest::get(url("https://api.example.com/items")))
            .await
            .unwrap();

        assert_eq!(response.status, 440);
        assert_eq!(h.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_returns_original_response() {
        let h = harness(FakeTransport::new(|request| {
            let status = if request.url.path().ends_with("/refresh") {
                500
            } else {
                440
            };
            Ok(SessionResponse::new(status, request.url.clone()))
        }));
        h.tokens.set_id_marker(IdMarker::new("m1")).unwrap();

        let response = h
            .interceptor
            .execute(SessionRequest::get(url("https://api.example.com/items")))
            .await
            .unwrap();

        assert_eq!(response.status, 440);
        assert_eq!(h.transport.count("/items"), 1);
        assert_eq!(h.tokens.id_marker().unwrap().as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn test_ambient_errors_do_not_clear_session() {
        let h = harness(FakeTransport::new(|r| Ok(SessionResponse::new(404, r.url.clone()))));
        h.tokens.set_id_marker(IdMarker::new("m1")).unwrap();
        h.tokens.set_anti_forgery(Some("m1"), "t1").unwrap();

        let response = h
            .interceptor
            .execute(SessionRequest::get(url("https://api.example.com/missing")))
            .await
            .unwrap();

        assert_eq!(response.status, 404);
        assert_eq!(h.tokens.id_marker().unwrap().as_deref(), Some("m1"));
        assert_eq!(h.tokens.anti_forgery(Some("m1")).unwrap().as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_transport_error_propagates_without_touching_tokens() {
        let h = harness(FakeTransport::new(|_| {
            Err(SessionError::Transport("connection reset".into()).into())
        }));
        h.tokens.set_id_marker(IdMarker::new("m1")).unwrap();

        let err = h
            .interceptor
            .execute(SessionRequest::get(url("https://api.example.com/items")))
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::Transport(_))
        ));
        assert_eq!(h.tokens.id_marker().unwrap().as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn test_concurrent_expired_calls_refresh_once() {
        let refreshes = Arc::new(AtomicUsize::new(0));
        let counter = refreshes.clone();
        let transport = FakeTransport::new(move |request| {
            if request.url.path().ends_with("/refresh") {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            expiring_backend(request)
        })
        .with_delay("/refresh", Duration::from_millis(100));

        let h = Arc::new(harness(transport));
        h.tokens.set_id_marker(IdMarker::new("m1")).unwrap();
        h.tokens.set_anti_forgery(Some("m1"), "t1").unwrap();

        let mut handles = Vec::new();
        for i in 0..5 {
            let h = Arc::clone(&h);
            handles.push(tokio::spawn(async move {
                let target = url(&format!("https://api.example.com/items/{}", i));
                h.interceptor.execute(SessionRequest::get(target)).await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().status, 200);
        }
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_anti_csrf_dropped_when_session_cleared() {
        let h = harness(FakeTransport::new(|request| {
            let mut response = SessionResponse::new(200, request.url.clone());
            response
                .headers
                .insert("id-refresh-token", HeaderValue::from_static("remove"));
            Ok(response)
        }));
        h.tokens.set_id_marker(IdMarker::new("m1")).unwrap();
        h.tokens.set_anti_forgery(Some("m1"), "t1").unwrap();

        h.interceptor
            .execute(SessionRequest::get(url("https://api.example.com/signout")))
            .await
            .unwrap();

        assert!(h.tokens.id_marker().unwrap().is_none());
        assert!(h.tokens.stored_anti_forgery().unwrap().is_none());
    }
}
