//! Shared fixtures for sessionkeeper integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use sessionkeeper::session::{IdMarker, SessionManager, TokenStore};
use sessionkeeper::storage::MemoryStore;
use sessionkeeper::transport::http::ReqwestTransport;
use wiremock::{MockServer, Request};

pub const REFRESH_PATH: &str = "/auth/session/refresh";

/// Absolute refresh endpoint URL on `server`
pub fn refresh_url(server: &MockServer) -> String {
    format!("{}{}", server.uri(), REFRESH_PATH)
}

/// Absolute URL for `path` on `server`
pub fn url(server: &MockServer, path: &str) -> url::Url {
    url::Url::parse(&format!("{}{}", server.uri(), path)).expect("valid mock server URL")
}

/// Uninitialized manager with a real reqwest transport and in-memory tokens
pub fn manager() -> Arc<SessionManager> {
    let jar: Arc<dyn sessionkeeper::transport::CookieJar> = Arc::new(reqwest::cookie::Jar::default());
    let transport = ReqwestTransport::new(Arc::clone(&jar), Duration::from_secs(5))
        .expect("reqwest client builds");
    let tokens = TokenStore::new(Arc::new(MemoryStore::new()), "it");
    Arc::new(SessionManager::new(Arc::new(transport), jar, tokens))
}

/// Manager initialized against `server`'s refresh endpoint
pub fn manager_for(server: &MockServer) -> Arc<SessionManager> {
    let manager = manager();
    manager
        .initialize(&refresh_url(server), None)
        .expect("mock server URL is valid");
    manager
}

/// Stores marker `marker` with anti-CSRF token `token` bound to it
pub fn seed_session(manager: &SessionManager, marker: &str, token: &str) {
    let tokens = manager.tokens();
    tokens
        .set_id_marker(IdMarker::new(marker))
        .expect("memory store write");
    tokens
        .set_anti_forgery(Some(marker), token)
        .expect("memory store write");
}

/// Whether `request` carries a `Cookie` header containing `fragment`
pub fn sends_cookie(request: &Request, fragment: &str) -> bool {
    request.headers.iter().any(|(name, value)| {
        name.as_str().eq_ignore_ascii_case("cookie")
            && value.to_str().map_or(false, |value| value.contains(fragment))
    })
}
