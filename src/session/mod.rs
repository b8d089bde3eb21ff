//! Session lifecycle management
//!
//! [`SessionManager`] is the application-facing context object. Hold one in
//! an `Arc`, call [`SessionManager::initialize`] once with the refresh
//! endpoint, and send requests through [`SessionManager::execute`]. The
//! manager attaches the anti-CSRF header, keeps the id marker in step with
//! response cookies, and refreshes an expired session once no matter how
//! many calls hit the expiry at the same time.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use sessionkeeper::session::SessionManager;
//! use sessionkeeper::config::Config;
//! use sessionkeeper::transport::SessionRequest;
//!
//! # async fn example() -> sessionkeeper::error::Result<()> {
//! let manager = Arc::new(SessionManager::from_config(&Config::default())?);
//! manager.initialize("https://api.example.com/auth/session/refresh", None)?;
//!
//! let request = SessionRequest::get("https://api.example.com/me".parse()?);
//! let response = manager.execute(request).await?;
//! println!("{} {}", response.status, response.text());
//! # Ok(())
//! # }
//! ```

pub mod anti_csrf;
pub mod cookies;
pub mod coordinator;
pub mod interceptor;
pub mod token_store;

use std::sync::{Arc, OnceLock};

use crate::config::{Config, SessionConfig};
use crate::error::{Result, SessionError};
use crate::storage::open_store;
use crate::transport::cookie_jar::PersistentCookieJar;
use crate::transport::http::ReqwestTransport;
use crate::transport::{CookieJar, HttpTransport, SessionRequest, SessionResponse};

pub use anti_csrf::AntiForgeryEntry;
pub use cookies::{CookieSynchronizer, MarkerUpdate};
pub use coordinator::{RefreshCoordinator, RefreshFailure, RefreshOutcome};
pub use interceptor::RequestInterceptor;
pub use token_store::{IdMarker, TokenSnapshot, TokenStore};

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

/// Client-side session manager
///
/// Everything except [`SessionManager::session_possibly_exists`],
/// [`SessionManager::clear_session`] and [`SessionManager::tokens`]
/// requires a prior successful [`SessionManager::initialize`].
#[derive(Debug)]
pub struct SessionManager {
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<TokenStore>,
    synchronizer: Arc<CookieSynchronizer>,
    interceptor: OnceLock<RequestInterceptor>,
}

impl SessionManager {
    /// Creates an uninitialized manager over the given collaborators
    ///
    /// `jar` must be the cookie jar `transport` reads from.
    pub fn new(transport: Arc<dyn HttpTransport>, jar: Arc<dyn CookieJar>, tokens: TokenStore) -> Self {
        let tokens = Arc::new(tokens);
        let synchronizer = Arc::new(CookieSynchronizer::new(jar, Arc::clone(&tokens)));

        Self {
            transport,
            tokens,
            synchronizer,
            interceptor: OnceLock::new(),
        }
    }

    /// Builds a manager from a loaded [`Config`]
    ///
    /// Opens the configured storage backend, a cookie jar persisted in the
    /// same backend, and a `reqwest` transport. When the config names a
    /// refresh endpoint the manager is also initialized with the config's
    /// session settings.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be opened, the HTTP client cannot
    /// be built, or the session settings are invalid.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = open_store(&config.storage)?;
        let jar: Arc<dyn CookieJar> = Arc::new(PersistentCookieJar::open(
            Arc::clone(&store),
            &config.storage.namespace,
        )?);
        let tokens = TokenStore::new(store, &config.storage.namespace);

        let transport = ReqwestTransport::new(Arc::clone(&jar), config.session.request_timeout())?;

        let manager = Self::new(Arc::new(transport), jar, tokens);
        if !config.session.refresh_endpoint.trim().is_empty() {
            manager.initialize_with(config.session.clone())?;
        }
        Ok(manager)
    }

    /// Configures the refresh endpoint and session-expired status
    ///
    /// `session_expired_status_code` defaults to 440. Safe to call from
    /// several tasks at once: every call validates its arguments, and the
    /// first valid call wins. Later valid calls are accepted and ignored.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`] if the endpoint is not an
    /// absolute http or https URL.
    pub fn initialize(
        &self,
        refresh_endpoint: &str,
        session_expired_status_code: Option<u16>,
    ) -> Result<()> {
        let mut config = SessionConfig::new(refresh_endpoint);
        if let Some(code) = session_expired_status_code {
            config.session_expired_status_code = code;
        }
        self.initialize_with(config)
    }

    /// Like [`SessionManager::initialize`] with full session settings
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`] if `config` does not validate.
    pub fn initialize_with(&self, config: SessionConfig) -> Result<()> {
        let interceptor = RequestInterceptor::new(
            config,
            Arc::clone(&self.transport),
            Arc::clone(&self.tokens),
            Arc::clone(&self.synchronizer),
        )?;

        match self.interceptor.set(interceptor) {
            Ok(()) => {
                tracing::info!(
                    "Session manager initialized for {}",
                    self.config().map(|c| c.refresh_endpoint.as_str()).unwrap_or_default()
                );
            }
            Err(_) => tracing::debug!("Session manager already initialized; keeping first settings"),
        }
        Ok(())
    }

    /// Whether [`SessionManager::initialize`] has succeeded
    pub fn is_initialized(&self) -> bool {
        self.interceptor.get().is_some()
    }

    /// Session settings in effect, once initialized
    pub fn config(&self) -> Option<&SessionConfig> {
        self.interceptor.get().map(RequestInterceptor::config)
    }

    /// Whether an id marker is stored, meaning a session might exist
    ///
    /// Storage failures are logged and reported as no session.
    pub fn session_possibly_exists(&self) -> bool {
        match self.tokens.id_marker() {
            Ok(marker) => marker.is_some(),
            Err(e) => {
                tracing::warn!("Could not read id marker: {}", e);
                false
            }
        }
    }

    /// Sends `request` with session handling
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`] before initialization and
    /// [`SessionError::Transport`] when the call fails to produce a response.
    pub async fn execute(&self, request: SessionRequest) -> Result<SessionResponse> {
        self.interceptor()?.execute(request).await
    }

    /// Refreshes the session now, outside of any request
    ///
    /// Returns `true` when a usable session exists afterwards and `false`
    /// when there is no session or the backend rejected the refresh.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`] before initialization, and
    /// the underlying failure when the refresh call itself failed.
    pub async fn attempt_refresh_session(&self) -> Result<bool> {
        let interceptor = self.interceptor()?;
        let marker = self.tokens.id_marker()?;
        if marker.is_none() {
            return Ok(false);
        }

        match interceptor.coordinator().refresh(marker).await {
            RefreshOutcome::Success => Ok(true),
            RefreshOutcome::Failure(RefreshFailure::SessionExpired) => Ok(false),
            RefreshOutcome::Failure(RefreshFailure::Transport(e)) => {
                Err(SessionError::Transport(e).into())
            }
            RefreshOutcome::Failure(RefreshFailure::Storage(e)) => {
                Err(SessionError::Storage(e).into())
            }
            RefreshOutcome::Failure(other) => Err(SessionError::RefreshFailed(other.to_string()).into()),
        }
    }

    /// Signs out with the backend, then forgets the session locally
    ///
    /// Posts to the sign-out endpoint through [`SessionManager::execute`], so
    /// the anti-CSRF header is attached and the cookies that remove the
    /// session are processed. Local state is cleared whatever the backend
    /// answers. Without a stored id marker no call is made.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`] before initialization or when
    /// no sign-out endpoint can be resolved, [`SessionError::Transport`] when
    /// the call fails, and [`SessionError::SignOutFailed`] when the backend
    /// answers with neither success nor the session-expired status.
    pub async fn sign_out(&self) -> Result<()> {
        let interceptor = self.interceptor()?;
        let url = interceptor.config().sign_out_url()?;

        if self.tokens.id_marker()?.is_none() {
            tracing::debug!("No session to sign out of");
            return self.clear_session();
        }

        tracing::info!("Signing out via {}", url);
        let result = interceptor.execute(SessionRequest::post(url)).await;
        self.clear_session()?;

        let status = result?.status;
        let expired = interceptor.config().session_expired_status_code;
        if (200..300).contains(&status) || status == expired {
            Ok(())
        } else {
            Err(SessionError::SignOutFailed(format!(
                "sign-out endpoint returned status {}",
                status
            ))
            .into())
        }
    }

    /// Forgets the id marker and anti-CSRF token locally
    ///
    /// Cookies already in the jar are left alone; the backend is not told.
    /// [`SessionManager::sign_out`] also informs the backend.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Storage`] if durable storage cannot be updated.
    pub fn clear_session(&self) -> Result<()> {
        tracing::info!("Clearing local session state");
        self.tokens.clear_id_marker()
    }

    /// The token store backing this manager
    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    /// Number of refresh calls sent so far; zero before initialization
    pub fn refresh_attempts(&self) -> u64 {
        self.interceptor
            .get()
            .map(|i| i.coordinator().refresh_attempts())
            .unwrap_or(0)
    }

    fn interceptor(&self) -> Result<&RequestInterceptor> {
        self.interceptor.get().ok_or_else(|| {
            SessionError::Configuration(
                "session manager is not initialized; call initialize first".to_string(),
            )
            .into()
        })
    }
}
