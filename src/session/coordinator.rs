//! Single-flight session refresh
//!
//! [`RefreshCoordinator::refresh`] guarantees that at most one refresh call
//! is in flight per manager. The first expired caller starts the refresh on
//! a spawned task and publishes a shared handle to its outcome; everyone who
//! arrives while it runs with the same observed id marker awaits the same
//! handle and receives the same [`RefreshOutcome`]. A caller that observed a
//! different marker waits for the running refresh to end and then decides
//! again for its own marker.
//!
//! The pending slot is released by a guard owned by the spawned task, so it
//! returns to idle whether the refresh finishes, fails, or panics. Dropping
//! a waiting caller never cancels the refresh itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};
use url::Url;

use crate::config::SessionConfig;
use crate::session::cookies::{
    CookieSynchronizer, MarkerUpdate, ANTI_CSRF_HEADER, SDK_NAME, SDK_NAME_HEADER, SDK_VERSION,
    SDK_VERSION_HEADER,
};
use crate::session::token_store::TokenStore;
use crate::transport::{HttpTransport, SessionRequest, SessionResponse};

/// Why a refresh did not produce a usable session
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshFailure {
    /// No id marker exists, or the backend rejected the refresh credential
    #[error("session expired; sign in again")]
    SessionExpired,

    /// The refresh endpoint answered with a status other than success or
    /// session-expired
    #[error("refresh endpoint returned unexpected status {0}")]
    UnexpectedStatus(u16),

    /// The refresh call never produced a response
    #[error("refresh call failed: {0}")]
    Transport(String),

    /// The refresh task ended without producing an outcome
    #[error("refresh aborted: {0}")]
    Aborted(String),

    /// Token state could not be read or written
    #[error("token storage failed during refresh: {0}")]
    Storage(String),
}

/// Result of one refresh attempt, shared by every waiting caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A usable session exists; the original call may be retried
    Success,
    /// The session could not be refreshed
    Failure(RefreshFailure),
}

impl RefreshOutcome {
    /// Whether the refresh left a usable session
    pub fn is_success(&self) -> bool {
        matches!(self, RefreshOutcome::Success)
    }
}

type SharedOutcome = Shared<BoxFuture<'static, RefreshOutcome>>;

struct PendingRefresh {
    generation: u64,
    /// Marker the starting caller saw expire
    observed_marker: Option<String>,
    outcome: SharedOutcome,
}

struct CoordinatorInner {
    config: SessionConfig,
    refresh_url: Url,
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<TokenStore>,
    synchronizer: Arc<CookieSynchronizer>,
    pending: Mutex<Option<PendingRefresh>>,
    generations: AtomicU64,
    attempts: AtomicU64,
}

/// Serializes refresh calls for one session manager
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("refresh_url", &self.inner.refresh_url.as_str())
            .field("attempts", &self.refresh_attempts())
            .field("refreshing", &self.is_refreshing())
            .finish()
    }
}

/// Clears the pending slot when the refresh task ends, however it ends
struct PendingRelease {
    inner: Arc<CoordinatorInner>,
    generation: u64,
}

impl Drop for PendingRelease {
    fn drop(&mut self) {
        let mut pending = lock_pending(&self.inner.pending);
        if pending
            .as_ref()
            .is_some_and(|p| p.generation == self.generation)
        {
            *pending = None;
        }
    }
}

fn lock_pending(pending: &Mutex<Option<PendingRefresh>>) -> MutexGuard<'_, Option<PendingRefresh>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RefreshCoordinator {
    /// Creates an idle coordinator posting to `refresh_url`
    pub fn new(
        config: SessionConfig,
        refresh_url: Url,
        transport: Arc<dyn HttpTransport>,
        tokens: Arc<TokenStore>,
        synchronizer: Arc<CookieSynchronizer>,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                refresh_url,
                transport,
                tokens,
                synchronizer,
                pending: Mutex::new(None),
                generations: AtomicU64::new(0),
                attempts: AtomicU64::new(0),
            }),
        }
    }

    /// Refreshes the session that `observed_marker` belonged to
    ///
    /// Joins the refresh already in flight if it was started for the same
    /// marker. Must be called from within a tokio runtime.
    pub async fn refresh(&self, observed_marker: Option<String>) -> RefreshOutcome {
        loop {
            let (outcome, same_marker) = {
                let mut pending = lock_pending(&self.inner.pending);
                match pending.as_ref() {
                    Some(running) => {
                        let same_marker = running.observed_marker == observed_marker;
                        if same_marker {
                            tracing::debug!("Joining refresh already in flight");
                        } else {
                            tracing::debug!("Waiting for refresh started for another id marker");
                        }
                        (running.outcome.clone(), same_marker)
                    }
                    None => {
                        let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst);
                        let outcome = self.start(generation, observed_marker.clone());
                        *pending = Some(PendingRefresh {
                            generation,
                            observed_marker: observed_marker.clone(),
                            outcome: outcome.clone(),
                        });
                        (outcome, true)
                    }
                }
            };

            let result = outcome.await;
            if same_marker {
                return result;
            }
        }
    }

    /// Whether a refresh is currently in flight
    pub fn is_refreshing(&self) -> bool {
        lock_pending(&self.inner.pending).is_some()
    }

    /// Number of refresh calls sent to the network so far
    pub fn refresh_attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    fn start(&self, generation: u64, observed_marker: Option<String>) -> SharedOutcome {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let _release = PendingRelease {
                inner: Arc::clone(&inner),
                generation,
            };
            inner.run(observed_marker).await
        });

        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!("Refresh task ended abnormally: {}", e);
                    RefreshOutcome::Failure(RefreshFailure::Aborted(e.to_string()))
                }
            }
        }
        .boxed()
        .shared()
    }
}

impl CoordinatorInner {
    async fn run(&self, observed_marker: Option<String>) -> RefreshOutcome {
        let current = match self.tokens.id_marker() {
            Ok(current) => current,
            Err(e) => return storage_failure(e),
        };

        let Some(current) = current else {
            tracing::debug!("No id marker present; nothing to refresh");
            return RefreshOutcome::Failure(RefreshFailure::SessionExpired);
        };

        if observed_marker.as_deref() != Some(current.as_str()) {
            tracing::debug!("Id marker changed since the expired call; skipping refresh");
            return RefreshOutcome::Success;
        }

        let request = match self.build_request(&current) {
            Ok(request) => request,
            Err(e) => return RefreshOutcome::Failure(RefreshFailure::Transport(e.to_string())),
        };

        self.attempts.fetch_add(1, Ordering::SeqCst);
        tracing::info!("Refreshing session via {}", self.refresh_url);

        let timeout = self.config.refresh_timeout();
        let response = match tokio::time::timeout(timeout, self.transport.send(&request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::warn!("Session refresh failed: {}", e);
                return RefreshOutcome::Failure(RefreshFailure::Transport(e.to_string()));
            }
            Err(_) => {
                tracing::warn!("Session refresh timed out after {:?}", timeout);
                return RefreshOutcome::Failure(RefreshFailure::Transport(format!(
                    "timed out after {:?}",
                    timeout
                )));
            }
        };

        let outcome = self.evaluate(&response);
        match &outcome {
            RefreshOutcome::Success => tracing::info!("Session refreshed"),
            RefreshOutcome::Failure(reason) => tracing::warn!("Session refresh failed: {}", reason),
        }
        outcome
    }

    fn build_request(&self, marker: &str) -> crate::error::Result<SessionRequest> {
        let mut request = SessionRequest::post(self.refresh_url.clone())
            .timeout(self.config.refresh_timeout());

        if let Some(token) = self.tokens.anti_forgery(Some(marker))? {
            request = request.try_header(ANTI_CSRF_HEADER, &token)?;
        }

        for (name, value) in &self.config.refresh_headers {
            request = request.try_header(name, value)?;
        }

        if self.config.send_sdk_headers {
            request = request
                .try_header(SDK_NAME_HEADER, SDK_NAME)?
                .try_header(SDK_VERSION_HEADER, SDK_VERSION)?;
        }

        Ok(request)
    }

    fn evaluate(&self, response: &SessionResponse) -> RefreshOutcome {
        let update = match self.synchronizer.apply(response) {
            Ok(update) => update,
            Err(e) => return storage_failure(e),
        };

        if response.status == self.config.session_expired_status_code {
            if update == MarkerUpdate::Set {
                tracing::warn!("Refresh endpoint reported expiry but also issued a new id marker");
                return RefreshOutcome::Failure(RefreshFailure::UnexpectedStatus(response.status));
            }
            if let Err(e) = self.tokens.clear_id_marker() {
                return storage_failure(e);
            }
            return RefreshOutcome::Failure(RefreshFailure::SessionExpired);
        }

        if !(200..300).contains(&response.status) {
            return RefreshOutcome::Failure(RefreshFailure::UnexpectedStatus(response.status));
        }

        if update == MarkerUpdate::Cleared {
            return RefreshOutcome::Failure(RefreshFailure::SessionExpired);
        }

        match self.tokens.id_marker() {
            Ok(Some(_)) => RefreshOutcome::Success,
            Ok(None) => RefreshOutcome::Failure(RefreshFailure::SessionExpired),
            Err(e) => storage_failure(e),
        }
    }
}

fn storage_failure(e: anyhow::Error) -> RefreshOutcome {
    tracing::error!("Token storage failed during refresh: {}", e);
    RefreshOutcome::Failure(RefreshFailure::Storage(e.to_string()))
}
