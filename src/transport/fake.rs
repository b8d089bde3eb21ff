//! Scripted in-process transport for unit tests
//!
//! [`FakeTransport`] answers every request by calling a handler closure and
//! records what was sent, so tests can assert on headers, call counts and
//! ordering without a network.
//!
//! # Example
//!
//! ```ignore
//! let transport = FakeTransport::new(|request| {
//!     Ok(SessionResponse::new(200, request.url.clone()))
//! });
//! transport.send(&SessionRequest::get(url)).await?;
//! assert_eq!(transport.requests().len(), 1);
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::Result;
use crate::transport::{HttpTransport, SessionRequest, SessionResponse};

type Handler = dyn Fn(&SessionRequest) -> Result<SessionResponse> + Send + Sync;

/// In-process fake transport for use in tests.
pub struct FakeTransport {
    /// Produces the response for each request
    handler: Box<Handler>,
    /// Every request received, in order
    requests: Arc<Mutex<Vec<SessionRequest>>>,
    /// Artificial latency applied to requests whose path ends with the key
    delays: Vec<(String, Duration)>,
}

impl std::fmt::Debug for FakeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeTransport")
            .field("delays", &self.delays)
            .finish_non_exhaustive()
    }
}

impl FakeTransport {
    /// Create a transport that answers with `handler`
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&SessionRequest) -> Result<SessionResponse> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            requests: Arc::new(Mutex::new(Vec::new())),
            delays: Vec::new(),
        }
    }

    /// Delay responses for paths ending with `path_suffix`
    pub fn with_delay(mut self, path_suffix: &str, delay: Duration) -> Self {
        self.delays.push((path_suffix.to_string(), delay));
        self
    }

    /// Snapshot of every request sent so far
    pub fn requests(&self) -> Vec<SessionRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of requests whose path ends with `path_suffix`
    pub fn count(&self, path_suffix: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.path().ends_with(path_suffix))
            .count()
    }
}

#[async_trait::async_trait]
impl HttpTransport for FakeTransport {
    async fn send(&self, request: &SessionRequest) -> Result<SessionResponse> {
        self.requests.lock().unwrap().push(request.clone());

        let delay = self
            .delays
            .iter()
            .find(|(suffix, _)| request.url.path().ends_with(suffix.as_str()))
            .map(|(_, d)| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        (self.handler)(request)
    }
}
