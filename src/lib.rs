//! sessionkeeper - client-side session lifecycle manager
//!
//! Attaches the anti-CSRF token to outgoing calls, notices when the backend
//! reports an expired session, refreshes the session once even under
//! concurrent requests, and retries the original call.
//!
//! # Architecture
//!
//! - `session`: the session manager, refresh coordinator, request
//!   interceptor, cookie synchronizer and token store
//! - `transport`: the HTTP transport abstraction and its `reqwest` backend
//! - `storage`: durable key-value stores (memory, sled, keyring)
//! - `config`: configuration management and validation
//! - `error`: error types and result aliases
//! - `logging`: tracing subscriber setup
//! - `cli` and `commands`: the `sessionkeeper` command-line tool
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sessionkeeper::{Config, SessionManager, SessionRequest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = Arc::new(SessionManager::from_config(&Config::default())?);
//!     manager.initialize("https://api.example.com/auth/session/refresh", None)?;
//!
//!     let response = manager
//!         .execute(SessionRequest::get("https://api.example.com/me".parse()?))
//!         .await?;
//!     println!("{}", response.status);
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod session;
pub mod storage;
pub mod transport;

// Re-export commonly used types
pub use config::Config;
pub use error::{Result, SessionError};
pub use session::{RefreshOutcome, SessionManager};
pub use transport::{SessionRequest, SessionResponse};
