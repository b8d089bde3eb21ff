//! Error types for sessionkeeper
//!
//! This module defines the error taxonomy used throughout the crate,
//! using `thiserror` for ergonomic error handling. Public functions return
//! [`Result`], an `anyhow` alias; callers that need to branch on the failure
//! class recover the [`SessionError`] with `downcast_ref`.

use thiserror::Error;

/// Main error type for sessionkeeper operations
///
/// Refresh-coordination races never surface as errors, and malformed cookie
/// or header data is logged and skipped rather than returned. Everything
/// else that reaches a caller is one of these variants.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Bad configuration or use before `initialize`; fatal and never retried
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Connection, timeout or DNS failure for the call in which it occurred
    #[error("Transport error: {0}")]
    Transport(String),

    /// The refresh endpoint rejected the refresh credential
    #[error("Session expired and cannot be refreshed")]
    SessionExpiredUnrecoverable,

    /// The refresh endpoint answered in a way that left no usable session
    #[error("Session refresh failed: {0}")]
    RefreshFailed(String),

    /// The backend rejected a sign-out call
    #[error("Sign-out failed: {0}")]
    SignOutFailed(String),

    /// Unparseable cookie or header data in a response
    #[error("Malformed response data: {0}")]
    MalformedResponse(String),

    /// Durable token storage failures
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// URL parsing errors
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// HTTP client construction errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Keyring/credential storage errors
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),
}

/// Result type alias for sessionkeeper operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_display() {
        let error = SessionError::Configuration("initialize was not called".to_string());
        assert_eq!(
            error.to_string(),
            "Configuration error: initialize was not called"
        );
    }

    #[test]
    fn test_transport_error_display() {
        let error = SessionError::Transport("connection reset".to_string());
        assert_eq!(error.to_string(), "Transport error: connection reset");
    }

    #[test]
    fn test_session_expired_error_display() {
        let error = SessionError::SessionExpiredUnrecoverable;
        assert_eq!(
            error.to_string(),
            "Session expired and cannot be refreshed"
        );
    }

    #[test]
    fn test_malformed_response_error_display() {
        let error = SessionError::MalformedResponse("bad cookie".to_string());
        assert_eq!(error.to_string(), "Malformed response data: bad cookie");
    }

    #[test]
    fn test_sign_out_failed_error_display() {
        let error = SessionError::SignOutFailed("status 500".to_string());
        assert_eq!(error.to_string(), "Sign-out failed: status 500");
    }

    #[test]
    fn test_storage_error_display() {
        let error = SessionError::Storage("flush failed".to_string());
        assert_eq!(error.to_string(), "Storage error: flush failed");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: SessionError = io_error.into();
        assert!(matches!(error, SessionError::Io(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{invalid json}").unwrap_err();
        let error: SessionError = json_error.into();
        assert!(matches!(error, SessionError::Serialization(_)));
    }

    #[test]
    fn test_url_error_conversion() {
        let url_error = url::Url::parse("not a url").unwrap_err();
        let error: SessionError = url_error.into();
        assert!(matches!(error, SessionError::Url(_)));
    }

    #[test]
    fn test_error_downcasts_from_anyhow() {
        let error: anyhow::Error = SessionError::Transport("timeout".to_string()).into();
        assert!(matches!(
            error.downcast_ref::<SessionError>(),
            Some(SessionError::Transport(_))
        ));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SessionError>();
    }
}
