//! Configuration management for sessionkeeper
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use crate::error::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Status code the backend uses to signal an expired session
pub const DEFAULT_SESSION_EXPIRED_STATUS: u16 = 440;

/// Main configuration structure for sessionkeeper
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Session refresh settings
    #[serde(default)]
    pub session: SessionConfig,
    /// Durable token storage settings
    #[serde(default)]
    pub storage: StorageConfig,
    /// Logging output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Session refresh configuration
///
/// Holds everything the refresh engine needs once `initialize` has run.
/// Only `refresh_endpoint` is mandatory; the remaining fields default to
/// the protocol's usual values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Absolute http(s) URL of the refresh endpoint
    #[serde(default)]
    pub refresh_endpoint: String,

    /// Response status that signals an expired session
    #[serde(default = "default_session_expired_status")]
    pub session_expired_status_code: u16,

    /// Default timeout for intercepted requests (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// Timeout for a single refresh call (seconds)
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_seconds: u64,

    /// Extra headers sent with every refresh call
    #[serde(default)]
    pub refresh_headers: BTreeMap<String, String>,

    /// Attach SDK name/version headers to intercepted requests
    #[serde(default = "default_send_sdk_headers")]
    pub send_sdk_headers: bool,

    /// Absolute URL of the backend sign-out endpoint
    ///
    /// When unset, it is derived from the refresh endpoint by replacing a
    /// trailing `/session/refresh` with `/signout`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign_out_endpoint: Option<String>,
}

/// Path suffix of a refresh endpoint whose sign-out URL can be derived
const REFRESH_PATH_SUFFIX: &str = "/session/refresh";

/// Path segment of the derived sign-out endpoint
const SIGN_OUT_SEGMENT: &str = "/signout";

fn default_session_expired_status() -> u16 {
    DEFAULT_SESSION_EXPIRED_STATUS
}

fn default_request_timeout() -> u64 {
    30
}

fn default_refresh_timeout() -> u64 {
    15
}

fn default_send_sdk_headers() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_endpoint: String::new(),
            session_expired_status_code: default_session_expired_status(),
            request_timeout_seconds: default_request_timeout(),
            refresh_timeout_seconds: default_refresh_timeout(),
            refresh_headers: BTreeMap::new(),
            send_sdk_headers: default_send_sdk_headers(),
            sign_out_endpoint: None,
        }
    }
}

impl SessionConfig {
    /// Creates a configuration for `refresh_endpoint` with default settings.
    ///
    /// # Examples
    ///
    /// ```
    /// use sessionkeeper::config::SessionConfig;
    ///
    /// let config = SessionConfig::new("https://api.example.com/auth/session/refresh");
    /// assert_eq!(config.session_expired_status_code, 440);
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn new(refresh_endpoint: impl Into<String>) -> Self {
        Self {
            refresh_endpoint: refresh_endpoint.into(),
            ..Self::default()
        }
    }

    /// Parses the refresh endpoint, rejecting anything but http/https.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`] when the endpoint is empty,
    /// unparseable, or uses another scheme.
    pub fn refresh_url(&self) -> Result<Url> {
        if self.refresh_endpoint.trim().is_empty() {
            return Err(
                SessionError::Configuration("refresh_endpoint must be set".to_string()).into(),
            );
        }

        let url = Url::parse(self.refresh_endpoint.trim()).map_err(|e| {
            SessionError::Configuration(format!(
                "Invalid refresh endpoint '{}': {}",
                self.refresh_endpoint, e
            ))
        })?;

        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(SessionError::Configuration(format!(
                "Refresh endpoint must use http or https, got '{}'",
                other
            ))
            .into()),
        }
    }

    /// Resolves the sign-out endpoint.
    ///
    /// An explicit `sign_out_endpoint` must be an http(s) URL on the refresh
    /// endpoint's origin, so that sign-out calls get session handling.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`] when the explicit endpoint is
    /// invalid, or when none is set and the refresh endpoint does not end in
    /// `/session/refresh`.
    pub fn sign_out_url(&self) -> Result<Url> {
        let refresh_url = self.refresh_url()?;

        let Some(endpoint) = &self.sign_out_endpoint else {
            let Some(base) = refresh_url.path().strip_suffix(REFRESH_PATH_SUFFIX) else {
                return Err(SessionError::Configuration(format!(
                    "sign_out_endpoint must be set when the refresh endpoint does not end in {}",
                    REFRESH_PATH_SUFFIX
                ))
                .into());
            };
            let mut url = refresh_url.clone();
            url.set_path(&format!("{}{}", base, SIGN_OUT_SEGMENT));
            url.set_query(None);
            return Ok(url);
        };

        let url = Url::parse(endpoint.trim()).map_err(|e| {
            SessionError::Configuration(format!("Invalid sign-out endpoint '{}': {}", endpoint, e))
        })?;
        if url.origin() != refresh_url.origin() {
            return Err(SessionError::Configuration(format!(
                "Sign-out endpoint {} must share the refresh endpoint's origin",
                url
            ))
            .into());
        }
        Ok(url)
    }

    /// Timeout applied to intercepted requests that do not set their own.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Timeout applied to each refresh call.
    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_seconds)
    }

    /// Validate the session settings
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`] if any check fails.
    pub fn validate(&self) -> Result<()> {
        self.refresh_url()?;

        if !(100..=599).contains(&self.session_expired_status_code) {
            return Err(SessionError::Configuration(format!(
                "session_expired_status_code must be a valid HTTP status, got {}",
                self.session_expired_status_code
            ))
            .into());
        }

        if self.request_timeout_seconds == 0 {
            return Err(SessionError::Configuration(
                "request_timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        if self.refresh_timeout_seconds == 0 {
            return Err(SessionError::Configuration(
                "refresh_timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        if self.sign_out_endpoint.is_some() {
            self.sign_out_url()?;
        }

        for (name, value) in &self.refresh_headers {
            if reqwest::header::HeaderName::from_bytes(name.as_bytes()).is_err() {
                return Err(SessionError::Configuration(format!(
                    "Invalid refresh header name: {}",
                    name
                ))
                .into());
            }
            if reqwest::header::HeaderValue::from_str(value).is_err() {
                return Err(SessionError::Configuration(format!(
                    "Invalid value for refresh header {}",
                    name
                ))
                .into());
            }
        }

        Ok(())
    }
}

/// Durable storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-process only; markers are lost when the process exits
    Memory,
    /// Embedded sled database on disk
    #[default]
    Sled,
    /// OS credential store
    Keyring,
}

impl std::str::FromStr for StorageBackend {
    type Err = SessionError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sled" => Ok(Self::Sled),
            "keyring" => Ok(Self::Keyring),
            other => Err(SessionError::Configuration(format!(
                "Unknown storage backend: {}. Must be one of: memory, sled, keyring",
                other
            ))),
        }
    }
}

/// Durable token storage configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Which backend holds the id marker and anti-CSRF token
    #[serde(default)]
    pub backend: StorageBackend,

    /// Database directory for the sled backend
    ///
    /// When unset, a `tokens.sled` directory under the platform data
    /// directory is used.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Prefix for every stored key
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_namespace() -> String {
    "sessionkeeper".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: None,
            namespace: default_namespace(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json_format: bool,

    /// Optional file that receives a copy of every log line
    #[serde(default)]
    pub file_path: Option<String>,
}

fn default_log_level() -> String {
    "sessionkeeper=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from file, environment, and CLI overrides
    ///
    /// A missing file is not an error; defaults are used and a warning is
    /// logged.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`] if the file exists but cannot
    /// be read or parsed.
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SessionError::Configuration(format!("Failed to read config file: {}", e))
        })?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML document
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).map_err(|e| {
            SessionError::Configuration(format!("Failed to parse config: {}", e)).into()
        })
    }

    fn apply_env_vars(&mut self) {
        if let Ok(endpoint) = std::env::var("SESSIONKEEPER_REFRESH_ENDPOINT") {
            self.session.refresh_endpoint = endpoint;
        }

        if let Ok(code) = std::env::var("SESSIONKEEPER_SESSION_EXPIRED_STATUS") {
            if let Ok(value) = code.parse() {
                self.session.session_expired_status_code = value;
            } else {
                tracing::warn!("Invalid SESSIONKEEPER_SESSION_EXPIRED_STATUS: {}", code);
            }
        }

        if let Ok(timeout) = std::env::var("SESSIONKEEPER_REQUEST_TIMEOUT_SECONDS") {
            if let Ok(value) = timeout.parse() {
                self.session.request_timeout_seconds = value;
            } else {
                tracing::warn!("Invalid SESSIONKEEPER_REQUEST_TIMEOUT_SECONDS: {}", timeout);
            }
        }

        if let Ok(timeout) = std::env::var("SESSIONKEEPER_REFRESH_TIMEOUT_SECONDS") {
            if let Ok(value) = timeout.parse() {
                self.session.refresh_timeout_seconds = value;
            } else {
                tracing::warn!("Invalid SESSIONKEEPER_REFRESH_TIMEOUT_SECONDS: {}", timeout);
            }
        }

        if let Ok(endpoint) = std::env::var("SESSIONKEEPER_SIGN_OUT_ENDPOINT") {
            self.session.sign_out_endpoint = Some(endpoint);
        }

        if let Ok(backend) = std::env::var("SESSIONKEEPER_STORAGE_BACKEND") {
            match backend.parse() {
                Ok(value) => self.storage.backend = value,
                Err(e) => tracing::warn!("Invalid SESSIONKEEPER_STORAGE_BACKEND: {}", e),
            }
        }

        if let Ok(path) = std::env::var("SESSIONKEEPER_STORAGE_PATH") {
            self.storage.path = Some(PathBuf::from(path));
        }

        if let Ok(namespace) = std::env::var("SESSIONKEEPER_STORAGE_NAMESPACE") {
            self.storage.namespace = namespace;
        }

        if let Ok(level) = std::env::var("SESSIONKEEPER_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if let Some(endpoint) = &cli.refresh_endpoint {
            self.session.refresh_endpoint = endpoint.clone();
        }
        if let Some(backend) = cli.storage {
            self.storage.backend = backend;
        }
        if let Some(path) = &cli.storage_path {
            self.storage.path = Some(path.clone());
        }
        if cli.verbose {
            self.logging.level = "sessionkeeper=debug".to_string();
        }
        if cli.json_logs {
            self.logging.json_format = true;
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;

        if self.storage.namespace.trim().is_empty() {
            return Err(SessionError::Configuration(
                "storage namespace cannot be empty".to_string(),
            )
            .into());
        }

        if self.logging.level.trim().is_empty() {
            return Err(
                SessionError::Configuration("logging level cannot be empty".to_string()).into(),
            );
        }

        Ok(())
    }
}
