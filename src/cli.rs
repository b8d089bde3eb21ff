//! Command-line interface definition for sessionkeeper
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands to issue session-aware requests and inspect or reset
//! the stored session.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::StorageBackend;

/// sessionkeeper - session-aware HTTP client
///
/// Sends requests with the stored anti-CSRF token attached and refreshes
/// the session transparently when the backend reports it as expired.
#[derive(Parser, Debug, Clone)]
#[command(name = "sessionkeeper")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/sessionkeeper.yaml")]
    pub config: Option<String>,

    /// Override the refresh endpoint from config
    #[arg(long, env = "SESSIONKEEPER_REFRESH_ENDPOINT")]
    pub refresh_endpoint: Option<String>,

    /// Override the storage backend (memory, sled, keyring)
    #[arg(long)]
    pub storage: Option<StorageBackend>,

    /// Override the sled database directory
    #[arg(long)]
    pub storage_path: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for sessionkeeper
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Send a request through the session interceptor
    Request {
        /// Target URL
        url: String,

        /// HTTP method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Request body
        #[arg(short, long)]
        data: Option<String>,

        /// Extra request header in `Name: value` form (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Per-request timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Do not follow redirects
        #[arg(long)]
        no_redirects: bool,
    },

    /// Report whether a session may exist
    Status,

    /// Refresh the session now
    Refresh,

    /// Sign out with the backend, then forget the stored session
    #[command(name = "signout")]
    SignOut,

    /// Forget the stored session marker and anti-CSRF token
    Clear,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
