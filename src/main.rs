//! sessionkeeper - session-aware HTTP client
//!
#![doc = "Main entry point for the sessionkeeper command-line tool."]

use anyhow::Result;

use sessionkeeper::cli::{Cli, Commands};
use sessionkeeper::commands::{self, RequestArgs};
use sessionkeeper::config::Config;
use sessionkeeper::logging::init_logging;
use sessionkeeper::session::SessionManager;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    let config_path = cli.config.as_deref().unwrap_or("config/sessionkeeper.yaml");
    let config = Config::load(config_path, &cli)?;

    init_logging(&config.logging)?;

    // status and clear work on stored tokens alone; everything that talks
    // to the backend needs a valid refresh endpoint.
    if matches!(
        cli.command,
        Commands::Request { .. } | Commands::Refresh | Commands::SignOut
    ) {
        config.validate()?;
    }

    let manager = SessionManager::from_config(&config)?;

    match cli.command {
        Commands::Request {
            url,
            method,
            data,
            headers,
            timeout,
            no_redirects,
        } => {
            let args = RequestArgs {
                url,
                method,
                data,
                headers,
                timeout,
                no_redirects,
            };
            commands::run_request(&manager, args).await?;
        }
        Commands::Status => commands::show_status(&manager)?,
        Commands::Refresh => {
            tracing::info!("Starting manual session refresh");
            commands::refresh(&manager).await?;
        }
        Commands::SignOut => commands::sign_out(&manager).await?,
        Commands::Clear => commands::clear(&manager)?,
    }

    Ok(())
}
