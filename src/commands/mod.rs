//! Command handlers for the CLI
//!
//! Each handler takes an already-built [`SessionManager`] so the binary
//! owns storage and transport setup in one place.

use std::time::Duration;

use colored::Colorize;
use reqwest::Method;

use crate::error::{Result, SessionError};
use crate::session::SessionManager;
use crate::transport::SessionRequest;

/// Options for the `request` command
#[derive(Debug, Clone)]
pub struct RequestArgs {
    pub url: String,
    pub method: String,
    pub data: Option<String>,
    pub headers: Vec<String>,
    pub timeout: Option<u64>,
    pub no_redirects: bool,
}

/// Builds the [`SessionRequest`] described by `args`
///
/// # Errors
///
/// Returns [`SessionError::Configuration`] for an invalid URL, method or
/// header.
pub fn build_request(args: &RequestArgs) -> Result<SessionRequest> {
    let url = url::Url::parse(&args.url).map_err(|e| {
        SessionError::Configuration(format!("Invalid request URL '{}': {}", args.url, e))
    })?;
    let method = Method::from_bytes(args.method.to_uppercase().as_bytes()).map_err(|_| {
        SessionError::Configuration(format!("Invalid HTTP method: {}", args.method))
    })?;

    let mut request = SessionRequest::new(method, url).follow_redirects(!args.no_redirects);

    for header in &args.headers {
        let (name, value) = header.split_once(':').ok_or_else(|| {
            SessionError::Configuration(format!(
                "Invalid header '{}'; expected 'Name: value'",
                header
            ))
        })?;
        request = request.try_header(name.trim(), value.trim())?;
    }

    if let Some(data) = &args.data {
        request = request.body(data.clone());
    }

    if let Some(seconds) = args.timeout {
        request = request.timeout(Duration::from_secs(seconds));
    }

    Ok(request)
}

/// Sends one request through the session interceptor and prints the result
///
/// The status line and headers go to stderr, the body to stdout.
pub async fn run_request(manager: &SessionManager, args: RequestArgs) -> Result<()> {
    let request = build_request(&args)?;
    tracing::info!("{} {}", request.method, request.url);

    let response = manager.execute(request).await?;

    let status = format!("HTTP {}", response.status);
    if (200..300).contains(&response.status) {
        eprintln!("{}", status.green());
    } else {
        eprintln!("{}", status.yellow());
    }
    for (name, value) in &response.headers {
        eprintln!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
    }
    eprintln!();
    println!("{}", response.text());

    Ok(())
}

/// Prints what is known about the stored session
pub fn show_status(manager: &SessionManager) -> Result<()> {
    let snapshot = manager.tokens().snapshot()?;

    match &snapshot.marker {
        Some(marker) => {
            println!("{}", "Session may exist".green());
            match marker.expires_at {
                Some(at) => println!("  id marker expires: {}", at.to_rfc3339()),
                None => println!("  id marker expires: end of session"),
            }
            let bound = snapshot
                .anti_csrf
                .as_ref()
                .is_some_and(|entry| entry.is_bound_to(&marker.value));
            println!(
                "  anti-csrf token:   {}",
                if bound { "present" } else { "absent" }
            );
        }
        None => println!("{}", "No session".yellow()),
    }

    if let Some(config) = manager.config() {
        println!("  refresh endpoint:  {}", config.refresh_endpoint);
        println!("  expired status:    {}", config.session_expired_status_code);
    }

    Ok(())
}

/// Refreshes the session now
///
/// # Errors
///
/// Returns [`SessionError::SessionExpiredUnrecoverable`] when a session
/// existed but the backend refused to refresh it.
pub async fn refresh(manager: &SessionManager) -> Result<()> {
    if !manager.session_possibly_exists() {
        println!("{}", "No session to refresh".yellow());
        return Ok(());
    }

    if manager.attempt_refresh_session().await? {
        println!("{}", "Session refreshed".green());
        Ok(())
    } else {
        Err(SessionError::SessionExpiredUnrecoverable.into())
    }
}

/// Signs out with the backend and forgets the stored session
pub async fn sign_out(manager: &SessionManager) -> Result<()> {
    let had_session = manager.session_possibly_exists();
    manager.sign_out().await?;
    if had_session {
        println!("{}", "Signed out".green());
    } else {
        println!("{}", "No session; local state cleared".yellow());
    }
    Ok(())
}

/// Forgets the stored session
pub fn clear(manager: &SessionManager) -> Result<()> {
    manager.clear_session()?;
    println!("{}", "Session cleared".green());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(url: &str) -> RequestArgs {
        RequestArgs {
            url: url.to_string(),
            method: "get".to_string(),
            data: None,
            headers: Vec::new(),
            timeout: None,
            no_redirects: false,
        }
    }

    #[test]
    fn test_build_request_defaults() {
        let request = build_request(&args("https://api.example.com/items")).unwrap();
        assert_eq!(request.method, Method::GET);
        assert!(request.follow_redirects);
        assert!(request.body.is_none());
    }

    #[test]
    fn test_build_request_with_everything() {
        let mut a = args("https://api.example.com/items");
        a.method = "PATCH".to_string();
        a.data = Some("{\"a\":1}".to_string());
        a.headers = vec!["Content-Type: application/json".to_string()];
        a.timeout = Some(7);
        a.no_redirects = true;

        let request = build_request(&a).unwrap();
        assert_eq!(request.method, Method::PATCH);
        assert_eq!(request.headers.get("content-type").unwrap(), "application/json");
        assert_eq!(request.timeout, Some(Duration::from_secs(7)));
        assert!(!request.follow_redirects);
        assert_eq!(request.body.as_deref(), Some(&b"{\"a\":1}"[..]));
    }

    #[test]
    fn test_build_request_rejects_header_without_colon() {
        let mut a = args("https://api.example.com/items");
        a.headers = vec!["no-colon".to_string()];
        assert!(build_request(&a).is_err());
    }

    #[test]
    fn test_build_request_rejects_bad_url() {
        assert!(build_request(&args("not a url")).is_err());
    }
}
