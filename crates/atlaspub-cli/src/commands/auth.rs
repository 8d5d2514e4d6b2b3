//! Auth commands - device-code login, logout and session status
//!
//! `login` shows the verification URL and user code, opens the browser
//! when possible, then polls until the user approves or the code expires.
//! Tokens end up in the system keyring via the auth workflow's storage.

use anyhow::{Context, Result};
use atlaspub_api::auth::AuthState;
use clap::Subcommand;
use tracing::{debug, info};

use crate::context::AppContext;

#[derive(Debug, Subcommand)]
pub enum AuthCommand {
    /// Log in with the device-code flow
    Login {
        /// Don't try to open the verification page in a browser
        #[arg(long)]
        no_browser: bool,
    },
    /// Remove stored credentials
    Logout,
    /// Check authentication status
    Status,
}

impl AuthCommand {
    pub async fn execute(&self, ctx: &AppContext) -> Result<()> {
        match self {
            AuthCommand::Login { no_browser } => execute_login(ctx, *no_browser).await,
            AuthCommand::Logout => execute_logout(ctx).await,
            AuthCommand::Status => execute_status(ctx).await,
        }
    }
}

async fn execute_login(ctx: &AppContext, no_browser: bool) -> Result<()> {
    let fmt = ctx.formatter();
    let auth = ctx.auth()?;

    let login = auth
        .begin_login()
        .await
        .context("Failed to start the login flow")?;

    let open_url = login
        .verification_uri_complete
        .as_deref()
        .unwrap_or(&login.verification_uri);

    if ctx.is_json() {
        fmt.print_json(&serde_json::json!({
            "event": "device_code",
            "verification_uri": login.verification_uri,
            "verification_uri_complete": login.verification_uri_complete,
            "user_code": login.user_code,
            "expires_in_secs": login.expires_in.as_secs(),
        }));
    } else {
        fmt.info(&format!("Open {} and enter the code:", login.verification_uri));
        fmt.info("");
        fmt.info(&format!("    {}", login.user_code));
        fmt.info("");
    }

    if !no_browser {
        if let Err(e) = webbrowser::open(open_url) {
            debug!(error = %e, "Could not open browser");
            fmt.warn("Could not open a browser; visit the URL above manually");
        }
    }

    fmt.info("Waiting for approval...");
    let user = auth.poll_or_complete().await.context("Login failed")?;
    info!(user = %user.id, "Login complete");

    if ctx.is_json() {
        fmt.print_json(&serde_json::json!({
            "success": true,
            "user": user,
            "expires_at": auth.expires_at(),
        }));
    } else {
        fmt.success(&format!("Logged in as {} ({})", user.name, user.email));
    }
    Ok(())
}

async fn execute_logout(ctx: &AppContext) -> Result<()> {
    let fmt = ctx.formatter();
    let auth = ctx.auth()?;

    if auth.state() == AuthState::LoggedOut {
        fmt.info("Not logged in. Nothing to log out.");
        return Ok(());
    }

    auth.logout().await.context("Failed to clear stored credentials")?;
    fmt.success("Logged out");
    Ok(())
}

async fn execute_status(ctx: &AppContext) -> Result<()> {
    let fmt = ctx.formatter();
    let auth = ctx.auth()?;

    if auth.state() == AuthState::LoggedOut {
        if ctx.is_json() {
            fmt.print_json(&serde_json::json!({"logged_in": false}));
        } else {
            fmt.warn("Not logged in. Run `atlaspub auth login`.");
        }
        return Ok(());
    }

    // Refreshes a stale token before asking who we are
    let user = auth.current_user().await;

    if ctx.is_json() {
        let value = match &user {
            Ok(user) => serde_json::json!({
                "logged_in": true,
                "state": auth.state().to_string(),
                "user": user,
                "expires_at": auth.expires_at(),
            }),
            Err(e) => serde_json::json!({
                "logged_in": auth.is_logged_in(),
                "state": auth.state().to_string(),
                "error": e.to_string(),
            }),
        };
        fmt.print_json(&value);
        return Ok(());
    }

    match user {
        Ok(user) => {
            fmt.success(&format!("Logged in as {} ({})", user.name, user.email));
            if let Some(expires_at) = auth.expires_at() {
                fmt.info(&format!("Access token expires: {}", expires_at.to_rfc3339()));
            }
        }
        Err(e) => {
            fmt.error(&format!("Session is {}: {}", auth.state(), e));
            fmt.info("Run `atlaspub auth login` to sign in again.");
        }
    }
    Ok(())
}
