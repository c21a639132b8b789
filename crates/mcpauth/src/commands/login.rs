//! Interactive sign-in.

use crate::config::Settings;
use mcpauth_oauth::{AuthorizationFlow, FlowState, ManualBrowser, OAuthError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Options of `mcpauth login`.
#[derive(Debug, Default)]
pub struct LoginOptions {
    pub scope: Option<String>,
    pub timeout: Option<u64>,
    pub port: Option<u16>,
    pub no_browser: bool,
}

/// Sign in to the MCP server at `url`.
pub async fn login(settings: &Settings, url: &str, options: LoginOptions) -> anyhow::Result<()> {
    let mut config = settings.oauth_config(url);
    if let Some(scope) = options.scope {
        config.scope = Some(scope);
    }
    if let Some(secs) = options.timeout {
        config.timeout = Duration::from_secs(secs);
    }
    if let Some(port) = options.port {
        config.callback_port = port;
    }

    let store = settings.store()?;
    let mut flow = AuthorizationFlow::new(url, config, store);
    if options.no_browser {
        flow = flow.with_browser(Arc::new(ManualBrowser));
    }

    info!(server = %url, identity = %flow.identity(), "Starting login");

    let progress = tokio::spawn(report_progress(flow.subscribe(), options.no_browser));

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("Interrupt received, cancelling login");
                cancel.cancel();
            }
        })
    };

    let result = flow.authorize(cancel).await;
    ctrl_c.abort();
    drop(flow);
    let _ = progress.await;

    match result {
        Ok(tokens) => {
            println!("✓ Signed in to {url}");
            if let Some(expires_at) = tokens.expires_at {
                println!("  Access token expires {}", format_timestamp(expires_at));
            }
            Ok(())
        }
        Err(OAuthError::Cancelled) => Err(anyhow::anyhow!("Login cancelled")),
        Err(e) => Err(e.into()),
    }
}

/// Print flow progress until the flow ends.
async fn report_progress(mut states: tokio::sync::watch::Receiver<FlowState>, manual: bool) {
    while states.changed().await.is_ok() {
        let state = states.borrow_and_update().clone();
        match &state {
            FlowState::Refreshing => println!("Refreshing access token..."),
            FlowState::Registering => println!("Registering client with the authorization server..."),
            FlowState::AwaitingUserAction { authorization_url } => {
                if manual {
                    println!("Open this URL in your browser to sign in:");
                } else {
                    println!("Opening your browser to sign in. If it does not open, visit:");
                }
                println!();
                println!("  {authorization_url}");
                println!();
                println!("Waiting for authorization (Ctrl-C to cancel)...");
            }
            FlowState::ExchangingCode => println!("Exchanging authorization code..."),
            _ => {}
        }
        if state.is_terminal() {
            break;
        }
    }
}

/// Render a Unix timestamp in local time.
pub(crate) fn format_timestamp(secs: u64) -> String {
    let utc = i64::try_from(secs)
        .ok()
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0));
    match utc {
        Some(utc) => utc
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => secs.to_string(),
    }
}
