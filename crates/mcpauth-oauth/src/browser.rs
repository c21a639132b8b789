//! Launching the authorization URL in a browser.

use crate::error::{OAuthError, OAuthResult};
use async_trait::async_trait;
use tracing::info;

/// Opens the authorization URL for the user.
///
/// Failures are not fatal to the flow: the URL is also published through
/// the flow state so a host can show it for manual opening.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn open(&self, url: &str) -> OAuthResult<()>;
}

/// The user's default system browser.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBrowser;

#[async_trait]
impl BrowserLauncher for SystemBrowser {
    async fn open(&self, url: &str) -> OAuthResult<()> {
        let url = url.to_string();
        tokio::task::spawn_blocking(move || open::that(url))
            .await
            .map_err(|e| OAuthError::BrowserLaunch(e.to_string()))?
            .map_err(|e| OAuthError::BrowserLaunch(e.to_string()))?;
        info!("Browser opened automatically");
        Ok(())
    }
}

/// Does nothing; the host shows the URL itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualBrowser;

#[async_trait]
impl BrowserLauncher for ManualBrowser {
    async fn open(&self, _url: &str) -> OAuthResult<()> {
        Ok(())
    }
}
