//! OAuth 2.0 authorization for remote MCP servers.
//!
//! This crate runs the authorization code + PKCE flow on behalf of a desktop
//! process:
//!
//! - Discovery of the authorization server endpoints
//! - Dynamic client registration
//! - A loopback HTTP listener that catches the browser redirect
//! - Code exchange and token refresh
//!
//! Credentials are persisted through [`mcpauth_store::CredentialStore`].
//!
//! # Example
//!
//! ```no_run
//! use mcpauth_oauth::{AuthorizationFlow, OAuthConfig};
//! use mcpauth_store::CredentialStore;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = CredentialStore::open_default()?;
//! let flow = AuthorizationFlow::new("https://mcp.example.com/sse", OAuthConfig::default(), store);
//!
//! let tokens = flow.authorize(CancellationToken::new()).await?;
//! println!("Authorized, token type {}", tokens.token_type);
//! # Ok(())
//! # }
//! ```

mod browser;
mod callback;
mod client;
mod config;
mod error;
mod flow;
pub mod pkce;

pub use browser::{BrowserLauncher, ManualBrowser, SystemBrowser};
pub use callback::{CallbackServer, CodeReceiver};
pub use client::{
    build_authorization_url, server_origin, AuthServerMetadata, OAuthClient, TokenResponse,
};
pub use config::{
    ClientMetadata, OAuthConfig, DEFAULT_AUTHORIZATION_TIMEOUT, DEFAULT_CALLBACK_PATH,
    DEFAULT_CALLBACK_PORT,
};
pub use error::{FailureKind, OAuthError, OAuthResult};
pub use flow::{AuthorizationFlow, FlowState};
