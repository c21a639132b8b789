//! Credential storage for MCP server OAuth.
//!
//! Each remote server gets its own namespace, keyed by a [`ServerIdentity`]
//! derived from its URL. Four independent records may exist per server:
//!
//! - `{id}_client_info.json`: dynamic client registration
//! - `{id}_tokens.json`: access/refresh tokens
//! - `{id}_code_verifier.txt`: PKCE verifier of an in-flight authorization
//! - `{id}_lock.json`: marker for a bound callback server
//!
//! # Storage Location
//!
//! By default records live in the platform data directory:
//! - Linux: `~/.local/share/mcpauth/mcp-oauth/`
//! - macOS: `~/Library/Application Support/mcpauth/mcp-oauth/`
//! - Windows: `%APPDATA%/mcpauth/mcp-oauth/`
//!
//! Files are created with restrictive permissions (0600 on Unix).
//!
//! # Example
//!
//! ```no_run
//! use mcpauth_store::{CredentialStore, ServerIdentity};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = CredentialStore::open_default()?;
//! let id = ServerIdentity::from_url("https://mcp.example.com/sse");
//!
//! match store.tokens(&id).await {
//!     Some(tokens) => println!("Have token of type {}", tokens.token_type),
//!     None => println!("Not signed in"),
//! }
//! # Ok(())
//! # }
//! ```

mod entity;
mod error;
mod identity;
mod store;

pub use entity::{
    ClientRegistration, EntityKind, Lockfile, TokenSet, Validate, EXPIRY_SKEW_SECS,
};
pub use error::{StoreError, StoreResult};
pub use identity::ServerIdentity;
pub use store::CredentialStore;

/// Get the default store directory for the current platform.
///
/// Returns `None` if the data directory cannot be determined.
pub fn default_store_dir() -> Option<std::path::PathBuf> {
    dirs::data_dir().map(|p| p.join("mcpauth").join("mcp-oauth"))
}
