//! OAuth flow configuration.

use serde::Serialize;
use std::time::Duration;

/// Default loopback callback port.
pub const DEFAULT_CALLBACK_PORT: u16 = 12346;

/// Default loopback callback path.
pub const DEFAULT_CALLBACK_PATH: &str = "/oauth/callback";

/// Default time to wait for the user to finish signing in.
pub const DEFAULT_AUTHORIZATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Configuration of one authorization flow.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    /// Port the loopback callback server listens on.
    pub callback_port: u16,
    /// Path the authorization server redirects to.
    pub callback_path: String,
    /// Host used in the redirect URI.
    pub redirect_host: String,
    /// Client name sent during dynamic registration.
    pub client_name: String,
    /// Client homepage sent during dynamic registration.
    pub client_uri: String,
    /// Requested scopes.
    pub scope: Option<String>,
    /// Pre-registered client ID. Skips dynamic registration when set.
    pub client_id: Option<String>,
    /// Pre-registered client secret.
    pub client_secret: Option<String>,
    /// How long to wait for the browser callback.
    pub timeout: Duration,
    /// Age after which another attempt's lockfile is ignored.
    pub lock_stale_after: Duration,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            callback_port: DEFAULT_CALLBACK_PORT,
            callback_path: DEFAULT_CALLBACK_PATH.to_string(),
            redirect_host: "localhost".to_string(),
            client_name: "mcpauth".to_string(),
            client_uri: "https://github.com/mcpauth/mcpauth".to_string(),
            scope: None,
            client_id: None,
            client_secret: None,
            timeout: DEFAULT_AUTHORIZATION_TIMEOUT,
            lock_stale_after: Duration::from_secs(10 * 60),
        }
    }
}

impl OAuthConfig {
    /// The redirect URI registered with, and sent to, the authorization server.
    pub fn redirect_url(&self) -> String {
        format!(
            "http://{}:{}{}",
            self.redirect_host, self.callback_port, self.callback_path
        )
    }

    /// Metadata sent to the registration endpoint.
    pub fn client_metadata(&self) -> ClientMetadata {
        ClientMetadata {
            redirect_uris: vec![self.redirect_url()],
            token_endpoint_auth_method: "none".to_string(),
            grant_types: vec![
                "authorization_code".to_string(),
                "refresh_token".to_string(),
            ],
            response_types: vec!["code".to_string()],
            client_name: self.client_name.clone(),
            client_uri: self.client_uri.clone(),
            scope: self.scope.clone(),
        }
    }
}

/// Dynamic client registration request body (RFC 7591).
#[derive(Debug, Clone, Serialize)]
pub struct ClientMetadata {
    pub redirect_uris: Vec<String>,
    pub token_endpoint_auth_method: String,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub client_name: String,
    pub client_uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}
