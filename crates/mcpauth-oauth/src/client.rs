//! Authorization server client: metadata discovery, dynamic client
//! registration, code exchange and refresh.

use crate::config::ClientMetadata;
use crate::error::{OAuthError, OAuthResult};
use crate::pkce::CODE_CHALLENGE_METHOD;
use mcpauth_store::{ClientRegistration, TokenSet, Validate};
use mcpauth_util::TimingGuard;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

/// MCP protocol revision announced during discovery.
const MCP_PROTOCOL_VERSION: &str = "2025-03-26";

/// Authorization server metadata (RFC 8414).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthServerMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

impl AuthServerMetadata {
    /// Default endpoints relative to the server origin, used when the server
    /// publishes no metadata document.
    pub fn fallback(origin: &str) -> Self {
        let origin = origin.trim_end_matches('/');
        Self {
            issuer: None,
            authorization_endpoint: format!("{origin}/authorize"),
            token_endpoint: format!("{origin}/token"),
            registration_endpoint: Some(format!("{origin}/register")),
            scopes_supported: Vec::new(),
            code_challenge_methods_supported: Vec::new(),
        }
    }

    /// Whether the server advertises S256. Servers that list nothing are
    /// assumed to support it.
    pub fn supports_pkce(&self) -> bool {
        self.code_challenge_methods_supported.is_empty()
            || self
                .code_challenge_methods_supported
                .iter()
                .any(|m| m == CODE_CHALLENGE_METHOD)
    }
}

/// Token endpoint response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds, relative to receipt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenResponse {
    /// Convert into a stored token set with an absolute expiry.
    ///
    /// `previous_refresh` is kept when the server did not rotate the refresh
    /// token.
    pub fn into_token_set(self, now_secs: u64, previous_refresh: Option<&str>) -> TokenSet {
        TokenSet {
            access_token: self.access_token,
            token_type: self.token_type,
            refresh_token: self
                .refresh_token
                .or_else(|| previous_refresh.map(str::to_string)),
            expires_at: self.expires_in.map(|secs| now_secs.saturating_add(secs)),
            scope: self.scope,
        }
    }
}

/// HTTP client for the authorization server endpoints.
#[derive(Debug, Clone, Default)]
pub struct OAuthClient {
    http: reqwest::Client,
}

impl OAuthClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_http_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Discover the authorization server of the MCP server at `server_url`.
    ///
    /// A `404` from the well-known endpoint falls back to default endpoints
    /// on the server origin.
    pub async fn discover(&self, server_url: &str) -> OAuthResult<AuthServerMetadata> {
        let origin = server_origin(server_url)?;
        let url = format!("{origin}/.well-known/oauth-authorization-server");
        debug!(url = %url, "Fetching authorization server metadata");

        let _timing = TimingGuard::new("metadata_discovery");
        let response = self
            .http
            .get(&url)
            .header("MCP-Protocol-Version", MCP_PROTOCOL_VERSION)
            .send()
            .await
            .map_err(|e| OAuthError::network("Metadata discovery", e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            info!(origin = %origin, "No authorization server metadata, using default endpoints");
            return Ok(AuthServerMetadata::fallback(&origin));
        }

        read_json(response, "Metadata discovery").await
    }

    /// Register a new client (RFC 7591).
    pub async fn register(
        &self,
        registration_endpoint: &str,
        metadata: &ClientMetadata,
    ) -> OAuthResult<ClientRegistration> {
        debug!(endpoint = %registration_endpoint, "Registering OAuth client");

        let _timing = TimingGuard::new("client_registration");
        let response = self
            .http
            .post(registration_endpoint)
            .json(metadata)
            .send()
            .await
            .map_err(|e| OAuthError::network("Client registration", e))?;

        let registration: ClientRegistration = read_json(response, "Client registration").await?;
        if let Err(reason) = registration.validate() {
            return Err(OAuthError::RemoteProtocol {
                context: "Client registration",
                status: 200,
                body: reason,
            });
        }

        info!(client_id = %registration.client_id, "Registered OAuth client");
        Ok(registration)
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        token_endpoint: &str,
        client: &ClientRegistration,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> OAuthResult<TokenResponse> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", client.client_id.as_str()),
            ("code_verifier", code_verifier),
        ];
        if let Some(secret) = client.client_secret.as_deref() {
            params.push(("client_secret", secret));
        }

        self.token_request(token_endpoint, &params, "Token exchange")
            .await
    }

    /// Obtain fresh tokens with a refresh token.
    pub async fn refresh(
        &self,
        token_endpoint: &str,
        client: &ClientRegistration,
        refresh_token: &str,
    ) -> OAuthResult<TokenResponse> {
        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client.client_id.as_str()),
        ];
        if let Some(secret) = client.client_secret.as_deref() {
            params.push(("client_secret", secret));
        }

        self.token_request(token_endpoint, &params, "Token refresh")
            .await
    }

    async fn token_request(
        &self,
        token_endpoint: &str,
        params: &[(&str, &str)],
        context: &'static str,
    ) -> OAuthResult<TokenResponse> {
        let _timing = TimingGuard::new(context);
        let response = self
            .http
            .post(token_endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(params)
            .send()
            .await
            .map_err(|e| OAuthError::network(context, e))?;

        let tokens: TokenResponse = read_json(response, context).await?;
        if tokens.access_token.is_empty() {
            return Err(OAuthError::RemoteProtocol {
                context,
                status: 200,
                body: "response contains an empty access_token".to_string(),
            });
        }
        Ok(tokens)
    }
}

/// Build the URL the user is sent to in the browser.
pub fn build_authorization_url(
    authorization_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    scope: Option<&str>,
    code_challenge: &str,
) -> OAuthResult<String> {
    let mut url = Url::parse(authorization_endpoint)
        .map_err(|e| OAuthError::InvalidUrl(format!("{authorization_endpoint}: {e}")))?;

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", CODE_CHALLENGE_METHOD);
        if let Some(scope) = scope {
            query.append_pair("scope", scope);
        }
    }

    Ok(url.into())
}

/// Scheme, host and port of `server_url`.
pub fn server_origin(server_url: &str) -> OAuthResult<String> {
    let url = Url::parse(server_url)
        .map_err(|e| OAuthError::InvalidUrl(format!("{server_url}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(OAuthError::InvalidUrl(format!(
            "{server_url}: unsupported scheme '{}'",
            url.scheme()
        )));
    }
    Ok(url.origin().ascii_serialization())
}

/// Read a JSON body, turning non-success statuses into protocol errors that
/// keep the upstream body.
async fn read_json<T: DeserializeOwned>(
    response: reqwest::Response,
    context: &'static str,
) -> OAuthResult<T> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| OAuthError::network(context, e))?;

    if !status.is_success() {
        return Err(OAuthError::RemoteProtocol {
            context,
            status: status.as_u16(),
            body,
        });
    }

    serde_json::from_str(&body).map_err(|e| OAuthError::RemoteProtocol {
        context,
        status: status.as_u16(),
        body: format!("invalid response ({e}): {body}"),
    })
}
