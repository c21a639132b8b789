//! Records persisted per server.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Seconds before the real expiry at which a token is already treated as
/// expired.
pub const EXPIRY_SKEW_SECS: u64 = 60;

/// The kinds of record kept for each server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    ClientRegistration,
    Tokens,
    CodeVerifier,
    Lockfile,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::ClientRegistration,
        EntityKind::Tokens,
        EntityKind::CodeVerifier,
        EntityKind::Lockfile,
    ];

    /// File name suffix appended to the server identity.
    pub fn file_suffix(&self) -> &'static str {
        match self {
            EntityKind::ClientRegistration => "client_info.json",
            EntityKind::Tokens => "tokens.json",
            EntityKind::CodeVerifier => "code_verifier.txt",
            EntityKind::Lockfile => "lock.json",
        }
    }
}

/// Structural checks applied to a record after deserialization.
///
/// A record that fails validation is treated as absent by the store.
pub trait Validate {
    fn validate(&self) -> Result<(), String>;
}

/// OAuth client identity granted by dynamic client registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRegistration {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub grant_types: Vec<String>,
    #[serde(default)]
    pub response_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_issued_at: Option<u64>,
    /// Unix seconds; `0` means the secret never expires (RFC 7591).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<u64>,
}

impl ClientRegistration {
    /// A registration carrying only a client id, e.g. from configuration.
    pub fn preregistered(client_id: impl Into<String>, client_secret: Option<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
            redirect_uris: Vec::new(),
            grant_types: Vec::new(),
            response_types: Vec::new(),
            client_name: None,
            client_uri: None,
            token_endpoint_auth_method: None,
            client_id_issued_at: None,
            client_secret_expires_at: None,
        }
    }

    /// Whether the client secret has passed its expiry.
    pub fn secret_expired(&self, now_secs: u64) -> bool {
        match self.client_secret_expires_at {
            Some(0) | None => false,
            Some(expires_at) => expires_at <= now_secs,
        }
    }
}

impl Validate for ClientRegistration {
    fn validate(&self) -> Result<(), String> {
        if self.client_id.trim().is_empty() {
            return Err("client_id is empty".to_string());
        }
        Ok(())
    }
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Tokens held for a server. Always replaced wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Unix seconds at which the access token expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl TokenSet {
    /// Whether the access token can still be used at `now_secs`.
    ///
    /// Tokens without an expiry never expire.
    pub fn is_usable(&self, now_secs: u64) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at > now_secs.saturating_add(EXPIRY_SKEW_SECS),
            None => true,
        }
    }

    /// Remaining lifetime at `now_secs`, if the token has an expiry.
    pub fn expires_in(&self, now_secs: u64) -> Option<Duration> {
        self.expires_at
            .map(|exp| Duration::from_secs(exp.saturating_sub(now_secs)))
    }
}

impl Validate for TokenSet {
    fn validate(&self) -> Result<(), String> {
        if self.access_token.is_empty() {
            return Err("access_token is empty".to_string());
        }
        if self.token_type.is_empty() {
            return Err("token_type is empty".to_string());
        }
        Ok(())
    }
}

/// Marks a callback server bound for a server identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lockfile {
    pub pid: u32,
    pub port: u16,
    /// Unix milliseconds at which the lock was taken.
    pub timestamp: u64,
}

impl Lockfile {
    /// A lock held by the current process.
    pub fn for_current_process(port: u16) -> Self {
        Self {
            pid: std::process::id(),
            port,
            timestamp: mcpauth_util::now_millis(),
        }
    }

    /// Whether the lock is older than `max_age` at `now_millis`.
    pub fn is_stale(&self, max_age: Duration, now_millis: u64) -> bool {
        now_millis.saturating_sub(self.timestamp) > max_age.as_millis() as u64
    }
}

impl Validate for Lockfile {
    fn validate(&self) -> Result<(), String> {
        if self.pid == 0 {
            return Err("pid is zero".to_string());
        }
        Ok(())
    }
}
