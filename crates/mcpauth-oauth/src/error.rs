//! OAuth flow error types.

use mcpauth_store::StoreError;
use std::time::Duration;
use thiserror::Error;

/// Result type for OAuth operations.
pub type OAuthResult<T> = Result<T, OAuthError>;

/// Errors that can end an authorization attempt.
///
/// Messages are meant to be shown to the user verbatim; upstream error
/// bodies are preserved.
#[derive(Debug, Error)]
pub enum OAuthError {
    /// Credential storage could not be written.
    #[error("Failed to persist credentials: {0}")]
    Persistence(String),

    /// The PKCE verifier was missing at code exchange time.
    #[error("{0}")]
    VerifierNotFound(String),

    /// The loopback callback port could not be bound.
    #[error("Failed to bind OAuth callback server on port {port}: {source}")]
    ServerBind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// No authorization code arrived in time.
    #[error(
        "No authorization received within {}s - did you complete sign-in in the browser?",
        .0.as_secs()
    )]
    AuthorizationTimeout(Duration),

    /// The authorization server answered with an error.
    #[error("{context} failed ({status}): {body}")]
    RemoteProtocol {
        context: &'static str,
        status: u16,
        body: String,
    },

    /// The authorization server does not support dynamic client registration.
    #[error("Authorization server does not support dynamic client registration: {0}")]
    RegistrationUnsupported(String),

    /// The authorization server could not be reached.
    #[error("Network error: {0}")]
    Network(String),

    /// The system browser could not be launched.
    #[error("Could not open browser: {0}")]
    BrowserLaunch(String),

    /// The attempt was cancelled by the caller.
    #[error("Authorization cancelled")]
    Cancelled,

    /// Another attempt for the same server holds the callback lock.
    #[error("Another authorization for this server is in progress (pid {pid}, port {port})")]
    Conflict { pid: u32, port: u16 },

    /// A server or endpoint URL could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// Distinguishable reason of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Persistence,
    VerifierNotFound,
    ServerBind,
    AuthorizationTimeout,
    RemoteProtocol,
    Network,
    BrowserLaunch,
    Cancelled,
    Conflict,
    InvalidUrl,
}

impl OAuthError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Persistence(_) => FailureKind::Persistence,
            Self::VerifierNotFound(_) => FailureKind::VerifierNotFound,
            Self::ServerBind { .. } => FailureKind::ServerBind,
            Self::AuthorizationTimeout(_) => FailureKind::AuthorizationTimeout,
            Self::RemoteProtocol { .. } | Self::RegistrationUnsupported(_) => {
                FailureKind::RemoteProtocol
            }
            Self::Network(_) => FailureKind::Network,
            Self::BrowserLaunch(_) => FailureKind::BrowserLaunch,
            Self::Cancelled => FailureKind::Cancelled,
            Self::Conflict { .. } => FailureKind::Conflict,
            Self::InvalidUrl(_) => FailureKind::InvalidUrl,
        }
    }

    pub(crate) fn network(context: &str, err: reqwest::Error) -> Self {
        Self::Network(format!("{context}: {err}"))
    }
}

impl From<StoreError> for OAuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VerifierNotFound(message) => Self::VerifierNotFound(message),
            other => Self::Persistence(other.to_string()),
        }
    }
}
