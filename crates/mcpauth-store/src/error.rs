//! Error types for credential storage.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the credential store.
///
/// Reads of JSON entities never produce an error; a missing or malformed
/// record is reported as absent instead.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing file could not be written.
    #[error("Failed to persist {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A record could not be serialized.
    #[error("Failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No PKCE verifier is stored for the server.
    #[error("{0}")]
    VerifierNotFound(String),

    /// Could not determine the data directory.
    #[error("Could not determine data directory")]
    NoDataDir,
}

impl StoreError {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
