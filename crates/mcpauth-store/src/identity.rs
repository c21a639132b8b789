//! Server identity derivation.

use md5::{Digest, Md5};
use std::fmt;

/// Filesystem-safe identifier for a remote MCP server.
///
/// The MD5 digest of the server URL, rendered as 32 lowercase hex
/// characters. The URL string is hashed exactly as given, so
/// `https://a.example` and `https://a.example/` are distinct servers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerIdentity(String);

impl ServerIdentity {
    /// Derive the identity of the server at `url`.
    pub fn from_url(url: &str) -> Self {
        let digest = Md5::digest(url.as_bytes());
        let hex = digest
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<String>();
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ServerIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
