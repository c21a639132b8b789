//! File-backed credential store.

use crate::entity::{ClientRegistration, EntityKind, Lockfile, TokenSet, Validate};
use crate::error::{StoreError, StoreResult};
use crate::identity::ServerIdentity;
use serde::{de::DeserializeOwned, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, error, warn};

/// Per-server credential storage in a single directory.
///
/// Every record lives in `{dir}/{identity}_{suffix}`. The store does no
/// locking: concurrent writers to the same record are last-write-wins.
#[derive(Clone)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    /// Create a store rooted at `dir`. The directory is created lazily.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Create a store in the platform data directory.
    pub fn open_default() -> StoreResult<Self> {
        crate::default_store_dir()
            .map(Self::new)
            .ok_or(StoreError::NoDataDir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record of `kind` for `id`.
    pub fn path_for(&self, id: &ServerIdentity, kind: EntityKind) -> PathBuf {
        self.dir
            .join(format!("{}_{}", id.as_str(), kind.file_suffix()))
    }

    /// Stored client registration, if any.
    pub async fn client_registration(&self, id: &ServerIdentity) -> Option<ClientRegistration> {
        self.read_json(id, EntityKind::ClientRegistration).await
    }

    pub async fn save_client_registration(
        &self,
        id: &ServerIdentity,
        registration: &ClientRegistration,
    ) -> StoreResult<()> {
        self.write_json(id, EntityKind::ClientRegistration, registration)
            .await
    }

    /// Stored tokens, if any.
    pub async fn tokens(&self, id: &ServerIdentity) -> Option<TokenSet> {
        self.read_json(id, EntityKind::Tokens).await
    }

    pub async fn save_tokens(&self, id: &ServerIdentity, tokens: &TokenSet) -> StoreResult<()> {
        self.write_json(id, EntityKind::Tokens, tokens).await
    }

    /// Stored callback-server lock, if any.
    pub async fn lockfile(&self, id: &ServerIdentity) -> Option<Lockfile> {
        self.read_json(id, EntityKind::Lockfile).await
    }

    pub async fn save_lockfile(&self, id: &ServerIdentity, lock: &Lockfile) -> StoreResult<()> {
        self.write_json(id, EntityKind::Lockfile, lock).await
    }

    /// Read the PKCE verifier.
    ///
    /// Unlike the JSON records, a missing verifier is an error: the code
    /// exchange cannot proceed without it.
    pub async fn code_verifier(&self, id: &ServerIdentity) -> StoreResult<String> {
        let path = self.path_for(id, EntityKind::CodeVerifier);
        match fs::read_to_string(&path).await {
            Ok(verifier) if !verifier.is_empty() => Ok(verifier),
            Ok(_) => Err(StoreError::VerifierNotFound(format!(
                "Code verifier for {id} is empty"
            ))),
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    error!(path = %path.display(), error = %e, "Error reading code verifier");
                }
                Err(StoreError::VerifierNotFound(format!(
                    "No code verifier saved for {id}"
                )))
            }
        }
    }

    /// Store the PKCE verifier as raw text, replacing any previous one.
    pub async fn save_code_verifier(&self, id: &ServerIdentity, verifier: &str) -> StoreResult<()> {
        self.write_file(id, EntityKind::CodeVerifier, verifier.as_bytes())
            .await
    }

    /// Delete a record. Missing records are fine; other failures are logged.
    pub async fn delete(&self, id: &ServerIdentity, kind: EntityKind) {
        let path = self.path_for(id, kind);
        match fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "Deleted credential record"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => error!(path = %path.display(), error = %e, "Error deleting credential record"),
        }
    }

    /// Delete every record kept for `id`.
    pub async fn clear(&self, id: &ServerIdentity) {
        for kind in EntityKind::ALL {
            self.delete(id, kind).await;
        }
    }

    async fn read_json<T>(&self, id: &ServerIdentity, kind: EntityKind) -> Option<T>
    where
        T: DeserializeOwned + Validate,
    {
        let path = self.path_for(id, kind);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Error reading credential record");
                return None;
            }
        };

        let value: T = match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring malformed credential record");
                return None;
            }
        };

        if let Err(reason) = value.validate() {
            warn!(path = %path.display(), reason = %reason, "Ignoring invalid credential record");
            return None;
        }

        Some(value)
    }

    async fn write_json<T: Serialize>(
        &self,
        id: &ServerIdentity,
        kind: EntityKind,
        value: &T,
    ) -> StoreResult<()> {
        let content = serde_json::to_string_pretty(value)?;
        self.write_file(id, kind, content.as_bytes()).await
    }

    /// Overwrite a record atomically: write a temp sibling, then rename it
    /// over the target.
    async fn write_file(&self, id: &ServerIdentity, kind: EntityKind, content: &[u8]) -> StoreResult<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::persistence(&self.dir, e))?;

        let path = self.path_for(id, kind);
        let temp_path = path.with_extension("tmp");

        if let Err(e) = fs::write(&temp_path, content).await {
            error!(path = %path.display(), error = %e, "Error writing credential record");
            return Err(StoreError::persistence(&path, e));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = fs::set_permissions(&temp_path, perms).await {
                let _ = fs::remove_file(&temp_path).await;
                return Err(StoreError::persistence(&path, e));
            }
        }

        if let Err(e) = fs::rename(&temp_path, &path).await {
            error!(path = %path.display(), error = %e, "Error replacing credential record");
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::persistence(&path, e));
        }

        debug!(path = %path.display(), "Wrote credential record");
        Ok(())
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("dir", &self.dir)
            .finish()
    }
}
