//! Configuration for the mcpauth CLI.
//!
//! Settings are merged from, in increasing precedence:
//! 1. Global config: `{config_dir}/mcpauth/config.json` (or `--config`)
//! 2. Environment overrides: `MCPAUTH_CALLBACK_PORT`, `MCPAUTH_DATA_DIR`
//! 3. Command-line flags
//!
//! Every field is optional; unset fields fall back to [`OAuthConfig`] defaults.

use anyhow::Context;
use mcpauth_oauth::OAuthConfig;
use mcpauth_store::CredentialStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides the loopback callback port.
pub const ENV_CALLBACK_PORT: &str = "MCPAUTH_CALLBACK_PORT";

/// Overrides the credential store directory.
pub const ENV_DATA_DIR: &str = "MCPAUTH_DATA_DIR";

/// CLI settings as read from `config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Loopback callback port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_port: Option<u16>,

    /// Loopback callback path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_path: Option<String>,

    /// Host used in the redirect URI.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_host: Option<String>,

    /// Client name sent during dynamic registration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,

    /// Client homepage sent during dynamic registration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_uri: Option<String>,

    /// Seconds to wait for the browser callback.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Credential store directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Per-server OAuth settings, keyed by server URL.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub servers: HashMap<String, ServerSettings>,
}

/// OAuth settings for one MCP server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Pre-registered client ID. Skips dynamic registration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl Settings {
    /// Load settings from `path`, or from the global config file if `path` is
    /// `None`, then apply environment overrides.
    ///
    /// An explicit path must exist; a missing global file is not an error.
    pub async fn load(path: Option<&Path>) -> anyhow::Result<(Self, Option<PathBuf>)> {
        let source = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::global_config_dir()
                .map(|dir| dir.join("config.json"))
                .filter(|path| path.exists()),
        };

        let mut settings = match &source {
            Some(path) => Self::load_file(path).await?,
            None => Settings::default(),
        };

        settings.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok((settings, source))
    }

    /// Load settings from a single JSON file.
    pub async fn load_file(path: &Path) -> anyhow::Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Apply `MCPAUTH_*` overrides read through `lookup`.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<()> {
        if let Some(port) = lookup(ENV_CALLBACK_PORT) {
            let port = port
                .trim()
                .parse::<u16>()
                .with_context(|| format!("{ENV_CALLBACK_PORT} must be a port number, got '{port}'"))?;
            self.callback_port = Some(port);
        }
        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|d| !d.is_empty()) {
            self.data_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    /// Get the global config directory.
    ///
    /// On Unix, prefers `~/.config/mcpauth` over the platform directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            if let Some(home) = dirs::home_dir() {
                let xdg_config = home.join(".config").join("mcpauth");
                if xdg_config.exists() {
                    return Some(xdg_config);
                }
            }
        }

        dirs::config_dir().map(|d| d.join("mcpauth"))
    }

    /// Build the flow configuration for `server_url`.
    pub fn oauth_config(&self, server_url: &str) -> OAuthConfig {
        let mut config = OAuthConfig::default();

        if let Some(port) = self.callback_port {
            config.callback_port = port;
        }
        if let Some(path) = &self.callback_path {
            config.callback_path = path.clone();
        }
        if let Some(host) = &self.redirect_host {
            config.redirect_host = host.clone();
        }
        if let Some(name) = &self.client_name {
            config.client_name = name.clone();
        }
        if let Some(uri) = &self.client_uri {
            config.client_uri = uri.clone();
        }
        if let Some(secs) = self.timeout {
            config.timeout = Duration::from_secs(secs);
        }

        if let Some(server) = self.servers.get(server_url) {
            config.client_id = server.client_id.clone();
            config.client_secret = server.client_secret.clone();
            config.scope = server.scope.clone();
        }

        config
    }

    /// Open the credential store.
    pub fn store(&self) -> anyhow::Result<CredentialStore> {
        match &self.data_dir {
            Some(dir) => Ok(CredentialStore::new(dir)),
            None => CredentialStore::open_default().context("Failed to locate credential store"),
        }
    }
}
