//! Inspecting and removing stored credentials.

use super::login::format_timestamp;
use crate::config::Settings;
use mcpauth_store::{CredentialStore, EntityKind, ServerIdentity, TokenSet};
use mcpauth_util::now_secs;

/// Print the stored credential state for `url`.
pub async fn status(settings: &Settings, url: &str, json: bool) -> anyhow::Result<()> {
    let store = settings.store()?;
    let id = ServerIdentity::from_url(url);
    let report = StatusReport::collect(&store, &id, settings, url).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report.to_json(url, &id, &store))?);
        return Ok(());
    }

    println!("Server:   {url}");
    println!("Identity: {id}");
    println!("Store:    {}", store.dir().display());
    println!();

    match (&report.configured_client, &report.registered_client) {
        (Some(client_id), _) => println!("Client:   {client_id} (configured)"),
        (None, Some(client_id)) => println!("Client:   {client_id} (registered)"),
        (None, None) => println!("Client:   not registered"),
    }

    match &report.tokens {
        None => println!("Tokens:   not signed in"),
        Some(tokens) => {
            let now = now_secs();
            let state = if tokens.is_usable(now) { "valid" } else { "expired" };
            match tokens.expires_at {
                Some(at) => println!("Tokens:   {state}, expires {}", format_timestamp(at)),
                None => println!("Tokens:   {state}, no expiry"),
            }
            if tokens.refresh_token.is_some() {
                println!("          refresh token available");
            }
        }
    }

    if let Some((pid, port)) = report.lock {
        println!("Login:    in progress (pid {pid}, port {port})");
    }

    Ok(())
}

/// Delete every stored credential for `url`.
pub async fn logout(settings: &Settings, url: &str) -> anyhow::Result<()> {
    let store = settings.store()?;
    let id = ServerIdentity::from_url(url);

    let had_tokens = store.tokens(&id).await.is_some();
    store.clear(&id).await;
    tracing::info!(server = %url, identity = %id, "Removed stored credentials");

    if had_tokens {
        println!("✓ Signed out of {url}");
    } else {
        println!("No stored tokens for {url}; cleared remaining credentials");
    }
    Ok(())
}

/// Print the storage identity of `url` and, with `paths`, its files.
pub fn identity(settings: &Settings, url: &str, paths: bool) -> anyhow::Result<()> {
    let id = ServerIdentity::from_url(url);
    println!("{id}");

    if paths {
        let store = settings.store()?;
        for kind in EntityKind::ALL {
            println!("{}", store.path_for(&id, kind).display());
        }
    }
    Ok(())
}

struct StatusReport {
    configured_client: Option<String>,
    registered_client: Option<String>,
    tokens: Option<TokenSet>,
    lock: Option<(u32, u16)>,
}

impl StatusReport {
    async fn collect(
        store: &CredentialStore,
        id: &ServerIdentity,
        settings: &Settings,
        url: &str,
    ) -> Self {
        Self {
            configured_client: settings.oauth_config(url).client_id,
            registered_client: store.client_registration(id).await.map(|r| r.client_id),
            tokens: store.tokens(id).await,
            lock: store.lockfile(id).await.map(|l| (l.pid, l.port)),
        }
    }

    /// Secrets are never included.
    fn to_json(&self, url: &str, id: &ServerIdentity, store: &CredentialStore) -> serde_json::Value {
        let now = now_secs();
        serde_json::json!({
            "server": url,
            "identity": id.as_str(),
            "store": store.dir(),
            "client_id": self.configured_client.as_ref().or(self.registered_client.as_ref()),
            "signed_in": self.tokens.is_some(),
            "token_valid": self.tokens.as_ref().is_some_and(|t| t.is_usable(now)),
            "expires_at": self.tokens.as_ref().and_then(|t| t.expires_at),
            "has_refresh_token": self.tokens.as_ref().is_some_and(|t| t.refresh_token.is_some()),
            "login_in_progress": self.lock.is_some(),
        })
    }
}
