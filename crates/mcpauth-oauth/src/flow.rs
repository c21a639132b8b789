//! Authorization flow controller.
//!
//! Drives one authorization attempt for one MCP server:
//!
//! ```text
//! Idle → CheckingCache ─┬─────────────────────────────────────────────→ Persisted
//!                       ├→ Refreshing ────────────────────────────────→ Persisted
//!                       └→ [Registering] → AwaitingUserAction → ExchangingCode → Persisted
//!
//! any non-terminal state ──error──→ Failed
//! ```
//!
//! Steps run strictly in order. The loopback port is held from
//! `AwaitingUserAction` until the attempt ends and is released on every exit
//! path.

use crate::browser::{BrowserLauncher, SystemBrowser};
use crate::callback::{CallbackServer, CodeReceiver};
use crate::client::{build_authorization_url, AuthServerMetadata, OAuthClient};
use crate::config::OAuthConfig;
use crate::error::{FailureKind, OAuthError, OAuthResult};
use crate::pkce;
use mcpauth_store::{ClientRegistration, CredentialStore, EntityKind, Lockfile, ServerIdentity, TokenSet};
use mcpauth_util::{now_millis, now_secs};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Observable state of an authorization attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    CheckingCache,
    Refreshing,
    Registering,
    /// Waiting for the user to sign in. Carries the URL opened in the browser
    /// so a host can show it if the launch failed.
    AwaitingUserAction { authorization_url: String },
    ExchangingCode,
    Persisted,
    Failed { kind: FailureKind, message: String },
}

impl FlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowState::Persisted | FlowState::Failed { .. })
    }

    fn name(&self) -> &'static str {
        match self {
            FlowState::Idle => "idle",
            FlowState::CheckingCache => "checking_cache",
            FlowState::Refreshing => "refreshing",
            FlowState::Registering => "registering",
            FlowState::AwaitingUserAction { .. } => "awaiting_user_action",
            FlowState::ExchangingCode => "exchanging_code",
            FlowState::Persisted => "persisted",
            FlowState::Failed { .. } => "failed",
        }
    }
}

/// Authorization flow for one MCP server.
pub struct AuthorizationFlow {
    server_url: String,
    identity: ServerIdentity,
    config: OAuthConfig,
    store: CredentialStore,
    client: OAuthClient,
    browser: Arc<dyn BrowserLauncher>,
    state: watch::Sender<FlowState>,
}

impl AuthorizationFlow {
    /// Create a flow for the server at `server_url` using the system browser.
    pub fn new(server_url: impl Into<String>, config: OAuthConfig, store: CredentialStore) -> Self {
        let server_url = server_url.into();
        let identity = ServerIdentity::from_url(&server_url);
        let (state, _) = watch::channel(FlowState::Idle);
        Self {
            server_url,
            identity,
            config,
            store,
            client: OAuthClient::new(),
            browser: Arc::new(SystemBrowser),
            state,
        }
    }

    pub fn with_browser(mut self, browser: Arc<dyn BrowserLauncher>) -> Self {
        self.browser = browser;
        self
    }

    pub fn with_client(mut self, client: OAuthClient) -> Self {
        self.client = client;
        self
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Current state.
    pub fn state(&self) -> FlowState {
        self.state.borrow().clone()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<FlowState> {
        self.state.subscribe()
    }

    /// Run the flow to completion.
    ///
    /// Returns the usable token set, either from cache or freshly obtained.
    /// Cancelling `cancel` while waiting for the browser ends the attempt
    /// with [`OAuthError::Cancelled`].
    pub async fn authorize(&self, cancel: CancellationToken) -> OAuthResult<TokenSet> {
        match self.run(&cancel).await {
            Ok(tokens) => {
                self.transition(FlowState::Persisted);
                Ok(tokens)
            }
            Err(e) => {
                error!(server = %self.server_url, identity = %self.identity, error = %e, "Authorization failed");
                self.transition(FlowState::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run(&self, cancel: &CancellationToken) -> OAuthResult<TokenSet> {
        self.transition(FlowState::CheckingCache);

        let now = now_secs();
        let cached = self.store.tokens(&self.identity).await;
        if let Some(tokens) = &cached {
            if tokens.is_usable(now) {
                info!(identity = %self.identity, "Using cached OAuth tokens");
                return Ok(tokens.clone());
            }
            debug!(identity = %self.identity, "Cached OAuth tokens expired");
        }

        let registration = self.client_registration(now).await;
        let mut metadata = None;

        if let (Some(tokens), Some(registration)) = (&cached, &registration) {
            if let Some(refresh_token) = tokens.refresh_token.as_deref() {
                self.transition(FlowState::Refreshing);
                let md = self.metadata(&mut metadata).await?;
                match self
                    .client
                    .refresh(&md.token_endpoint, registration, refresh_token)
                    .await
                {
                    Ok(response) => {
                        let tokens = response.into_token_set(now_secs(), Some(refresh_token));
                        self.store.save_tokens(&self.identity, &tokens).await?;
                        info!(identity = %self.identity, "Refreshed OAuth tokens");
                        return Ok(tokens);
                    }
                    Err(e) => {
                        warn!(identity = %self.identity, error = %e, "Token refresh failed, starting a new authorization");
                    }
                }
            }
        }

        let registration = match registration {
            Some(registration) => registration,
            None => {
                self.transition(FlowState::Registering);
                let md = self.metadata(&mut metadata).await?;
                let endpoint = md
                    .registration_endpoint
                    .clone()
                    .ok_or_else(|| OAuthError::RegistrationUnsupported(self.server_url.clone()))?;
                let registration = self
                    .client
                    .register(&endpoint, &self.config.client_metadata())
                    .await?;
                self.store
                    .save_client_registration(&self.identity, &registration)
                    .await?;
                registration
            }
        };

        if cancel.is_cancelled() {
            return Err(OAuthError::Cancelled);
        }

        let md = self.metadata(&mut metadata).await?;
        if !md.supports_pkce() {
            warn!(identity = %self.identity, "Authorization server does not advertise S256 PKCE");
        }

        self.authorize_interactively(md, &registration, cancel).await
    }

    /// Configured client, or the stored registration if its secret is still
    /// valid.
    async fn client_registration(&self, now: u64) -> Option<ClientRegistration> {
        if let Some(client_id) = &self.config.client_id {
            return Some(ClientRegistration::preregistered(
                client_id.clone(),
                self.config.client_secret.clone(),
            ));
        }

        let registration = self.store.client_registration(&self.identity).await?;
        if registration.secret_expired(now) {
            info!(identity = %self.identity, "Client secret expired, registering again");
            return None;
        }
        Some(registration)
    }

    /// Discover metadata on first use.
    async fn metadata<'a>(
        &self,
        cached: &'a mut Option<AuthServerMetadata>,
    ) -> OAuthResult<&'a AuthServerMetadata> {
        let metadata = match cached.take() {
            Some(metadata) => metadata,
            None => self.client.discover(&self.server_url).await?,
        };
        Ok(cached.insert(metadata))
    }

    /// Hold the callback port for the interactive part of the flow and
    /// release it whatever the outcome.
    async fn authorize_interactively(
        &self,
        metadata: &AuthServerMetadata,
        registration: &ClientRegistration,
        cancel: &CancellationToken,
    ) -> OAuthResult<TokenSet> {
        self.check_lockfile().await?;

        let (server, receiver) =
            CallbackServer::start(self.config.callback_port, &self.config.callback_path).await?;

        let result = self
            .complete_with_server(&server, receiver, metadata, registration, cancel)
            .await;

        server.stop().await;
        self.store.delete(&self.identity, EntityKind::Lockfile).await;
        result
    }

    /// Refuse to start while another attempt holds a fresh lock.
    async fn check_lockfile(&self) -> OAuthResult<()> {
        let Some(lock) = self.store.lockfile(&self.identity).await else {
            return Ok(());
        };

        if lock.is_stale(self.config.lock_stale_after, now_millis()) {
            warn!(identity = %self.identity, pid = lock.pid, port = lock.port, "Replacing stale OAuth lockfile");
            return Ok(());
        }

        Err(OAuthError::Conflict {
            pid: lock.pid,
            port: lock.port,
        })
    }

    async fn complete_with_server(
        &self,
        server: &CallbackServer,
        receiver: CodeReceiver,
        metadata: &AuthServerMetadata,
        registration: &ClientRegistration,
        cancel: &CancellationToken,
    ) -> OAuthResult<TokenSet> {
        self.store
            .save_lockfile(&self.identity, &Lockfile::for_current_process(server.port()))
            .await?;

        let redirect_uri = self.config.redirect_url();
        let verifier = pkce::generate_code_verifier();
        self.store
            .save_code_verifier(&self.identity, &verifier)
            .await?;
        let challenge = pkce::code_challenge(&verifier);

        let authorization_url = build_authorization_url(
            &metadata.authorization_endpoint,
            &registration.client_id,
            &redirect_uri,
            self.config.scope.as_deref(),
            &challenge,
        )?;

        self.transition(FlowState::AwaitingUserAction {
            authorization_url: authorization_url.clone(),
        });

        if let Err(e) = self.browser.open(&authorization_url).await {
            warn!(error = %e, url = %authorization_url, "Could not open browser automatically, open the URL manually");
        }

        let timeout = self.config.timeout;
        let code = tokio::select! {
            code = receiver.recv() => code?,
            _ = tokio::time::sleep(timeout) => {
                return Err(OAuthError::AuthorizationTimeout(timeout));
            }
            _ = cancel.cancelled() => {
                info!(identity = %self.identity, "Authorization cancelled");
                return Err(OAuthError::Cancelled);
            }
        };

        self.transition(FlowState::ExchangingCode);

        let verifier = self.store.code_verifier(&self.identity).await?;
        let response = self
            .client
            .exchange_code(
                &metadata.token_endpoint,
                registration,
                &code,
                &redirect_uri,
                &verifier,
            )
            .await?;

        let tokens = response.into_token_set(now_secs(), None);
        self.store.save_tokens(&self.identity, &tokens).await?;
        self.store
            .delete(&self.identity, EntityKind::CodeVerifier)
            .await;

        info!(identity = %self.identity, "OAuth authorization complete");
        Ok(tokens)
    }

    fn transition(&self, next: FlowState) {
        debug!(identity = %self.identity, state = next.name(), "OAuth flow transition");
        self.state.send_replace(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;
    use url::Url;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Stands in for the user's browser: records every URL and, if given a
    /// code, follows the redirect the way the authorization server would.
    #[derive(Default)]
    struct FakeBrowser {
        code: Option<String>,
        opened: Mutex<Vec<String>>,
    }

    impl FakeBrowser {
        fn delivering(code: &str) -> Arc<Self> {
            Arc::new(Self {
                code: Some(code.to_string()),
                opened: Mutex::new(Vec::new()),
            })
        }

        fn idle() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn opened(&self) -> Vec<String> {
            self.opened.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BrowserLauncher for FakeBrowser {
        async fn open(&self, url: &str) -> OAuthResult<()> {
            self.opened.lock().unwrap().push(url.to_string());
            if let Some(code) = &self.code {
                let redirect_uri = query_param(url, "redirect_uri").unwrap();
                let response = reqwest::get(format!("{redirect_uri}?code={code}"))
                    .await
                    .unwrap();
                assert_eq!(response.status().as_u16(), 200);
            }
            Ok(())
        }
    }

    fn query_param(url: &str, name: &str) -> Option<String> {
        Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    fn form_param(body: &[u8], name: &str) -> Option<String> {
        url::form_urlencoded::parse(body)
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    async fn free_port() -> u16 {
        tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    async fn assert_port_free(port: u16) {
        tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("callback port should be released");
    }

    struct Harness {
        mock_server: MockServer,
        store: CredentialStore,
        config: OAuthConfig,
        _dir: TempDir,
    }

    impl Harness {
        async fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let config = OAuthConfig {
                callback_port: free_port().await,
                redirect_host: "127.0.0.1".to_string(),
                scope: Some("tools".to_string()),
                timeout: Duration::from_secs(10),
                ..Default::default()
            };
            Self {
                mock_server: MockServer::start().await,
                store: CredentialStore::new(dir.path().join("mcp-oauth")),
                config,
                _dir: dir,
            }
        }

        fn server_url(&self) -> String {
            format!("{}/mcp", self.mock_server.uri())
        }

        fn identity(&self) -> ServerIdentity {
            ServerIdentity::from_url(&self.server_url())
        }

        fn flow(&self, browser: Arc<dyn BrowserLauncher>) -> AuthorizationFlow {
            AuthorizationFlow::new(self.server_url(), self.config.clone(), self.store.clone())
                .with_browser(browser)
        }

        async fn mount_registration(&self, expected_calls: u64) {
            Mock::given(method("POST"))
                .and(path("/register"))
                .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                    "client_id": "client-abc",
                    "redirect_uris": [self.config.redirect_url()],
                    "grant_types": ["authorization_code", "refresh_token"],
                    "response_types": ["code"],
                    "token_endpoint_auth_method": "none"
                })))
                .expect(expected_calls)
                .mount(&self.mock_server)
                .await;
        }

        async fn mount_code_exchange(&self, code: &str) {
            Mock::given(method("POST"))
                .and(path("/token"))
                .and(body_string_contains("grant_type=authorization_code"))
                .and(body_string_contains(format!("code={code}").as_str()))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "access_token": "access-xyz",
                    "token_type": "Bearer",
                    "refresh_token": "refresh-xyz",
                    "expires_in": 3600
                })))
                .expect(1)
                .mount(&self.mock_server)
                .await;
        }

        async fn token_request_bodies(&self) -> Vec<Vec<u8>> {
            self.mock_server
                .received_requests()
                .await
                .unwrap_or_default()
                .into_iter()
                .filter(|r| r.url.path() == "/token")
                .map(|r| r.body)
                .collect()
        }
    }

    fn valid_tokens() -> TokenSet {
        TokenSet {
            access_token: "cached-access".to_string(),
            token_type: "Bearer".to_string(),
            refresh_token: Some("cached-refresh".to_string()),
            expires_at: Some(now_secs() + 3600),
            scope: None,
        }
    }

    fn expired_tokens() -> TokenSet {
        TokenSet {
            expires_at: Some(now_secs().saturating_sub(10)),
            ..valid_tokens()
        }
    }

    #[tokio::test]
    async fn test_cache_hit_makes_no_network_calls() {
        let h = Harness::new().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&h.mock_server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&h.mock_server)
            .await;

        let cached = valid_tokens();
        h.store.save_tokens(&h.identity(), &cached).await.unwrap();

        let browser = FakeBrowser::idle();
        let flow = h.flow(browser.clone());
        let tokens = flow.authorize(CancellationToken::new()).await.unwrap();

        assert_eq!(tokens, cached);
        assert!(browser.opened().is_empty());
        assert_eq!(flow.state(), FlowState::Persisted);
        assert!(h.store.lockfile(&h.identity()).await.is_none());
    }

    #[tokio::test]
    async fn test_cold_start_registers_and_exchanges_code() {
        let h = Harness::new().await;
        h.mount_registration(1).await;
        h.mount_code_exchange("xyz").await;

        let browser = FakeBrowser::delivering("xyz");
        let flow = h.flow(browser.clone());
        let tokens = flow.authorize(CancellationToken::new()).await.unwrap();

        assert_eq!(tokens.access_token, "access-xyz");
        assert_eq!(tokens.refresh_token.as_deref(), Some("refresh-xyz"));
        assert!(tokens.expires_at.is_some());
        assert_eq!(flow.state(), FlowState::Persisted);

        // Registration and tokens persisted.
        let registration = h.store.client_registration(&h.identity()).await.unwrap();
        assert_eq!(registration.client_id, "client-abc");
        assert_eq!(h.store.tokens(&h.identity()).await, Some(tokens));

        // The browser URL carried a challenge derived from the verifier that
        // was sent to the token endpoint.
        let opened = browser.opened();
        assert_eq!(opened.len(), 1);
        let url = &opened[0];
        assert!(url.starts_with(&format!("{}/authorize?", h.mock_server.uri())));
        assert_eq!(query_param(url, "client_id").as_deref(), Some("client-abc"));
        assert_eq!(query_param(url, "response_type").as_deref(), Some("code"));
        assert_eq!(query_param(url, "scope").as_deref(), Some("tools"));
        assert_eq!(
            query_param(url, "redirect_uri"),
            Some(h.config.redirect_url())
        );

        let bodies = h.token_request_bodies().await;
        assert_eq!(bodies.len(), 1);
        let verifier = form_param(&bodies[0], "code_verifier").unwrap();
        assert_eq!(form_param(&bodies[0], "code").as_deref(), Some("xyz"));
        assert_eq!(
            query_param(url, "code_challenge"),
            Some(pkce::code_challenge(&verifier))
        );

        // Verifier consumed, lock released, port free.
        assert!(h.store.code_verifier(&h.identity()).await.is_err());
        assert!(h.store.lockfile(&h.identity()).await.is_none());
        assert_port_free(h.config.callback_port).await;
    }

    #[tokio::test]
    async fn test_timeout_fails_and_releases_port() {
        let mut h = Harness::new().await;
        h.config.timeout = Duration::from_millis(200);
        h.mount_registration(1).await;

        let flow = h.flow(FakeBrowser::idle());
        let err = flow.authorize(CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, OAuthError::AuthorizationTimeout(_)));
        match flow.state() {
            FlowState::Failed { kind, .. } => assert_eq!(kind, FailureKind::AuthorizationTimeout),
            other => panic!("unexpected state: {other:?}"),
        }
        assert!(h.store.lockfile(&h.identity()).await.is_none());
        assert!(h.token_request_bodies().await.is_empty());
        assert_port_free(h.config.callback_port).await;
    }

    #[tokio::test]
    async fn test_cancellation_keeps_registration_and_releases_port() {
        let h = Harness::new().await;
        h.mount_registration(1).await;

        let flow = Arc::new(h.flow(FakeBrowser::idle()));
        let mut states = flow.subscribe();
        let cancel = CancellationToken::new();

        let task = {
            let flow = flow.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { flow.authorize(cancel).await })
        };

        states
            .wait_for(|s| matches!(s, FlowState::AwaitingUserAction { .. }))
            .await
            .unwrap();
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, OAuthError::Cancelled));
        assert!(matches!(
            flow.state(),
            FlowState::Failed {
                kind: FailureKind::Cancelled,
                ..
            }
        ));

        let registration = h.store.client_registration(&h.identity()).await;
        assert_eq!(registration.map(|r| r.client_id).as_deref(), Some("client-abc"));
        assert!(h.store.lockfile(&h.identity()).await.is_none());
        assert_port_free(h.config.callback_port).await;
    }

    #[tokio::test]
    async fn test_awaiting_state_exposes_authorization_url() {
        let h = Harness::new().await;
        h.mount_registration(1).await;

        let browser = FakeBrowser::idle();
        let flow = Arc::new(h.flow(browser.clone()));
        let mut states = flow.subscribe();
        let cancel = CancellationToken::new();
        let task = {
            let flow = flow.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { flow.authorize(cancel).await })
        };

        let shown = states
            .wait_for(|s| matches!(s, FlowState::AwaitingUserAction { .. }))
            .await
            .unwrap()
            .clone();
        cancel.cancel();
        let _ = task.await.unwrap();

        match shown {
            FlowState::AwaitingUserAction { authorization_url } => {
                assert_eq!(browser.opened(), vec![authorization_url]);
            }
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_existing_registration_is_reused() {
        let h = Harness::new().await;
        h.mount_registration(0).await;
        h.mount_code_exchange("code-1").await;

        let mut registration = ClientRegistration::preregistered("stored-client", None);
        registration.redirect_uris = vec![h.config.redirect_url()];
        h.store
            .save_client_registration(&h.identity(), &registration)
            .await
            .unwrap();

        let browser = FakeBrowser::delivering("code-1");
        let flow = h.flow(browser.clone());
        flow.authorize(CancellationToken::new()).await.unwrap();

        assert_eq!(
            query_param(&browser.opened()[0], "client_id").as_deref(),
            Some("stored-client")
        );
    }

    #[tokio::test]
    async fn test_configured_client_id_skips_registration() {
        let mut h = Harness::new().await;
        h.config.client_id = Some("configured".to_string());
        h.config.client_secret = Some("s3cret".to_string());
        h.mount_registration(0).await;
        h.mount_code_exchange("code-2").await;

        let flow = h.flow(FakeBrowser::delivering("code-2"));
        flow.authorize(CancellationToken::new()).await.unwrap();

        let bodies = h.token_request_bodies().await;
        assert_eq!(form_param(&bodies[0], "client_id").as_deref(), Some("configured"));
        assert_eq!(form_param(&bodies[0], "client_secret").as_deref(), Some("s3cret"));
        assert!(h.store.client_registration(&h.identity()).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_client_secret_registers_again() {
        let h = Harness::new().await;
        h.mount_registration(1).await;
        h.mount_code_exchange("code-3").await;

        let mut stale = ClientRegistration::preregistered("old-client", Some("old".to_string()));
        stale.client_secret_expires_at = Some(now_secs() - 100);
        h.store
            .save_client_registration(&h.identity(), &stale)
            .await
            .unwrap();

        let flow = h.flow(FakeBrowser::delivering("code-3"));
        flow.authorize(CancellationToken::new()).await.unwrap();

        let registration = h.store.client_registration(&h.identity()).await.unwrap();
        assert_eq!(registration.client_id, "client-abc");
    }

    #[tokio::test]
    async fn test_expired_tokens_are_refreshed() {
        let h = Harness::new().await;
        h.mount_registration(0).await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=cached-refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "refreshed-access",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&h.mock_server)
            .await;

        h.store
            .save_client_registration(&h.identity(), &ClientRegistration::preregistered("client-abc", None))
            .await
            .unwrap();
        h.store.save_tokens(&h.identity(), &expired_tokens()).await.unwrap();

        let browser = FakeBrowser::idle();
        let flow = h.flow(browser.clone());
        let tokens = flow.authorize(CancellationToken::new()).await.unwrap();

        assert_eq!(tokens.access_token, "refreshed-access");
        // The server did not rotate the refresh token.
        assert_eq!(tokens.refresh_token.as_deref(), Some("cached-refresh"));
        assert_eq!(h.store.tokens(&h.identity()).await, Some(tokens));
        assert!(browser.opened().is_empty());
    }

    #[tokio::test]
    async fn test_failed_refresh_falls_back_to_browser() {
        let h = Harness::new().await;
        h.mount_registration(0).await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant"
            })))
            .expect(1)
            .mount(&h.mock_server)
            .await;
        h.mount_code_exchange("code-4").await;

        h.store
            .save_client_registration(&h.identity(), &ClientRegistration::preregistered("client-abc", None))
            .await
            .unwrap();
        h.store.save_tokens(&h.identity(), &expired_tokens()).await.unwrap();

        let browser = FakeBrowser::delivering("code-4");
        let flow = h.flow(browser.clone());
        let tokens = flow.authorize(CancellationToken::new()).await.unwrap();

        assert_eq!(tokens.access_token, "access-xyz");
        assert_eq!(browser.opened().len(), 1);
    }

    #[tokio::test]
    async fn test_token_exchange_error_fails_with_upstream_message() {
        let h = Harness::new().await;
        h.mount_registration(1).await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Authorization code expired"
            })))
            .mount(&h.mock_server)
            .await;

        let flow = h.flow(FakeBrowser::delivering("stale-code"));
        let err = flow.authorize(CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.kind(), FailureKind::RemoteProtocol);
        match flow.state() {
            FlowState::Failed { kind, message } => {
                assert_eq!(kind, FailureKind::RemoteProtocol);
                assert!(message.contains("Authorization code expired"));
            }
            other => panic!("unexpected state: {other:?}"),
        }
        assert!(h.store.tokens(&h.identity()).await.is_none());
        assert!(h.store.lockfile(&h.identity()).await.is_none());
        assert_port_free(h.config.callback_port).await;
    }

    #[tokio::test]
    async fn test_registration_error_fails_before_binding() {
        let h = Harness::new().await;
        Mock::given(method("POST"))
            .and(path("/register"))
            .respond_with(ResponseTemplate::new(403).set_body_string("registration closed"))
            .mount(&h.mock_server)
            .await;

        let browser = FakeBrowser::idle();
        let flow = h.flow(browser.clone());
        let err = flow.authorize(CancellationToken::new()).await.unwrap_err();

        assert!(err.to_string().contains("registration closed"));
        assert!(browser.opened().is_empty());
        assert!(h.store.client_registration(&h.identity()).await.is_none());
    }

    #[tokio::test]
    async fn test_discovered_endpoints_are_used() {
        let h = Harness::new().await;
        let base = h.mock_server.uri();
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "issuer": base.as_str(),
                "authorization_endpoint": format!("{base}/as/authorize"),
                "token_endpoint": format!("{base}/as/token"),
                "registration_endpoint": format!("{base}/as/register"),
                "code_challenge_methods_supported": ["S256"]
            })))
            .mount(&h.mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/as/register"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "client_id": "discovered-client"
            })))
            .expect(1)
            .mount(&h.mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/as/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "discovered-access"
            })))
            .expect(1)
            .mount(&h.mock_server)
            .await;

        let browser = FakeBrowser::delivering("code-5");
        let flow = h.flow(browser.clone());
        let tokens = flow.authorize(CancellationToken::new()).await.unwrap();

        assert_eq!(tokens.access_token, "discovered-access");
        assert_eq!(tokens.expires_at, None);
        assert!(browser.opened()[0].starts_with(&format!("{base}/as/authorize?")));
    }

    #[tokio::test]
    async fn test_missing_verifier_fails_exchange() {
        /// Loses the stored verifier before following the redirect.
        struct VerifierLosingBrowser {
            store: CredentialStore,
            identity: ServerIdentity,
        }

        #[async_trait]
        impl BrowserLauncher for VerifierLosingBrowser {
            async fn open(&self, url: &str) -> OAuthResult<()> {
                self.store
                    .delete(&self.identity, EntityKind::CodeVerifier)
                    .await;
                let redirect_uri = query_param(url, "redirect_uri").unwrap();
                let response = reqwest::get(format!("{redirect_uri}?code=orphaned"))
                    .await
                    .unwrap();
                assert_eq!(response.status().as_u16(), 200);
                Ok(())
            }
        }

        let h = Harness::new().await;
        h.mount_registration(1).await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&h.mock_server)
            .await;

        let flow = h.flow(Arc::new(VerifierLosingBrowser {
            store: h.store.clone(),
            identity: h.identity(),
        }));
        let err = flow.authorize(CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.kind(), FailureKind::VerifierNotFound);
        assert!(matches!(
            flow.state(),
            FlowState::Failed {
                kind: FailureKind::VerifierNotFound,
                ..
            }
        ));
        assert!(h.store.tokens(&h.identity()).await.is_none());
        assert!(h.store.lockfile(&h.identity()).await.is_none());
        // Registration from earlier in the attempt is kept.
        assert!(h.store.client_registration(&h.identity()).await.is_some());
        assert_port_free(h.config.callback_port).await;
    }

    #[tokio::test]
    async fn test_fresh_lockfile_is_a_conflict() {
        let h = Harness::new().await;
        h.mount_registration(1).await;
        let lock = Lockfile {
            pid: 4242,
            port: 5555,
            timestamp: now_millis(),
        };
        h.store.save_lockfile(&h.identity(), &lock).await.unwrap();

        let browser = FakeBrowser::idle();
        let flow = h.flow(browser.clone());
        let err = flow.authorize(CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, OAuthError::Conflict { pid: 4242, port: 5555 }));
        assert!(browser.opened().is_empty());
        // The other attempt's lock is left alone.
        assert_eq!(h.store.lockfile(&h.identity()).await, Some(lock));
    }

    #[tokio::test]
    async fn test_stale_lockfile_is_replaced() {
        let h = Harness::new().await;
        h.mount_registration(1).await;
        h.mount_code_exchange("code-6").await;
        let lock = Lockfile {
            pid: 4242,
            port: 5555,
            timestamp: now_millis() - 60 * 60 * 1000,
        };
        h.store.save_lockfile(&h.identity(), &lock).await.unwrap();

        let flow = h.flow(FakeBrowser::delivering("code-6"));
        flow.authorize(CancellationToken::new()).await.unwrap();

        assert!(h.store.lockfile(&h.identity()).await.is_none());
    }

    #[tokio::test]
    async fn test_bind_failure_is_surfaced() {
        let h = Harness::new().await;
        h.mount_registration(1).await;
        let _blocker = tokio::net::TcpListener::bind(("127.0.0.1", h.config.callback_port))
            .await
            .unwrap();

        let browser = FakeBrowser::idle();
        let flow = h.flow(browser.clone());
        let err = flow.authorize(CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.kind(), FailureKind::ServerBind);
        assert!(browser.opened().is_empty());
        assert!(h.store.lockfile(&h.identity()).await.is_none());
    }

    #[tokio::test]
    async fn test_browser_failure_is_not_fatal() {
        struct BrokenBrowser;

        #[async_trait]
        impl BrowserLauncher for BrokenBrowser {
            async fn open(&self, url: &str) -> OAuthResult<()> {
                // The user opens the URL by hand.
                let redirect_uri = query_param(url, "redirect_uri").unwrap();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let _ = reqwest::get(format!("{redirect_uri}?code=manual")).await;
                });
                Err(OAuthError::BrowserLaunch("no display".to_string()))
            }
        }

        let h = Harness::new().await;
        h.mount_registration(1).await;
        h.mount_code_exchange("manual").await;

        let flow = h.flow(Arc::new(BrokenBrowser));
        let tokens = flow.authorize(CancellationToken::new()).await.unwrap();
        assert_eq!(tokens.access_token, "access-xyz");
    }

    #[test]
    fn test_terminal_states() {
        assert!(FlowState::Persisted.is_terminal());
        assert!(FlowState::Failed {
            kind: FailureKind::Cancelled,
            message: String::new()
        }
        .is_terminal());
        assert!(!FlowState::Idle.is_terminal());
        assert!(!FlowState::AwaitingUserAction {
            authorization_url: String::new()
        }
        .is_terminal());
    }

    #[test]
    fn test_new_flow_is_idle() {
        let dir = TempDir::new().unwrap();
        let flow = AuthorizationFlow::new(
            "https://mcp.example.com/sse",
            OAuthConfig::default(),
            CredentialStore::new(dir.path()),
        );
        assert_eq!(flow.state(), FlowState::Idle);
        assert_eq!(
            flow.identity(),
            &ServerIdentity::from_url("https://mcp.example.com/sse")
        );
    }
}
