//! Per-server OAuth2 credentials.
//!
//! The [`CredentialManager`] owns one small state machine per server that
//! requires authorization:
//!
//! ```text
//! AuthRequired -> AuthorizationPending -> Authorized <-> Refreshing
//!      ^                                                    |
//!      +----------------------- refresh failed -------------+
//! ```
//!
//! Servers that need no authorization stay in `NoAuth`.

pub mod flows;
pub mod pkce;
pub mod token;

use parking_lot::{Mutex, RwLock};
use reqwest::Url;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::{AuthSettings, GrantType, OAuthConfig, ServerConfig};
use crate::error::{MCPError, Result};

pub use flows::{DeviceAuthorization, FlowError};
pub use pkce::Pkce;
pub use token::{CredentialStore, MemoryCredentialStore, OAuthToken, TokenResponse};

/// Authorization state of one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    NoAuth,
    AuthRequired,
    AuthorizationPending,
    Authorized,
    Refreshing,
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthState::NoAuth => "no_auth",
            AuthState::AuthRequired => "auth_required",
            AuthState::AuthorizationPending => "authorization_pending",
            AuthState::Authorized => "authorized",
            AuthState::Refreshing => "refreshing",
        };
        f.write_str(name)
    }
}

/// Host-provided user interaction for interactive grants.
#[cfg_attr(test, mockall::automock)]
pub trait AuthorizationUi: Send + Sync {
    /// Shows the user the authorization URL, typically by opening a browser.
    fn open_authorization_url(&self, server_id: &str, url: &Url) -> Result<()>;

    /// Shows the user the code to enter at `verification_uri`.
    fn present_device_code(&self, server_id: &str, verification_uri: &str, user_code: &str) -> Result<()>;
}

/// Headless UI: logs what the user should do.
#[derive(Debug, Default, Clone)]
pub struct LoggingAuthorizationUi;

impl AuthorizationUi for LoggingAuthorizationUi {
    fn open_authorization_url(&self, server_id: &str, url: &Url) -> Result<()> {
        info!(server = %server_id, url = %url, "Open this URL to authorize");
        Ok(())
    }

    fn present_device_code(&self, server_id: &str, verification_uri: &str, user_code: &str) -> Result<()> {
        info!(server = %server_id, verification_uri, user_code, "Enter the code to authorize");
        Ok(())
    }
}

struct ServerAuth {
    oauth: OAuthConfig,
    state: RwLock<AuthState>,
    /// Serializes freshness checks, refreshes and authorizations.
    gate: tokio::sync::Mutex<()>,
}

struct PendingCallback {
    server_id: String,
    tx: oneshot::Sender<String>,
}

/// Obtains, stores and refreshes OAuth tokens for every server.
pub struct CredentialManager {
    http: reqwest::Client,
    store: Arc<dyn CredentialStore>,
    ui: Arc<dyn AuthorizationUi>,
    settings: AuthSettings,
    servers: RwLock<HashMap<String, Arc<ServerAuth>>>,
    callbacks: Mutex<HashMap<String, PendingCallback>>,
}

impl CredentialManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        ui: Arc<dyn AuthorizationUi>,
        settings: AuthSettings,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            store,
            ui,
            settings,
            servers: RwLock::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
        }
    }

    /// Uses a caller-provided HTTP client for token endpoint calls.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Tracks `config` if it requires authorization.
    pub fn register(&self, config: &ServerConfig) {
        let Some(oauth) = config.oauth.clone().filter(|_| config.auth_required) else {
            self.servers.write().remove(&config.id);
            return;
        };
        self.servers.write().insert(
            config.id.clone(),
            Arc::new(ServerAuth {
                oauth,
                state: RwLock::new(AuthState::AuthRequired),
                gate: tokio::sync::Mutex::new(()),
            }),
        );
    }

    /// Current state for `server_id`.
    pub fn state(&self, server_id: &str) -> AuthState {
        match self.servers.read().get(server_id) {
            Some(entry) => *entry.state.read(),
            None => AuthState::NoAuth,
        }
    }

    fn entry(&self, server_id: &str) -> Option<Arc<ServerAuth>> {
        self.servers.read().get(server_id).cloned()
    }

    fn set_state(&self, server_id: &str, entry: &ServerAuth, state: AuthState) {
        let mut current = entry.state.write();
        if *current != state {
            debug!(server = %server_id, from = %*current, to = %state, "Auth state changed");
            *current = state;
        }
    }

    /// Returns a usable access token, refreshing it first when it expires
    /// within the safety margin. `None` for servers without authorization.
    ///
    /// Fails with `AuthRequired` when no token is stored and with
    /// `AuthExpired` when the refresh did not work.
    pub async fn ensure_fresh(&self, server_id: &str) -> Result<Option<String>> {
        let Some(entry) = self.entry(server_id) else {
            return Ok(None);
        };
        let _gate = entry.gate.lock().await;

        let Some(token) = self.store.get_token(server_id).await? else {
            self.set_state(server_id, &entry, AuthState::AuthRequired);
            return Err(MCPError::AuthRequired {
                server: server_id.to_string(),
            });
        };

        if !token.expires_within(self.settings.refresh_margin) {
            self.set_state(server_id, &entry, AuthState::Authorized);
            return Ok(Some(token.access_token));
        }

        let Some(refresh_token) = token.refresh_token.clone() else {
            self.set_state(server_id, &entry, AuthState::AuthRequired);
            return Err(MCPError::AuthExpired {
                server: server_id.to_string(),
                reason: "token expired and no refresh token is available".to_string(),
            });
        };

        self.set_state(server_id, &entry, AuthState::Refreshing);
        debug!(server = %server_id, "Refreshing access token");

        match flows::refresh(&self.http, &entry.oauth, &refresh_token).await {
            Ok(response) => {
                let fresh = response.into_token(Some(refresh_token));
                let access = fresh.access_token.clone();
                self.store.set_token(server_id, fresh).await?;
                self.set_state(server_id, &entry, AuthState::Authorized);
                info!(server = %server_id, "Access token refreshed");
                Ok(Some(access))
            }
            Err(e) => {
                warn!(server = %server_id, error = %e, "Token refresh failed");
                self.set_state(server_id, &entry, AuthState::AuthRequired);
                Err(MCPError::AuthExpired {
                    server: server_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Runs the configured grant and stores the resulting token.
    pub async fn authorize(&self, server_id: &str) -> Result<String> {
        let entry = self.entry(server_id).ok_or_else(|| {
            MCPError::config(format!("server '{server_id}' has no oauth settings"))
        })?;
        let _gate = entry.gate.lock().await;

        self.set_state(server_id, &entry, AuthState::AuthorizationPending);
        info!(server = %server_id, grant = ?entry.oauth.grant, "Starting authorization");

        let obtained = match entry.oauth.grant {
            GrantType::AuthorizationCode => self.authorization_code(server_id, &entry.oauth).await,
            GrantType::ClientCredentials => flows::client_credentials(&self.http, &entry.oauth)
                .await
                .map_err(|e| oauth_error(server_id, e)),
            GrantType::DeviceCode => self.device_code(server_id, &entry.oauth).await,
        };

        let response = match obtained {
            Ok(response) => response,
            Err(e) => {
                warn!(server = %server_id, error = %e, "Authorization failed");
                self.set_state(server_id, &entry, AuthState::AuthRequired);
                return Err(e);
            }
        };

        let token = response.into_token(None);
        let access = token.access_token.clone();
        self.store.set_token(server_id, token).await?;
        self.set_state(server_id, &entry, AuthState::Authorized);
        info!(server = %server_id, "Authorized");
        Ok(access)
    }

    async fn authorization_code(&self, server_id: &str, oauth: &OAuthConfig) -> Result<TokenResponse> {
        let pkce = Pkce::generate();
        let state = pkce::random_token();
        let url = flows::authorization_url(oauth, &pkce.challenge, &state)
            .map_err(|e| oauth_error(server_id, e))?;

        let (tx, rx) = oneshot::channel();
        self.callbacks.lock().insert(
            state.clone(),
            PendingCallback {
                server_id: server_id.to_string(),
                tx,
            },
        );

        if let Err(e) = self.ui.open_authorization_url(server_id, &url) {
            self.callbacks.lock().remove(&state);
            return Err(e);
        }

        let code = match tokio::time::timeout(self.settings.callback_timeout, rx).await {
            Ok(Ok(code)) => code,
            Ok(Err(_)) => {
                return Err(MCPError::OAuth {
                    server: server_id.to_string(),
                    reason: "authorization was abandoned".to_string(),
                });
            }
            Err(_) => {
                self.callbacks.lock().remove(&state);
                return Err(MCPError::OAuth {
                    server: server_id.to_string(),
                    reason: "timed out waiting for the authorization callback".to_string(),
                });
            }
        };

        flows::exchange_code(&self.http, oauth, &code, &pkce.verifier)
            .await
            .map_err(|e| oauth_error(server_id, e))
    }

    async fn device_code(&self, server_id: &str, oauth: &OAuthConfig) -> Result<TokenResponse> {
        let device = flows::request_device_code(&self.http, oauth)
            .await
            .map_err(|e| oauth_error(server_id, e))?;

        let verification_uri = device
            .verification_uri_complete
            .as_deref()
            .unwrap_or(&device.verification_uri);
        self.ui
            .present_device_code(server_id, verification_uri, &device.user_code)?;

        let expires_in = Duration::from_secs(device.expires_in).min(self.settings.callback_timeout);
        let deadline = tokio::time::Instant::now() + expires_in;
        let mut interval = Duration::from_secs(device.interval);

        loop {
            tokio::time::sleep(interval).await;
            if tokio::time::Instant::now() >= deadline {
                return Err(MCPError::OAuth {
                    server: server_id.to_string(),
                    reason: "device code expired before it was approved".to_string(),
                });
            }

            match flows::poll_device_token(&self.http, oauth, &device.device_code).await {
                Ok(response) => return Ok(response),
                Err(e) if e.code() == Some("authorization_pending") => {
                    debug!(server = %server_id, "Device authorization pending");
                }
                Err(e) if e.code() == Some("slow_down") => {
                    interval += Duration::from_secs(5);
                    debug!(server = %server_id, interval_secs = interval.as_secs(), "Slowing down device polling");
                }
                Err(e) => return Err(oauth_error(server_id, e)),
            }
        }
    }

    /// Completes a pending authorization code flow.
    ///
    /// `state` must match the one sent in the authorization URL.
    pub fn deliver_callback(&self, code: &str, state: &str) -> Result<()> {
        let pending = self.callbacks.lock().remove(state);
        match pending {
            Some(pending) => {
                debug!(server = %pending.server_id, "Received authorization callback");
                pending.tx.send(code.to_string()).map_err(|_| MCPError::OAuth {
                    server: pending.server_id,
                    reason: "authorization is no longer pending".to_string(),
                })
            }
            None => Err(MCPError::CallbackRejected {
                reason: "unknown or expired state".to_string(),
            }),
        }
    }

    /// Drops the stored token after the server rejected it.
    pub async fn invalidate(&self, server_id: &str) -> Result<()> {
        let Some(entry) = self.entry(server_id) else {
            return Ok(());
        };
        warn!(server = %server_id, "Server rejected credentials");
        self.store.delete_token(server_id).await?;
        self.set_state(server_id, &entry, AuthState::AuthRequired);
        Ok(())
    }
}

impl fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialManager")
            .field("servers", &self.servers.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

fn oauth_error(server_id: &str, error: FlowError) -> MCPError {
    MCPError::OAuth {
        server: server_id.to_string(),
        reason: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn oauth(grant: GrantType, server: &MockServer) -> OAuthConfig {
        OAuthConfig {
            grant,
            client_id: "cli".into(),
            client_secret: Some("s3cret".into()),
            authorization_endpoint: Some(format!("{}/authorize", server.uri())),
            token_endpoint: format!("{}/token", server.uri()),
            device_authorization_endpoint: Some(format!("{}/device", server.uri())),
            redirect_uri: Some("http://localhost:7777/callback".into()),
            scopes: vec!["tools".into()],
        }
    }

    fn manager(
        store: Arc<MemoryCredentialStore>,
        ui: impl AuthorizationUi + 'static,
        grant: GrantType,
        server: &MockServer,
    ) -> CredentialManager {
        let manager = CredentialManager::new(store, Arc::new(ui), AuthSettings::default());
        let config = ServerConfig::http("remote", format!("{}/mcp", server.uri()))
            .with_oauth(oauth(grant, server));
        manager.register(&config);
        manager
    }

    fn token(expires_in: i64, refresh: Option<&str>) -> OAuthToken {
        OAuthToken {
            access_token: "old".into(),
            refresh_token: refresh.map(str::to_string),
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in),
            scope: None,
        }
    }

    #[tokio::test]
    async fn test_servers_without_auth_need_no_token() {
        let manager = CredentialManager::new(
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(LoggingAuthorizationUi),
            AuthSettings::default(),
        );
        manager.register(&ServerConfig::stdio("local", "server", vec![]));
        assert_eq!(manager.state("local"), AuthState::NoAuth);
        assert_eq!(manager.ensure_fresh("local").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_token_requires_auth() {
        let server = MockServer::start().await;
        let store = Arc::new(MemoryCredentialStore::new());
        let manager = manager(store, LoggingAuthorizationUi, GrantType::ClientCredentials, &server);

        let err = manager.ensure_fresh("remote").await.unwrap_err();
        assert!(matches!(err, MCPError::AuthRequired { .. }));
        assert_eq!(manager.state("remote"), AuthState::AuthRequired);
    }

    #[tokio::test]
    async fn test_fresh_token_is_used_as_is() {
        let server = MockServer::start().await;
        let store = Arc::new(MemoryCredentialStore::new());
        store.set_token("remote", token(3600, None)).await.unwrap();
        let manager = manager(store, LoggingAuthorizationUi, GrantType::ClientCredentials, &server);

        assert_eq!(manager.ensure_fresh("remote").await.unwrap().as_deref(), Some("old"));
        assert_eq!(manager.state("remote"), AuthState::Authorized);
    }

    #[tokio::test]
    async fn test_token_near_expiry_is_refreshed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=r1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryCredentialStore::new());
        store.set_token("remote", token(30, Some("r1"))).await.unwrap();
        let manager = manager(store.clone(), LoggingAuthorizationUi, GrantType::ClientCredentials, &server);

        assert_eq!(manager.ensure_fresh("remote").await.unwrap().as_deref(), Some("new"));
        assert_eq!(manager.state("remote"), AuthState::Authorized);
        let stored = store.get_token("remote").await.unwrap().unwrap();
        assert_eq!(stored.access_token, "new");
        assert_eq!(stored.refresh_token.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_failed_refresh_expires_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant"
            })))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryCredentialStore::new());
        store.set_token("remote", token(30, Some("r1"))).await.unwrap();
        let manager = manager(store, LoggingAuthorizationUi, GrantType::ClientCredentials, &server);

        let err = manager.ensure_fresh("remote").await.unwrap_err();
        assert!(matches!(err, MCPError::AuthExpired { ref reason, .. } if reason.contains("invalid_grant")));
        assert_eq!(manager.state("remote"), AuthState::AuthRequired);
    }

    #[tokio::test]
    async fn test_concurrent_checks_refresh_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new",
                "refresh_token": "r2",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryCredentialStore::new());
        store.set_token("remote", token(10, Some("r1"))).await.unwrap();
        let manager = Arc::new(manager(store, LoggingAuthorizationUi, GrantType::ClientCredentials, &server));

        let checks = (0..4).map(|_| {
            let manager = manager.clone();
            async move { manager.ensure_fresh("remote").await }
        });
        for result in futures::future::join_all(checks).await {
            assert_eq!(result.unwrap().as_deref(), Some("new"));
        }
    }

    #[tokio::test]
    async fn test_client_credentials_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(body_string_contains("client_secret=s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "machine",
                "expires_in": 600
            })))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryCredentialStore::new());
        let manager = manager(store.clone(), LoggingAuthorizationUi, GrantType::ClientCredentials, &server);

        assert_eq!(manager.authorize("remote").await.unwrap(), "machine");
        assert_eq!(manager.state("remote"), AuthState::Authorized);
        assert!(store.get_token("remote").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_authorization_code_with_pkce() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=the-code"))
            .and(body_string_contains("code_verifier="))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "user-token",
                "refresh_token": "user-refresh",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (url_tx, mut url_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut ui = MockAuthorizationUi::new();
        ui.expect_open_authorization_url()
            .times(1)
            .returning(move |_, url| {
                let _ = url_tx.send(url.clone());
                Ok(())
            });

        let store = Arc::new(MemoryCredentialStore::new());
        let manager = Arc::new(manager(store, ui, GrantType::AuthorizationCode, &server));

        let flow = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.authorize("remote").await })
        };

        let url = url_rx.recv().await.unwrap();
        assert_eq!(manager.state("remote"), AuthState::AuthorizationPending);
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["code_challenge_method"], "S256");

        assert!(matches!(
            manager.deliver_callback("the-code", "forged-state"),
            Err(MCPError::CallbackRejected { .. })
        ));
        manager.deliver_callback("the-code", &params["state"]).unwrap();

        assert_eq!(flow.await.unwrap().unwrap(), "user-token");
        assert_eq!(manager.state("remote"), AuthState::Authorized);
    }

    #[tokio::test]
    async fn test_device_code_grant_polls_until_approved() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/device"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "device_code": "dev",
                "user_code": "ABCD-EFGH",
                "verification_uri": "https://auth.example/device",
                "expires_in": 60,
                "interval": 0
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "authorization_pending"
            })))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("device_code=dev"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "device-token",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let mut ui = MockAuthorizationUi::new();
        ui.expect_present_device_code()
            .withf(|server, _, code| server == "remote" && code == "ABCD-EFGH")
            .times(1)
            .returning(|_, _, _| Ok(()));

        let store = Arc::new(MemoryCredentialStore::new());
        let manager = manager(store, ui, GrantType::DeviceCode, &server);

        assert_eq!(manager.authorize("remote").await.unwrap(), "device-token");
        assert_eq!(manager.state("remote"), AuthState::Authorized);
    }

    #[tokio::test]
    async fn test_invalidate_drops_token() {
        let server = MockServer::start().await;
        let store = Arc::new(MemoryCredentialStore::new());
        store.set_token("remote", token(3600, None)).await.unwrap();
        let manager = manager(store.clone(), LoggingAuthorizationUi, GrantType::ClientCredentials, &server);

        manager.ensure_fresh("remote").await.unwrap();
        manager.invalidate("remote").await.unwrap();
        assert_eq!(manager.state("remote"), AuthState::AuthRequired);
        assert!(store.get_token("remote").await.unwrap().is_none());
    }
}
