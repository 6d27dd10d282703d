//! The multi-server client facade.

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{AuthorizationUi, CredentialManager, CredentialStore, LoggingAuthorizationUi, MemoryCredentialStore};
use crate::bridge::RegistryBridge;
use crate::config::{ClientConfig, ServerConfig};
use crate::error::{MCPError, Result};
use crate::events::ClientEvent;
use crate::gateway::{Gateway, InvocationRequest, SessionTable};
use crate::health::monitor::HealthMonitor;
use crate::session::{ServerStatus, Session, SessionContext, SessionState};
use crate::tool::{RemoteTool, ToolDefinition, ToolRegistry};
use crate::tool::adapter::adapt_tools;
use crate::transport::{Connector, DefaultConnector};

const EVENT_CAPACITY: usize = 256;

/// Builder for [`MCPClient`].
#[derive(Default)]
pub struct MCPClientBuilder {
    config: Option<ClientConfig>,
    connector: Option<Arc<dyn Connector>>,
    registry: Option<Arc<dyn RegistryBridge>>,
    store: Option<Arc<dyn CredentialStore>>,
    ui: Option<Arc<dyn AuthorizationUi>>,
    http: Option<reqwest::Client>,
}

impl MCPClientBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets timeouts, retry, health and recovery settings.
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replaces the built-in transports.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Sets the registry that receives discovered tools.
    pub fn with_registry(mut self, registry: Arc<dyn RegistryBridge>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets where OAuth tokens are persisted.
    pub fn with_credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets how authorization URLs and device codes reach the user.
    pub fn with_authorization_ui(mut self, ui: Arc<dyn AuthorizationUi>) -> Self {
        self.ui = Some(ui);
        self
    }

    /// Shares an HTTP client between transports and token endpoints.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Builds the MCP client. Must be called inside a tokio runtime.
    pub fn build(self) -> MCPClient {
        let settings = Arc::new(self.config.unwrap_or_default());
        let http = self.http.unwrap_or_default();

        let connector = self.connector.unwrap_or_else(|| {
            Arc::new(
                DefaultConnector::new(settings.handshake_timeout).with_http_client(http.clone()),
            )
        });
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ToolRegistry::new()));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryCredentialStore::new()));
        let ui = self.ui.unwrap_or_else(|| Arc::new(LoggingAuthorizationUi));

        let credentials = Arc::new(
            CredentialManager::new(store, ui, settings.auth.clone()).with_http_client(http),
        );
        let sessions: SessionTable = Arc::new(RwLock::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let gateway = Gateway::new(
            sessions.clone(),
            credentials.clone(),
            settings.invocation.clone(),
            shutdown.clone(),
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let ctx = Arc::new(SessionContext {
            settings: settings.clone(),
            connector,
            credentials: credentials.clone(),
            bridge: registry,
            invoke: gateway.callback(),
            events: events.clone(),
        });

        MCPClient {
            inner: Arc::new(ClientInner {
                settings,
                ctx,
                sessions,
                gateway,
                credentials,
                monitors: Mutex::new(HashMap::new()),
                events,
                shutdown,
            }),
        }
    }
}

struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!(error = %e, "Health monitor task failed");
            }
        }
    }
}

struct ClientInner {
    settings: Arc<ClientConfig>,
    ctx: Arc<SessionContext>,
    sessions: SessionTable,
    gateway: Gateway,
    credentials: Arc<CredentialManager>,
    monitors: Mutex<HashMap<String, MonitorHandle>>,
    events: broadcast::Sender<ClientEvent>,
    shutdown: CancellationToken,
}

/// Connects to any number of MCP servers and routes tool calls to them.
///
/// Cloning is cheap; clones share every session.
#[derive(Clone)]
pub struct MCPClient {
    inner: Arc<ClientInner>,
}

impl MCPClient {
    /// Creates a new builder.
    pub fn builder() -> MCPClientBuilder {
        MCPClientBuilder::new()
    }

    /// Connects to one server and registers its tools.
    ///
    /// A failed connect leaves the server listed as `Closed` with the error
    /// in its status; connecting it again replaces that session.
    pub async fn connect(&self, config: ServerConfig) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(MCPError::ShuttingDown);
        }
        config.validate()?;
        let server_id = config.id.clone();

        let (session, channel_events) = {
            let mut sessions = self.inner.sessions.write();
            if let Some(existing) = sessions.get(&server_id) {
                if !existing.state().is_closed() {
                    return Err(MCPError::config(format!(
                        "server '{server_id}' is already connected"
                    )));
                }
            }
            self.inner.credentials.register(&config);
            let (session, channel_events) = Session::new(config, self.inner.ctx.clone());
            sessions.insert(server_id.clone(), session.clone());
            (session, channel_events)
        };

        let stale = self.inner.monitors.lock().remove(&server_id);
        if let Some(stale) = stale {
            stale.stop().await;
        }

        session.start().await?;

        let cancel = self.inner.shutdown.child_token();
        let task = HealthMonitor::new(
            session,
            self.inner.settings.health.clone(),
            self.inner.settings.recovery.clone(),
            channel_events,
            cancel.clone(),
        )
        .spawn();
        self.inner
            .monitors
            .lock()
            .insert(server_id, MonitorHandle { cancel, task });
        Ok(())
    }

    /// Connects to every server concurrently; returns the failures.
    pub async fn connect_all(&self, configs: Vec<ServerConfig>) -> Vec<(String, MCPError)> {
        let attempts = configs.into_iter().map(|config| {
            let id = config.id.clone();
            async move { (id, self.connect(config).await) }
        });

        join_all(attempts)
            .await
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect()
    }

    /// Invokes `tool` on `server`.
    pub async fn execute(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        deadline: Option<Duration>,
    ) -> Result<Value> {
        let mut request = InvocationRequest::new(server, tool, arguments);
        if let Some(deadline) = deadline {
            request = request.with_deadline(deadline);
        }
        self.invoke(request).await
    }

    /// Runs a prepared invocation.
    pub async fn invoke(&self, request: InvocationRequest) -> Result<Value> {
        self.inner.gateway.execute(request).await
    }

    fn session(&self, server_id: &str) -> Result<Arc<Session>> {
        self.inner
            .sessions
            .read()
            .get(server_id)
            .cloned()
            .ok_or_else(|| MCPError::NotFound {
                server: server_id.to_string(),
                tool: None,
            })
    }

    /// Status of one server.
    pub fn status(&self, server_id: &str) -> Result<ServerStatus> {
        Ok(self.session(server_id)?.status())
    }

    /// Status of every known server, ordered by id.
    pub fn statuses(&self) -> Vec<ServerStatus> {
        let mut statuses: Vec<_> = self
            .inner
            .sessions
            .read()
            .values()
            .map(|s| s.status())
            .collect();
        statuses.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        statuses
    }

    /// Ids of every known server, sorted.
    pub fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.inner.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Watches the session state of one server.
    pub fn watch_state(&self, server_id: &str) -> Result<watch::Receiver<SessionState>> {
        Ok(self.session(server_id)?.watch_state())
    }

    /// Tools currently discovered on one server.
    pub fn tools(&self, server_id: &str) -> Result<Vec<ToolDefinition>> {
        Ok(self.session(server_id)?.tools().values().cloned().collect())
    }

    /// Tools of one server wrapped as local [`crate::tool::Tool`]s.
    pub fn remote_tools(&self, server_id: &str) -> Result<Vec<RemoteTool>> {
        let tools = self.tools(server_id)?;
        Ok(adapt_tools(server_id, tools, self.inner.ctx.invoke.clone()))
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Completes a pending authorization-code flow with the redirect's
    /// `code` and `state` parameters.
    pub fn deliver_callback(&self, code: &str, state: &str) -> Result<()> {
        self.inner.credentials.deliver_callback(code, state)
    }

    /// Runs the OAuth flow for a server ahead of connecting it.
    pub async fn authorize(&self, config: &ServerConfig) -> Result<()> {
        config.validate()?;
        self.inner.credentials.register(config);
        self.inner.credentials.authorize(&config.id).await.map(|_| ())
    }

    /// Closes one server and forgets it.
    pub async fn disconnect(&self, server_id: &str) -> Result<()> {
        let session = self.session(server_id)?;

        let monitor = self.inner.monitors.lock().remove(server_id);
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
        session.close().await;
        self.inner.sessions.write().remove(server_id);
        info!(server = %server_id, "Disconnected MCP server");
        Ok(())
    }

    /// Stops every monitor and closes every session. In-flight calls fail
    /// with [`MCPError::ShuttingDown`].
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down MCP client");
        self.inner.shutdown.cancel();

        let monitors: Vec<_> = self.inner.monitors.lock().drain().map(|(_, m)| m).collect();
        join_all(monitors.into_iter().map(MonitorHandle::stop)).await;

        let sessions: Vec<_> = self.inner.sessions.read().values().cloned().collect();
        join_all(sessions.iter().map(|s| s.close())).await;
        debug!(count = sessions.len(), "Closed all sessions");
    }
}

impl std::fmt::Debug for MCPClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MCPClient")
            .field("servers", &self.server_ids())
            .finish()
    }
}
