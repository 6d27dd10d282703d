//! Per-server protocol session.
//!
//! A [`Session`] drives one server through its lifecycle:
//!
//! ```text
//! Disconnected -> Connecting -> Handshaking -> Discovering -> Ready <-> Degraded
//!                     ^                                          |
//!                     +------------- Reconnecting <--------------+
//!
//! any live state -> Closing -> Closed
//! ```
//!
//! Invocations read the current channel and tool set; the health monitor
//! drives restarts. Both see the same state through a watch channel.

mod channel;
mod state;

pub(crate) use channel::{ChannelEvent, RpcChannel};
pub use state::SessionState;
use state::StateCell;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthState, CredentialManager};
use crate::bridge::{InvokeCallback, RegistryBridge};
use crate::config::{ClientConfig, ServerConfig, TransportKind};
use crate::error::{MCPError, Result, TransportError};
use crate::events::ClientEvent;
use crate::health::{HealthRecord, HealthStatus, ProbeOutcome, ProbeSample};
use crate::protocol::{
    InitializeResult, PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS, ServerCapabilities,
    ServerInfo, ToolsListResponse, methods,
};
use crate::tool::{ToolDefinition, convert_tool};
use crate::transport::Connector;

/// Capability lists probed by the health monitor, with their list method.
const PROBED_CAPABILITIES: [(&str, &str); 3] = [
    ("tools", methods::TOOLS_LIST),
    ("resources", methods::RESOURCES_LIST),
    ("prompts", methods::PROMPTS_LIST),
];

/// Collaborators shared by every session of one client.
pub(crate) struct SessionContext {
    pub settings: Arc<ClientConfig>,
    pub connector: Arc<dyn Connector>,
    pub credentials: Arc<CredentialManager>,
    pub bridge: Arc<dyn RegistryBridge>,
    pub invoke: InvokeCallback,
    pub events: broadcast::Sender<ClientEvent>,
}

/// What the server told us during the handshake.
#[derive(Debug, Clone)]
struct Negotiated {
    protocol_version: String,
    capabilities: ServerCapabilities,
    server_info: Option<ServerInfo>,
}

/// Point-in-time view of one server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub server_id: String,
    pub transport: TransportKind,
    pub state: SessionState,
    pub server_info: Option<ServerInfo>,
    pub protocol_version: Option<String>,
    pub tool_count: usize,
    pub health: Option<HealthStatus>,
    pub consecutive_failures: u32,
    pub last_latency: Option<Duration>,
    pub auth: AuthState,
    /// Advertised features this transport cannot deliver
    pub capability_gaps: Vec<String>,
    pub pending_requests: usize,
    pub last_error: Option<String>,
}

/// Connection, handshake state and discovered tools of one server.
pub(crate) struct Session {
    config: ServerConfig,
    ctx: Arc<SessionContext>,
    state: StateCell,
    negotiated: RwLock<Option<Negotiated>>,
    tools: RwLock<Arc<BTreeMap<String, ToolDefinition>>>,
    channel: RwLock<Option<Arc<RpcChannel>>>,
    generation: AtomicU64,
    channel_events: mpsc::UnboundedSender<ChannelEvent>,
    health: Mutex<HealthRecord>,
    capability_gaps: RwLock<Vec<String>>,
    last_error: RwLock<Option<String>>,
    restarting: tokio::sync::Mutex<()>,
}

impl Session {
    /// Creates a disconnected session. The receiver carries the session's
    /// channel events and belongs to its health monitor.
    pub fn new(
        config: ServerConfig,
        ctx: Arc<SessionContext>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (channel_events, rx) = mpsc::unbounded_channel();
        let window = ctx.settings.health.window;
        let session = Arc::new(Self {
            state: StateCell::new(config.id.clone()),
            config,
            ctx,
            negotiated: RwLock::new(None),
            tools: RwLock::new(Arc::new(BTreeMap::new())),
            channel: RwLock::new(None),
            generation: AtomicU64::new(0),
            channel_events,
            health: Mutex::new(HealthRecord::new(window)),
            capability_gaps: RwLock::new(Vec::new()),
            last_error: RwLock::new(None),
            restarting: tokio::sync::Mutex::new(()),
        });
        (session, rx)
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn tool(&self, name: &str) -> Option<ToolDefinition> {
        self.tools.read().get(name).cloned()
    }

    /// Snapshot of the current tool set.
    pub fn tools(&self) -> Arc<BTreeMap<String, ToolDefinition>> {
        self.tools.read().clone()
    }

    pub fn channel(&self) -> Option<Arc<RpcChannel>> {
        self.channel.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn capabilities(&self) -> ServerCapabilities {
        self.negotiated
            .read()
            .as_ref()
            .map(|n| n.capabilities.clone())
            .unwrap_or_default()
    }

    pub fn status(&self) -> ServerStatus {
        let negotiated = self.negotiated.read().clone();
        let health = self.health.lock().clone();
        ServerStatus {
            server_id: self.config.id.clone(),
            transport: self.config.kind(),
            state: self.state(),
            server_info: negotiated.as_ref().and_then(|n| n.server_info.clone()),
            protocol_version: negotiated.map(|n| n.protocol_version),
            tool_count: self.tools.read().len(),
            health: health.status(),
            consecutive_failures: health.consecutive_failures(),
            last_latency: health.last_latency(),
            auth: self.ctx.credentials.state(&self.config.id),
            capability_gaps: self.capability_gaps.read().clone(),
            pending_requests: self.channel().map(|c| c.pending_count()).unwrap_or(0),
            last_error: self.last_error.read().clone(),
        }
    }

    /// Moves to `next` when the current state satisfies `from`.
    pub fn transition_from(&self, from: impl Fn(SessionState) -> bool, next: SessionState) -> bool {
        self.state.transition_from(from, next)
    }

    /// Records a probe and returns the consecutive-failure count.
    pub fn record_probe(&self, sample: ProbeSample) -> u32 {
        self.health.lock().record(sample)
    }

    /// Clears the consecutive-failure count without recording a probe.
    pub fn reset_failures(&self) {
        self.health.lock().reset_failures();
    }

    pub fn set_last_error(&self, error: impl Into<String>) {
        *self.last_error.write() = Some(error.into());
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.ctx.events.send(event);
    }

    fn advance(&self, next: SessionState) -> Result<()> {
        if self.state.transition(next) {
            Ok(())
        } else {
            Err(MCPError::NotReady {
                server: self.config.id.clone(),
                state: self.state(),
            })
        }
    }

    /// Connects, handshakes and discovers tools.
    ///
    /// On failure the session ends up `Closed` with the error recorded.
    pub async fn start(&self) -> Result<()> {
        self.advance(SessionState::Connecting)?;
        info!(server = %self.id(), transport = %self.config.kind(), "Connecting to MCP server");

        match self.establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(server = %self.id(), error = %e, "Failed to start MCP server session");
                self.set_last_error(e.to_string());
                self.discard_channel().await;
                self.state.transition(SessionState::Closed);
                Err(e)
            }
        }
    }

    /// Tears down the current channel and runs the connect sequence again.
    ///
    /// On failure the session stays `Reconnecting`.
    pub async fn restart(&self) -> Result<()> {
        let _restarting = self.restarting.lock().await;

        self.state.transition_from(
            |s| s.accepts_invocations(),
            SessionState::Reconnecting,
        );
        self.advance(SessionState::Connecting)?;
        self.discard_channel().await;

        match self.establish().await {
            Ok(()) => {
                info!(server = %self.id(), "Reconnected to MCP server");
                Ok(())
            }
            Err(e) => {
                warn!(server = %self.id(), error = %e, "Reconnect failed");
                self.set_last_error(e.to_string());
                self.discard_channel().await;
                self.state.transition(SessionState::Reconnecting);
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<()> {
        match self.try_establish().await {
            Err(MCPError::Transport {
                source: TransportError::Unauthorized(reason),
                ..
            }) if self.config.auth_required => {
                debug!(server = %self.id(), reason, "Server rejected credentials during connect");
                self.ctx.credentials.invalidate(self.id()).await?;
                Err(MCPError::AuthRequired {
                    server: self.config.id.clone(),
                })
            }
            other => other,
        }
    }

    async fn try_establish(&self) -> Result<()> {
        let bearer = self.bearer_token().await?;
        let transport = self
            .ctx
            .connector
            .open(&self.config, bearer)
            .await
            .map_err(|e| MCPError::transport(self.id(), e))?;

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let channel = Arc::new(RpcChannel::new(
            self.id(),
            transport,
            generation,
            self.channel_events.clone(),
        ));
        *self.channel.write() = Some(channel.clone());

        let limit = self.ctx.settings.handshake_timeout;
        self.advance(SessionState::Handshaking)?;
        tokio::time::timeout(limit, self.handshake(&channel))
            .await
            .map_err(|_| MCPError::handshake(self.id(), format!("no answer within {}s", limit.as_secs())))??;

        self.advance(SessionState::Discovering)?;
        let count = tokio::time::timeout(limit, self.discover(&channel))
            .await
            .map_err(|_| MCPError::transport(self.id(), TransportError::Fatal("tool discovery timed out".to_string())))??;

        self.advance(SessionState::Ready)?;
        info!(server = %self.id(), tools = count, "MCP server ready");
        self.emit(ClientEvent::ServerReady {
            server_id: self.config.id.clone(),
            tool_count: count,
        });
        Ok(())
    }

    /// Access token for the transport, authorizing first if none is usable.
    async fn bearer_token(&self) -> Result<Option<String>> {
        if !self.config.auth_required {
            return Ok(None);
        }
        match self.ctx.credentials.ensure_fresh(self.id()).await {
            Ok(token) => Ok(token),
            Err(MCPError::AuthRequired { .. } | MCPError::AuthExpired { .. }) => {
                self.ctx.credentials.authorize(self.id()).await.map(Some)
            }
            Err(e) => Err(e),
        }
    }

    async fn handshake(&self, channel: &RpcChannel) -> Result<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": self.ctx.settings.client_name,
                "version": self.ctx.settings.client_version,
            }
        });

        let value = match self.call(channel, methods::INITIALIZE, Some(params)).await {
            Ok(value) => value,
            Err(MCPError::Application { message, .. }) => {
                return Err(MCPError::handshake(self.id(), format!("initialize rejected: {message}")));
            }
            Err(e) => return Err(e),
        };

        let result: InitializeResult = serde_json::from_value(value)
            .map_err(|e| MCPError::handshake(self.id(), format!("malformed initialize result: {e}")))?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&result.protocol_version.as_str()) {
            return Err(MCPError::handshake(
                self.id(),
                format!("unsupported protocol version '{}'", result.protocol_version),
            ));
        }

        if let Some(missing) = self
            .config
            .required_capabilities
            .iter()
            .find(|cap| !result.capabilities.has(cap))
        {
            return Err(MCPError::handshake(
                self.id(),
                format!("required capability '{missing}' not advertised"),
            ));
        }

        channel
            .notify(methods::INITIALIZED, None)
            .await
            .map_err(|e| MCPError::transport(self.id(), e))?;

        let gaps = if channel.delivery().supports_push() {
            Vec::new()
        } else {
            result.capabilities.push_features()
        };
        if !gaps.is_empty() {
            warn!(server = %self.id(), ?gaps, "Transport cannot deliver server notifications");
        }
        *self.capability_gaps.write() = gaps;

        let server_name = result.server_info.as_ref().map(|i| i.name.clone()).unwrap_or_default();
        info!(
            server = %self.id(),
            protocol_version = %result.protocol_version,
            server_name = %server_name,
            "Handshake complete"
        );

        *self.negotiated.write() = Some(Negotiated {
            protocol_version: result.protocol_version,
            capabilities: result.capabilities,
            server_info: result.server_info,
        });
        Ok(())
    }

    /// Lists every tool page, converts them and swaps the tool set in.
    async fn discover(&self, channel: &RpcChannel) -> Result<usize> {
        let mut tools = BTreeMap::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let value = self.call(channel, methods::TOOLS_LIST, params).await?;
            let page: ToolsListResponse = serde_json::from_value(value).map_err(|e| {
                MCPError::transport(
                    self.id(),
                    TransportError::Fatal(format!("malformed tools/list result: {e}")),
                )
            })?;

            for info in page.tools {
                if tools.contains_key(&info.name) {
                    warn!(server = %self.id(), tool = %info.name, "Skipping duplicate tool");
                    continue;
                }
                match convert_tool(&info) {
                    Ok(definition) => {
                        tools.insert(definition.name.clone(), definition);
                    }
                    Err(source) => {
                        let err = MCPError::Schema {
                            server: self.config.id.clone(),
                            tool: info.name.clone(),
                            source,
                        };
                        warn!(server = %self.id(), tool = %info.name, error = %err, "Skipping tool");
                    }
                }
            }

            match page.next_cursor {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next);
                }
                _ => break,
            }
        }

        let count = tools.len();
        self.install_tools(tools)?;
        debug!(server = %self.id(), count, "Discovered tools");
        Ok(count)
    }

    /// Swaps in a discovered tool set and hands it to the registry bridge.
    ///
    /// Runs under the tool-set lock that `close` also takes, so a session
    /// that started closing never registers tools again.
    fn install_tools(&self, tools: BTreeMap<String, ToolDefinition>) -> Result<()> {
        let mut current = self.tools.write();
        let state = self.state();
        if !matches!(state, SessionState::Discovering | SessionState::Ready | SessionState::Degraded) {
            return Err(MCPError::NotReady {
                server: self.config.id.clone(),
                state,
            });
        }

        let tools = Arc::new(tools);
        *current = tools.clone();
        self.ctx.bridge.register_tools(
            self.id(),
            tools.values().cloned().collect(),
            self.ctx.invoke.clone(),
        );
        Ok(())
    }

    /// Re-runs discovery on the live channel without leaving `Ready`/`Degraded`.
    pub async fn rediscover(&self) -> Result<usize> {
        let state = self.state();
        let channel = match self.channel() {
            Some(channel) if state.accepts_invocations() => channel,
            _ => {
                return Err(MCPError::NotReady {
                    server: self.config.id.clone(),
                    state,
                });
            }
        };

        let count = self.discover(&channel).await?;
        info!(server = %self.id(), tools = count, "Tool list changed");
        self.emit(ClientEvent::ToolsUpdated {
            server_id: self.config.id.clone(),
            tool_count: count,
        });
        Ok(count)
    }

    /// Sends a request and splits the response into result or error.
    async fn call(&self, channel: &RpcChannel, method: &str, params: Option<Value>) -> Result<Value> {
        let response = channel
            .request(method, params)
            .await
            .map_err(|e| MCPError::transport(self.id(), e.error))?;
        response.into_result().map_err(|e| MCPError::Application {
            code: Some(e.code),
            message: e.message,
            data: e.data,
        })
    }

    /// Pings the server, then lists every advertised probeable capability.
    ///
    /// Each request is timed from the moment the channel can carry it, so
    /// time spent queued behind a slow call on a request-only transport does
    /// not count against the server.
    pub async fn probe(&self) -> ProbeOutcome {
        let Some(channel) = self.channel() else {
            return ProbeOutcome::NoChannel;
        };
        let limit = self.ctx.settings.health.degraded_latency;

        let latency = {
            let _turn = channel.turn().await;
            let started = Instant::now();
            match tokio::time::timeout(limit, channel.request_in_turn(methods::PING, None)).await {
                Err(_) => {
                    return ProbeOutcome::Failed(format!("no ping response within {}ms", limit.as_millis()));
                }
                Ok(Err(e)) => return ProbeOutcome::Failed(e.error.to_string()),
                Ok(Ok(_)) => {}
            }
            started.elapsed()
        };

        let capabilities = self.capabilities();
        let mut missing_required = Vec::new();
        let mut missing_optional = Vec::new();

        for (capability, method) in PROBED_CAPABILITIES {
            let required = self.config.required_capabilities.iter().any(|c| c == capability);
            let answered = capabilities.has(capability) && {
                let _turn = channel.turn().await;
                matches!(
                    tokio::time::timeout(limit, channel.request_in_turn(method, None)).await,
                    Ok(Ok(ref response)) if response.error.is_none()
                )
            };

            if answered {
                continue;
            }
            if required {
                missing_required.push(capability.to_string());
            } else if capabilities.has(capability) {
                missing_optional.push(capability.to_string());
            }
        }

        debug!(
            server = %self.id(),
            latency_ms = latency.as_millis() as u64,
            ?missing_required,
            ?missing_optional,
            "Probe answered"
        );
        ProbeOutcome::Answered {
            latency,
            missing_required,
            missing_optional,
        }
    }

    /// Moves a live session to `Reconnecting` and drops its channel.
    pub async fn begin_reconnect(&self) -> bool {
        if !self
            .state
            .transition_from(|s| s.accepts_invocations(), SessionState::Reconnecting)
        {
            return false;
        }
        self.discard_channel().await;
        true
    }

    /// Reacts to a failure reported by the channel of `generation`.
    ///
    /// Returns true when the failure concerned the live channel and the
    /// session moved to `Reconnecting`.
    pub async fn handle_channel_failure(&self, generation: u64, error: &TransportError) -> bool {
        if generation != self.generation() {
            debug!(server = %self.id(), generation, "Ignoring failure of a stale channel");
            return false;
        }
        if !self.state().accepts_invocations() {
            return false;
        }
        warn!(server = %self.id(), error = %error, "Transport failed");
        self.set_last_error(error.to_string());
        self.begin_reconnect().await
    }

    async fn discard_channel(&self) {
        let channel = self.channel.write().take();
        if let Some(channel) = channel {
            let limit = self.ctx.settings.shutdown_timeout;
            if let Err(e) = tokio::time::timeout(limit, channel.close()).await.unwrap_or(Ok(())) {
                debug!(server = %self.id(), error = %e, "Error closing transport");
            }
        }
    }

    /// Closes the session: best-effort shutdown notice, transport close,
    /// tool unregistration.
    pub async fn close(&self) {
        let was_live = self.state().accepts_invocations();
        if !self
            .state
            .transition_from(|s| !matches!(s, SessionState::Closing | SessionState::Closed), SessionState::Closing)
        {
            return;
        }
        info!(server = %self.id(), "Closing MCP server session");

        let channel = self.channel.write().take();
        if let Some(channel) = channel {
            let limit = self.ctx.settings.shutdown_timeout;
            if was_live {
                match tokio::time::timeout(limit, channel.notify(methods::SHUTDOWN, None)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(server = %self.id(), error = %e, "Shutdown notice failed"),
                    Err(_) => debug!(server = %self.id(), "Shutdown notice timed out"),
                }
            }
            if let Err(e) = tokio::time::timeout(limit, channel.close()).await.unwrap_or(Ok(())) {
                debug!(server = %self.id(), error = %e, "Error closing transport");
            }
        }

        {
            let mut tools = self.tools.write();
            *tools = Arc::new(BTreeMap::new());
            self.ctx.bridge.unregister_tools(self.id());
        }
        self.state.transition(SessionState::Closed);
        info!(server = %self.id(), "MCP server session closed");
    }

    /// Closes the session for good after recovery gave up.
    pub async fn fail(&self, reason: String) {
        error!(server = %self.id(), reason = %reason, "MCP server failed permanently");
        self.set_last_error(reason.clone());
        self.close().await;
        self.emit(ClientEvent::ServerFailed {
            server_id: self.config.id.clone(),
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{LoggingAuthorizationUi, MemoryCredentialStore};
    use crate::gateway::InvocationRequest;
    use crate::protocol::MCPToolInfo;
    use crate::tool::ToolRegistry;
    use crate::transport::DefaultConnector;
    use futures::FutureExt;

    fn session(registry: Arc<ToolRegistry>) -> Arc<Session> {
        let settings = Arc::new(ClientConfig::default());
        let credentials = Arc::new(CredentialManager::new(
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(LoggingAuthorizationUi),
            settings.auth.clone(),
        ));
        let invoke: InvokeCallback =
            Arc::new(|_req: InvocationRequest| async { Ok::<_, MCPError>(Value::Null) }.boxed());
        let (events, _) = broadcast::channel(8);

        let ctx = Arc::new(SessionContext {
            settings,
            connector: Arc::new(DefaultConnector::new(Duration::from_secs(1))),
            credentials,
            bridge: registry,
            invoke,
            events,
        });
        Session::new(ServerConfig::stdio("srv", "unused", vec![]), ctx).0
    }

    fn tool_set(name: &str) -> BTreeMap<String, ToolDefinition> {
        let info = MCPToolInfo {
            name: name.to_string(),
            description: None,
            input_schema: json!({"type": "object"}),
        };
        let definition = convert_tool(&info).unwrap();
        BTreeMap::from([(definition.name.clone(), definition)])
    }

    #[tokio::test]
    async fn test_closed_session_never_registers_tools_again() {
        let registry = Arc::new(ToolRegistry::new());
        let session = session(registry.clone());
        for next in [
            SessionState::Connecting,
            SessionState::Handshaking,
            SessionState::Discovering,
        ] {
            assert!(session.state.transition(next));
        }

        session.install_tools(tool_set("first")).unwrap();
        assert!(session.state.transition(SessionState::Ready));
        assert!(registry.get("srv__first").is_some());

        session.close().await;
        assert!(registry.get("srv__first").is_none());

        let err = session.install_tools(tool_set("late")).unwrap_err();
        assert!(matches!(err, MCPError::NotReady { state: SessionState::Closed, .. }));
        assert!(registry.get("srv__late").is_none());
        assert!(session.tools().is_empty());
    }
}
