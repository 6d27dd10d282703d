//! Server and client configuration.
//!
//! Parsing configuration files is the host's job; these types only describe
//! the shape the client consumes, with serde defaults for every tunable.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{MCPError, Result};

/// Configuration for connecting to one MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique server id
    pub id: String,
    /// Transport type and configuration
    pub transport: TransportConfig,
    /// Whether calls must carry OAuth credentials
    #[serde(default)]
    pub auth_required: bool,
    /// OAuth settings, required when `auth_required` is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthConfig>,
    /// Capabilities the server must advertise and keep answering
    #[serde(default = "default_required_capabilities")]
    pub required_capabilities: Vec<String>,
}

fn default_required_capabilities() -> Vec<String> {
    vec!["tools".to_string()]
}

/// Transport type for MCP connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Connect via stdin/stdout of a process
    Stdio {
        /// The command to run
        command: String,
        /// Command arguments
        #[serde(default)]
        args: Vec<String>,
        /// Environment variables, already substituted by the host
        #[serde(default)]
        env: HashMap<String, String>,
        /// Working directory for the process
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },
    /// Connect via Server-Sent Events plus per-request POSTs
    Sse {
        /// The URL of the SSE endpoint
        url: String,
        /// Extra HTTP headers
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// Connect via plain HTTP request/response
    Http {
        /// The URL requests are POSTed to
        url: String,
        /// Extra HTTP headers
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

/// The three transport personalities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Sse,
    Http,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse => "sse",
            TransportKind::Http => "http",
        };
        f.write_str(name)
    }
}

impl TransportConfig {
    /// Returns the transport kind.
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Stdio { .. } => TransportKind::Stdio,
            TransportConfig::Sse { .. } => TransportKind::Sse,
            TransportConfig::Http { .. } => TransportKind::Http,
        }
    }
}

impl ServerConfig {
    /// A server reached by spawning `command`.
    pub fn stdio(id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self::new(
            id,
            TransportConfig::Stdio {
                command: command.into(),
                args,
                env: HashMap::new(),
                cwd: None,
            },
        )
    }

    /// A server reached over an event stream.
    pub fn sse(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(
            id,
            TransportConfig::Sse {
                url: url.into(),
                headers: HashMap::new(),
            },
        )
    }

    /// A server reached over plain HTTP.
    pub fn http(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(
            id,
            TransportConfig::Http {
                url: url.into(),
                headers: HashMap::new(),
            },
        )
    }

    /// Creates a config from an id and transport.
    pub fn new(id: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            id: id.into(),
            transport,
            auth_required: false,
            oauth: None,
            required_capabilities: default_required_capabilities(),
        }
    }

    /// Adds an environment variable (stdio only).
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let TransportConfig::Stdio { env, .. } = &mut self.transport {
            env.insert(key.into(), value.into());
        }
        self
    }

    /// Adds an HTTP header (sse and http only).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        match &mut self.transport {
            TransportConfig::Sse { headers, .. } | TransportConfig::Http { headers, .. } => {
                headers.insert(name.into(), value.into());
            }
            TransportConfig::Stdio { .. } => {}
        }
        self
    }

    /// Requires OAuth with the given settings.
    pub fn with_oauth(mut self, oauth: OAuthConfig) -> Self {
        self.auth_required = true;
        self.oauth = Some(oauth);
        self
    }

    /// Overrides the required capability list.
    pub fn with_required_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.required_capabilities = capabilities;
        self
    }

    /// Returns the transport kind.
    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Checks the config is usable.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(MCPError::config("server id must not be empty"));
        }

        match &self.transport {
            TransportConfig::Stdio { command, .. } if command.trim().is_empty() => {
                return Err(MCPError::config(format!(
                    "server '{}': stdio command must not be empty",
                    self.id
                )));
            }
            TransportConfig::Sse { url, .. } | TransportConfig::Http { url, .. } => {
                reqwest::Url::parse(url).map_err(|e| {
                    MCPError::config(format!("server '{}': invalid url '{url}': {e}", self.id))
                })?;
            }
            _ => {}
        }

        match (&self.oauth, self.auth_required) {
            (None, true) => Err(MCPError::config(format!(
                "server '{}' requires auth but has no oauth settings",
                self.id
            ))),
            (Some(oauth), _) => oauth.validate(&self.id),
            (None, false) => Ok(()),
        }
    }
}

/// OAuth grant used to first obtain a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    /// Browser redirect with PKCE
    AuthorizationCode,
    /// Confidential client, no user involved
    ClientCredentials,
    /// User enters a code on another device
    DeviceCode,
}

/// OAuth2 settings for one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// Grant used for the initial authorization
    pub grant: GrantType,
    /// OAuth client id
    pub client_id: String,
    /// Client secret for confidential clients
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Authorization endpoint (authorization code grant)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,
    /// Token endpoint
    pub token_endpoint: String,
    /// Device authorization endpoint (device code grant)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_authorization_endpoint: Option<String>,
    /// Redirect URI registered for the client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    /// Requested scopes
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl OAuthConfig {
    fn validate(&self, server: &str) -> Result<()> {
        let missing = |what: &str| {
            MCPError::config(format!(
                "server '{server}': {what} is required for the {:?} grant",
                self.grant
            ))
        };

        match self.grant {
            GrantType::AuthorizationCode => {
                if self.authorization_endpoint.is_none() {
                    return Err(missing("authorization_endpoint"));
                }
                if self.redirect_uri.is_none() {
                    return Err(missing("redirect_uri"));
                }
            }
            GrantType::ClientCredentials => {
                if self.client_secret.is_none() {
                    return Err(missing("client_secret"));
                }
            }
            GrantType::DeviceCode => {
                if self.device_authorization_endpoint.is_none() {
                    return Err(missing("device_authorization_endpoint"));
                }
            }
        }
        Ok(())
    }

    /// Space-separated scope string, if any scopes are configured.
    pub fn scope(&self) -> Option<String> {
        if self.scopes.is_empty() {
            None
        } else {
            Some(self.scopes.join(" "))
        }
    }
}

/// Client-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Name sent in `clientInfo`
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Version sent in `clientInfo`
    #[serde(default = "default_client_version")]
    pub client_version: String,
    /// Bound on the initialize exchange
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: Duration,
    /// Bound on closing a session
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,
    #[serde(default)]
    pub invocation: InvocationConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub recovery: RecoveryPolicy,
    #[serde(default)]
    pub auth: AuthSettings,
}

fn default_client_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: default_client_name(),
            client_version: default_client_version(),
            handshake_timeout: default_handshake_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            invocation: InvocationConfig::default(),
            health: HealthConfig::default(),
            recovery: RecoveryPolicy::default(),
            auth: AuthSettings::default(),
        }
    }
}

/// Gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationConfig {
    /// Deadline applied when the caller passes none
    #[serde(default = "default_deadline")]
    pub default_deadline: Duration,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_deadline() -> Duration {
    Duration::from_secs(30)
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            default_deadline: default_deadline(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Backoff for retrying invocations that never left the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base")]
    pub base_delay: Duration,
    #[serde(default = "default_retry_factor")]
    pub factor: u32,
    /// Upper bound of the random jitter added to each delay
    #[serde(default = "default_retry_jitter")]
    pub max_jitter: Duration,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base() -> Duration {
    Duration::from_millis(500)
}

fn default_retry_factor() -> u32 {
    2
}

fn default_retry_jitter() -> Duration {
    Duration::from_millis(250)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_retry_base(),
            factor: default_retry_factor(),
            max_jitter: default_retry_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based), without jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(self.factor.saturating_pow(retry))
    }
}

/// Health probe settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Time between probes
    #[serde(default = "default_probe_interval")]
    pub interval: Duration,
    /// Probes faster than this are healthy
    #[serde(default = "default_healthy_latency")]
    pub healthy_latency: Duration,
    /// Probes slower than this count as no response
    #[serde(default = "default_degraded_latency")]
    pub degraded_latency: Duration,
    /// Number of probe samples kept
    #[serde(default = "default_window")]
    pub window: usize,
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_healthy_latency() -> Duration {
    Duration::from_secs(1)
}

fn default_degraded_latency() -> Duration {
    Duration::from_secs(5)
}

fn default_window() -> usize {
    32
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: default_probe_interval(),
            healthy_latency: default_healthy_latency(),
            degraded_latency: default_degraded_latency(),
            window: default_window(),
        }
    }
}

/// Restart policy applied after unhealthy probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPolicy {
    /// Restarts attempted before the server is closed for good
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_recovery_base")]
    pub base_delay: Duration,
    #[serde(default = "default_recovery_cap")]
    pub max_delay: Duration,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_recovery_base() -> Duration {
    Duration::from_secs(1)
}

fn default_recovery_cap() -> Duration {
    Duration::from_secs(60)
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_recovery_base(),
            max_delay: default_recovery_cap(),
        }
    }
}

impl RecoveryPolicy {
    /// Delay before the restart triggered by the `failures`-th consecutive
    /// unhealthy probe, or `None` once the attempts are exhausted.
    ///
    /// The first failure restarts immediately; later ones back off
    /// exponentially from `base_delay`, capped at `max_delay`.
    pub fn delay_for(&self, failures: u32) -> Option<Duration> {
        if failures == 0 || failures > self.max_attempts {
            return None;
        }
        if failures == 1 {
            return Some(Duration::ZERO);
        }
        let exp = 2u32.saturating_pow(failures - 2);
        Some(self.base_delay.saturating_mul(exp).min(self.max_delay))
    }
}

/// Credential Manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    /// Tokens expiring within this margin are refreshed first
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin: Duration,
    /// How long to wait for the browser redirect or device approval
    #[serde(default = "default_callback_timeout")]
    pub callback_timeout: Duration,
}

fn default_refresh_margin() -> Duration {
    Duration::from_secs(60)
}

fn default_callback_timeout() -> Duration {
    Duration::from_secs(300)
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            refresh_margin: default_refresh_margin(),
            callback_timeout: default_callback_timeout(),
        }
    }
}
