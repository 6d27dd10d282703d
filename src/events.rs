use serde::Serialize;

/// Lifecycle notifications broadcast to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    /// A server finished its handshake and discovery
    ServerReady { server_id: String, tool_count: usize },
    /// A server's tool set was replaced
    ToolsUpdated { server_id: String, tool_count: usize },
    /// Probes report the server as slow or partially available
    ServerDegraded { server_id: String },
    /// A degraded or restarted server is healthy again
    ServerRecovered { server_id: String },
    /// Recovery gave up; the server is closed
    ServerFailed { server_id: String, reason: String },
}

impl ClientEvent {
    pub fn server_id(&self) -> &str {
        match self {
            ClientEvent::ServerReady { server_id, .. }
            | ClientEvent::ToolsUpdated { server_id, .. }
            | ClientEvent::ServerDegraded { server_id }
            | ClientEvent::ServerRecovered { server_id }
            | ClientEvent::ServerFailed { server_id, .. } => server_id,
        }
    }
}
