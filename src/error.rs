//! Error types for the simple-mcp library.

use serde_json::Value;
use thiserror::Error;

use crate::session::SessionState;

/// Result alias used across the crate.
pub type Result<T, E = MCPError> = std::result::Result<T, E>;

/// Failure raised by a transport adapter.
///
/// Only [`TransportError::Retriable`] failures are safe to retry: they are raised
/// when the connection was refused or reset before any bytes reached the server.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Connection refused or reset before the frame was sent
    #[error("retriable transport failure: {0}")]
    Retriable(String),
    /// Malformed frame, protocol violation, process exit or stream end
    #[error("fatal transport failure: {0}")]
    Fatal(String),
    /// The server rejected our credentials
    #[error("authentication rejected: {0}")]
    Unauthorized(String),
}

impl TransportError {
    /// Whether the failure happened before the frame reached the server.
    pub fn is_retriable(&self) -> bool {
        matches!(self, TransportError::Retriable(_))
    }

    /// Whether the failure was an authentication rejection.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, TransportError::Unauthorized(_))
    }

    /// Classifies a `reqwest` failure.
    pub(crate) fn from_reqwest(error: &reqwest::Error) -> Self {
        if error.is_connect() {
            TransportError::Retriable(error.to_string())
        } else {
            TransportError::Fatal(error.to_string())
        }
    }

    /// Classifies a non-success HTTP status.
    pub(crate) fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let detail = if body.is_empty() {
            status.to_string()
        } else {
            format!("{status} - {body}")
        };
        match status {
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                TransportError::Unauthorized(detail)
            }
            _ => TransportError::Fatal(format!("HTTP error: {detail}")),
        }
    }
}

/// Unsupported or malformed tool schema.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unsupported schema at '{path}': {reason}")]
pub struct SchemaError {
    /// JSON pointer-ish path of the offending node
    pub path: String,
    /// What was wrong with it
    pub reason: String,
}

impl SchemaError {
    pub(crate) fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Errors from MCP operations.
#[derive(Debug, Clone, Error)]
pub enum MCPError {
    /// Transport failure for one server
    #[error("transport error for server '{server}': {source}")]
    Transport {
        server: String,
        #[source]
        source: TransportError,
    },

    /// The initialize exchange was malformed or rejected
    #[error("handshake with server '{server}' failed: {reason}")]
    Handshake { server: String, reason: String },

    /// A tool schema could not be converted
    #[error("tool '{tool}' on server '{server}' has an unsupported schema: {source}")]
    Schema {
        server: String,
        tool: String,
        #[source]
        source: SchemaError,
    },

    /// Unknown server, or unknown tool on a known server
    #[error("{}", not_found_message(server, tool.as_deref()))]
    NotFound { server: String, tool: Option<String> },

    /// The session does not currently accept invocations
    #[error("server '{server}' is not ready (state: {state})")]
    NotReady { server: String, state: SessionState },

    /// Arguments failed structural validation
    #[error("invalid arguments for '{tool}': {reason}")]
    Validation { tool: String, reason: String },

    /// No response before the deadline
    #[error("tool call '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    /// Error returned by the remote tool or server, passed through verbatim
    #[error("server error{}: {message}", code.map(|c| format!(" [{c}]")).unwrap_or_default())]
    Application {
        code: Option<i64>,
        message: String,
        data: Option<Value>,
    },

    /// The server needs an authorization that has not been granted
    #[error("server '{server}' requires authorization")]
    AuthRequired { server: String },

    /// The stored token expired and could not be refreshed
    #[error("credentials for server '{server}' expired: {reason}")]
    AuthExpired { server: String, reason: String },

    /// An OAuth flow failed
    #[error("authorization for server '{server}' failed: {reason}")]
    OAuth { server: String, reason: String },

    /// An authorization callback did not match any pending flow
    #[error("authorization callback rejected: {reason}")]
    CallbackRejected { reason: String },

    /// Invalid configuration
    #[error("config error: {reason}")]
    Config { reason: String },

    /// The client is shutting down
    #[error("client is shutting down")]
    ShuttingDown,
}

fn not_found_message(server: &str, tool: Option<&str>) -> String {
    match tool {
        Some(tool) => format!("unknown tool '{tool}' on server '{server}'"),
        None => format!("unknown server '{server}'"),
    }
}

impl MCPError {
    /// Wraps a transport failure with its server id.
    pub fn transport(server: impl Into<String>, source: TransportError) -> Self {
        MCPError::Transport {
            server: server.into(),
            source,
        }
    }

    /// Builds a handshake failure.
    pub fn handshake(server: impl Into<String>, reason: impl Into<String>) -> Self {
        MCPError::Handshake {
            server: server.into(),
            reason: reason.into(),
        }
    }

    /// Builds a configuration failure.
    pub fn config(reason: impl Into<String>) -> Self {
        MCPError::Config {
            reason: reason.into(),
        }
    }

    /// The server id this error concerns, if any.
    pub fn server_id(&self) -> Option<&str> {
        match self {
            MCPError::Transport { server, .. }
            | MCPError::Handshake { server, .. }
            | MCPError::Schema { server, .. }
            | MCPError::NotFound { server, .. }
            | MCPError::NotReady { server, .. }
            | MCPError::AuthRequired { server }
            | MCPError::AuthExpired { server, .. }
            | MCPError::OAuth { server, .. } => Some(server),
            _ => None,
        }
    }

    /// Whether the error came from the remote tool itself.
    pub fn is_application(&self) -> bool {
        matches!(self, MCPError::Application { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let err = TransportError::from_status(reqwest::StatusCode::UNAUTHORIZED, "");
        assert!(err.is_unauthorized());
        let err = TransportError::from_status(reqwest::StatusCode::BAD_GATEWAY, "upstream");
        assert!(matches!(err, TransportError::Fatal(ref m) if m.contains("upstream")));
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_error_messages_carry_server_id() {
        let err = MCPError::NotFound {
            server: "files".into(),
            tool: Some("read".into()),
        };
        assert_eq!(err.to_string(), "unknown tool 'read' on server 'files'");
        assert_eq!(err.server_id(), Some("files"));

        let err = MCPError::Application {
            code: Some(-32000),
            message: "boom".into(),
            data: None,
        };
        assert_eq!(err.to_string(), "server error [-32000]: boom");
        assert!(err.server_id().is_none());
    }
}
