//! # Simple MCP
//!
//! A multi-server Model Context Protocol client.
//!
//! ## Features
//!
//! - **Transports**: stdio child processes, SSE event streams and plain HTTP
//! - **Sessions**: handshake, tool discovery and a guarded lifecycle per server
//! - **Schema conversion**: server input schemas become typed parameter trees
//! - **Invocation gateway**: argument validation, deadlines and safe retries
//! - **Health monitoring**: periodic probes with backoff-driven restarts
//! - **OAuth**: PKCE, client credentials and device code grants with refresh
//!
//! ## Quick Start
//!
//! ```no_run
//! use simple_mcp::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = MCPClient::builder().build();
//!
//!     client
//!         .connect(ServerConfig::stdio("files", "mcp-server-files", vec![]))
//!         .await?;
//!
//!     for tool in client.tools("files")? {
//!         println!("{}: {}", tool.name, tool.description);
//!     }
//!
//!     let result = client
//!         .execute("files", "read_file", json!({"path": "README.md"}), None)
//!         .await?;
//!     println!("{result}");
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod health;
pub mod protocol;
pub mod session;
pub mod tool;
pub mod transport;

// Re-exports for convenient usage
pub use auth::{AuthState, AuthorizationUi, CredentialManager, CredentialStore, MemoryCredentialStore, OAuthToken};
pub use bridge::{InvokeCallback, RegistryBridge};
pub use client::{MCPClient, MCPClientBuilder};
pub use config::{ClientConfig, GrantType, OAuthConfig, ServerConfig, TransportConfig, TransportKind};
pub use error::{MCPError, Result, SchemaError, TransportError};
pub use events::ClientEvent;
pub use gateway::InvocationRequest;
pub use health::HealthStatus;
pub use session::{ServerStatus, SessionState};
pub use tool::{DynTool, RemoteTool, SchemaNode, Tool, ToolDefinition, ToolRegistry};
pub use transport::{Connector, DefaultConnector, Transport};

/// Prelude module with commonly used types.
pub mod prelude {
    pub use crate::client::{MCPClient, MCPClientBuilder};
    pub use crate::config::{ClientConfig, OAuthConfig, ServerConfig};
    pub use crate::error::MCPError;
    pub use crate::events::ClientEvent;
    pub use crate::session::{ServerStatus, SessionState};
    pub use crate::tool::{DynTool, Tool, ToolDefinition, ToolRegistry};
}
