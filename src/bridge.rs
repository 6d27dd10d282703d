//! Boundary between the client and the host's tool registry.

use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;
use crate::gateway::InvocationRequest;
use crate::tool::ToolDefinition;

/// Entry point the host calls to invoke a remote tool.
pub type InvokeCallback =
    Arc<dyn Fn(InvocationRequest) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Receives tool sets as servers are discovered and lost.
///
/// Calls for one server id never overlap; calls for different servers may.
pub trait RegistryBridge: Send + Sync {
    /// Replaces every tool registered for `server_id` with `tools`.
    fn register_tools(&self, server_id: &str, tools: Vec<ToolDefinition>, invoke: InvokeCallback);

    /// Removes every tool registered for `server_id`.
    fn unregister_tools(&self, server_id: &str);
}
