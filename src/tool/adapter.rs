use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::bridge::InvokeCallback;
use crate::error::MCPError;
use crate::gateway::InvocationRequest;
use crate::tool::{Tool, ToolDefinition};

/// Adapter that exposes a remote server tool as a local [`Tool`].
#[derive(Clone)]
pub struct RemoteTool {
    qualified_name: String,
    server_id: String,
    definition: ToolDefinition,
    schema: Value,
    invoke: InvokeCallback,
    deadline: Option<Duration>,
}

impl RemoteTool {
    /// Creates a new remote tool adapter.
    pub fn new(server_id: &str, definition: ToolDefinition, invoke: InvokeCallback) -> Self {
        Self {
            qualified_name: qualified_name(server_id, &definition.name),
            server_id: server_id.to_string(),
            schema: definition.input_schema(),
            definition,
            invoke,
            deadline: None,
        }
    }

    /// Overrides the gateway's default deadline for calls through this tool.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn definition(&self) -> &ToolDefinition {
        &self.definition
    }
}

/// Name under which a server's tool is exposed to the host.
pub fn qualified_name(server_id: &str, tool: &str) -> String {
    format!("{server_id}__{tool}")
}

#[async_trait]
impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.qualified_name
    }

    fn description(&self) -> &str {
        &self.definition.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, args: Value) -> Result<Value, MCPError> {
        let mut request = InvocationRequest::new(&self.server_id, &self.definition.name, args);
        if let Some(deadline) = self.deadline {
            request = request.with_deadline(deadline);
        }
        (self.invoke)(request).await
    }
}

impl fmt::Debug for RemoteTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTool")
            .field("name", &self.qualified_name)
            .field("server", &self.server_id)
            .finish()
    }
}

/// Wraps every definition of one server as a remote tool.
pub fn adapt_tools(
    server_id: &str,
    tools: Vec<ToolDefinition>,
    invoke: InvokeCallback,
) -> Vec<RemoteTool> {
    tools
        .into_iter()
        .map(|def| RemoteTool::new(server_id, def, invoke.clone()))
        .collect()
}
