pub mod adapter;
pub mod registry;
pub mod schema;
pub mod validate;

pub use adapter::RemoteTool;
pub use registry::ToolRegistry;
pub use schema::{Field, SchemaKind, SchemaNode, ToolDefinition, convert_tool};
pub use tool_trait::{DynTool, Tool};
pub use validate::validate_arguments;

mod tool_trait {
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Arc;

    use crate::error::MCPError;

    /// A tool the host can call.
    #[async_trait]
    pub trait Tool: Send + Sync {
        /// Returns the name of the tool.
        fn name(&self) -> &str;
        /// Returns a description of what the tool does.
        fn description(&self) -> &str;
        /// Returns the JSON Schema for the tool's input parameters.
        fn parameters_schema(&self) -> Value;

        /// Executes the tool with the given arguments.
        async fn execute(&self, args: Value) -> Result<Value, MCPError>;
    }

    /// A type alias for a dynamic tool reference.
    pub type DynTool = Arc<dyn Tool>;
}
