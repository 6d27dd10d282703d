use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::bridge::{InvokeCallback, RegistryBridge};
use crate::tool::adapter::{adapt_tools, qualified_name};
use crate::tool::{DynTool, ToolDefinition};

type ServerTools = Arc<HashMap<String, DynTool>>;

/// A registry of the remote tools available to the host.
///
/// Each server's tool set is swapped in as a whole, so readers see either the
/// previous set or the new one.
#[derive(Default)]
pub struct ToolRegistry {
    servers: RwLock<BTreeMap<String, ServerTools>>,
}

impl ToolRegistry {
    /// Creates a new empty tool registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets a tool by its qualified `{server}__{tool}` name.
    pub fn get(&self, name: &str) -> Option<DynTool> {
        let servers = self.servers.read();
        servers.values().find_map(|tools| tools.get(name).cloned())
    }

    /// Gets one server's tool by its unqualified name.
    pub fn get_tool(&self, server_id: &str, tool: &str) -> Option<DynTool> {
        let servers = self.servers.read();
        servers
            .get(server_id)
            .and_then(|tools| tools.get(&qualified_name(server_id, tool)).cloned())
    }

    /// Returns every registered tool.
    pub fn list(&self) -> Vec<DynTool> {
        let servers = self.servers.read();
        servers.values().flat_map(|tools| tools.values().cloned()).collect()
    }

    /// Returns the tools registered for one server.
    pub fn server_tools(&self, server_id: &str) -> Vec<DynTool> {
        let servers = self.servers.read();
        servers
            .get(server_id)
            .map(|tools| tools.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Ids of the servers with registered tools.
    pub fn server_ids(&self) -> Vec<String> {
        self.servers.read().keys().cloned().collect()
    }

    /// Returns the number of registered tools.
    pub fn len(&self) -> usize {
        self.servers.read().values().map(|tools| tools.len()).sum()
    }

    /// Returns whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RegistryBridge for ToolRegistry {
    fn register_tools(&self, server_id: &str, tools: Vec<ToolDefinition>, invoke: InvokeCallback) {
        let adapted: HashMap<String, DynTool> = adapt_tools(server_id, tools, invoke)
            .into_iter()
            .map(|tool| (qualified_name(server_id, &tool.definition().name), Arc::new(tool) as DynTool))
            .collect();

        debug!(server = %server_id, count = adapted.len(), "Registering tools");
        self.servers
            .write()
            .insert(server_id.to_string(), Arc::new(adapted));
    }

    fn unregister_tools(&self, server_id: &str) {
        if self.servers.write().remove(server_id).is_some() {
            debug!(server = %server_id, "Unregistered tools");
        }
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("servers", &self.server_ids())
            .field("tools_count", &self.len())
            .finish()
    }
}
