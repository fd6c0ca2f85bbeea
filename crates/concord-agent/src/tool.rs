use async_trait::async_trait;
use concord_core::{ToolCall, ToolError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

/// Metadata describing a capability provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Unique tool name used in tool calls.
    pub name: String,
    /// Human-readable summary.
    pub description: String,
    /// Domains this tool can answer for.
    #[serde(default)]
    pub domains: Vec<String>,
}

impl ToolDescriptor {
    /// Create a descriptor with no domains.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            domains: Vec::new(),
        }
    }

    /// Builder-style domain list.
    pub fn with_domains(mut self, domains: Vec<String>) -> Self {
        self.domains = domains;
        self
    }
}

/// An external capability provider (calendar, mail, weather, ...).
///
/// The runtime treats every provider as an opaque, possibly-failing remote
/// call. Transient errors are retried; permanent errors are not.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Static metadata of this provider.
    fn descriptor(&self) -> &ToolDescriptor;

    /// Run the tool with JSON parameters and return its textual output.
    async fn invoke(&self, params: serde_json::Value) -> Result<String, ToolError>;
}

/// Central registry for all available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolProvider>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn ToolProvider>) {
        let name = tool.descriptor().name.clone();
        info!(tool = %name, "Registered tool");
        self.tools.insert(name, tool);
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolProvider>> {
        self.tools.get(name)
    }

    /// Whether a tool with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Descriptors of all tools, sorted by name.
    pub fn list_descriptors(&self) -> Vec<&ToolDescriptor> {
        let mut descriptors: Vec<_> = self.tools.values().map(|t| t.descriptor()).collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Tools declaring the given domain, sorted by name.
    pub fn tools_for_domain(&self, domain: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .values()
            .filter(|t| t.descriptor().domains.iter().any(|d| d == domain))
            .map(|t| t.descriptor().name.clone())
            .collect();
        names.sort();
        names
    }

    /// Invoke a tool, checking the item's allow-list first.
    pub async fn invoke(
        &self,
        call: &ToolCall,
        allowed: &BTreeSet<String>,
    ) -> Result<String, ToolError> {
        if !allowed.contains(&call.name) {
            warn!(tool = %call.name, "Tool not allowed for this work item");
            return Err(ToolError::Permanent(format!(
                "tool '{}' is not allowed for this work item",
                call.name
            )));
        }
        let tool = self
            .tools
            .get(&call.name)
            .ok_or_else(|| ToolError::Permanent(format!("unknown tool '{}'", call.name)))?;
        tool.invoke(call.params.clone()).await
    }

    /// Number of registered tools.
    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
