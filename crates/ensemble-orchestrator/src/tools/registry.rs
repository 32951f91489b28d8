//! Tool registry.
//!
//! Name-keyed set of the tools the pipeline may execute.

use std::collections::BTreeMap;
use tracing::warn;

use super::tool::Tool;

/// Registered tools, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Tool>,
}

impl ToolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Tool) {
        let name = tool.name.clone();
        if self.tools.insert(name.clone(), tool).is_some() {
            warn!(tool = %name, "Tool replaced");
        }
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with_tool(mut self, tool: Tool) -> Self {
        self.register(tool);
        self
    }

    /// Looks up a tool by name.
    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    /// Returns the registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
