//! Central registry of available tools.

use std::collections::HashMap;

use super::traits::{ToolDefinition, ToolInfo};

/// Stores and retrieves tool definitions by name.
///
/// Populate once at startup and share behind `Arc<ToolRegistry>`; the tool
/// loop only reads.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDefinition>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool.  Overwrites any previous tool with the same name.
    pub fn register(&mut self, tool: ToolDefinition) {
        if !self.tools.contains_key(&tool.name) {
            self.order.push(tool.name.clone());
        }
        self.tools.insert(tool.name.clone(), tool);
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    /// List all registered tools in registration order, as metadata for
    /// provider `tools` arrays.
    pub fn list(&self) -> Vec<ToolInfo> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(ToolDefinition::info)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Build a registry with the built-in tools pre-registered.
pub fn create_default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for tool in super::file_ops::definitions() {
        registry.register(tool);
    }
    registry.register(super::bash::definition());
    for tool in super::run_process::definitions() {
        registry.register(tool);
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::traits::ToolHandler;
    use serde_json::json;
    use std::sync::Arc;

    fn dummy(name: &str) -> ToolDefinition {
        let handler: ToolHandler = Arc::new(|_a, _c| Box::pin(async { Ok(json!("done")) }));
        ToolDefinition::new(name, "A test tool", json!({"type": "object"}), vec![], handler)
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::new();
        reg.register(dummy("alpha"));
        assert!(reg.get("alpha").is_some());
        assert!(reg.get("missing").is_none());
    }

    #[test]
    fn list_preserves_registration_order() {
        let mut reg = ToolRegistry::new();
        reg.register(dummy("b"));
        reg.register(dummy("a"));
        reg.register(dummy("c"));
        let names: Vec<String> = reg.list().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn overwrite_same_name_keeps_one_entry() {
        let mut reg = ToolRegistry::new();
        reg.register(dummy("dup"));
        reg.register(dummy("dup"));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.list().len(), 1);
    }

    #[test]
    fn default_registry_has_the_builtins() {
        let reg = create_default_registry();
        for name in [
            "create_file",
            "str_replace",
            "view",
            "append_file",
            "bash",
            "run_process",
            "list_processes",
            "stop_process",
            "add_process_callbacks",
        ] {
            assert!(reg.get(name).is_some(), "missing builtin {name}");
        }
    }
}
