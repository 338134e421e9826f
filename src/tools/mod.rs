//! Tool surface: registry, argument validation, and the built-in tools.

pub mod bash;
pub mod file_ops;
pub mod registry;
pub mod run_process;
pub mod schema;
pub mod traits;

pub use registry::{ToolRegistry, create_default_registry};
pub use traits::{ExecutionContext, ToolDefinition, ToolError, ToolHandler, ToolInfo};

use serde_json::Value;

/// Extract a required string argument.
pub(crate) fn require_str<'a>(args: &'a Value, name: &str) -> Result<&'a str, ToolError> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing required argument '{name}'")))
}

/// Extract an optional string argument.
pub(crate) fn optional_str<'a>(args: &'a Value, name: &str) -> Option<&'a str> {
    args.get(name).and_then(Value::as_str)
}

/// Extract an optional unsigned integer argument.
pub(crate) fn optional_u64(args: &Value, name: &str) -> Option<u64> {
    args.get(name).and_then(Value::as_u64)
}
