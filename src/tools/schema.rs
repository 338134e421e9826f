//! Argument validation against a tool's JSON Schema.
//!
//! Only presence of required fields is enforced here; the model's argument
//! values are otherwise passed through to the handler.  Context-injected
//! parameter names are exempt because the runtime supplies them.

use serde_json::Value;

use super::traits::ToolDefinition;

/// Validate the model's arguments against the tool's schema.
///
/// Returns `Err(message)` naming every missing required parameter together
/// with its declared type and description, so the model can self-correct.
pub fn validate_arguments(tool: &ToolDefinition, args: &Value) -> Result<(), String> {
    let Some(required) = tool.parameters.get("required").and_then(Value::as_array) else {
        return Ok(());
    };
    let properties = tool.parameters.get("properties");

    let mut missing: Vec<String> = Vec::new();
    for name in required.iter().filter_map(Value::as_str) {
        if tool.context_params.contains(&name) {
            continue;
        }
        if args.get(name).is_some() {
            continue;
        }
        let prop = properties.and_then(|p| p.get(name));
        let ty = prop
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let description = prop
            .and_then(|p| p.get("description"))
            .and_then(Value::as_str)
            .unwrap_or("");
        missing.push(format!(
            "Missing required parameter '{name}' ({ty}): {description}"
        ));
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(missing.join("; "))
    }
}
