// Tool call validation
//
// Checks a call against the declared schema before anything else runs.

use crate::error::{Result, RuntimeError};

use super::registry::ToolRegistry;
use super::tool::{Tool, ToolCall, ToolSchema};

/// Collects every schema violation in a call.
///
/// Required parameters must be present and non-null; present parameters must
/// match their declared kind. Undeclared parameters are passed through.
pub fn schema_errors(call: &ToolCall, schema: &ToolSchema) -> Vec<String> {
    let mut errors = Vec::new();

    for name in &schema.required {
        match call.parameters.get(name) {
            None | Some(serde_json::Value::Null) => {
                errors.push(format!("missing required parameter '{name}'"));
            }
            Some(_) => {}
        }
    }

    let mut declared: Vec<_> = schema.properties.iter().collect();
    declared.sort_by(|a, b| a.0.cmp(b.0));
    for (name, property) in declared {
        let Some(value) = call.parameters.get(name) else { continue };
        if value.is_null() {
            continue;
        }
        if !property.kind.matches(value) {
            errors.push(format!("parameter '{name}' must be {}", property.kind));
        }
    }

    errors
}

/// Resolves the tool for a call and validates its parameters.
///
/// # Errors
/// `ValidationFailed` for an unknown tool or any schema violation.
pub fn validate<'a>(registry: &'a ToolRegistry, call: &ToolCall) -> Result<&'a Tool> {
    let tool = registry
        .get(&call.tool_name)
        .ok_or_else(|| RuntimeError::ValidationFailed(vec![format!("unknown tool '{}'", call.tool_name)]))?;

    let errors = schema_errors(call, &tool.schema);
    if errors.is_empty() {
        Ok(tool)
    } else {
        Err(RuntimeError::ValidationFailed(errors))
    }
}
