//! Tool input validation against JSON Schema, plus builders for tool schemas.

use jsonschema::Validator;
use serde_json::{json, Value};

/// Compile a tool's input schema. Fails when the schema is not valid JSON
/// Schema.
pub(crate) fn compile(schema: &Value) -> Result<Validator, String> {
    jsonschema::validator_for(schema).map_err(|e| e.to_string())
}

/// Validate `arguments`, collecting every violation
pub(crate) fn validate(validator: &Validator, arguments: &Value) -> Result<(), Vec<String>> {
    let errors: Vec<String> = validator
        .iter_errors(arguments)
        .map(|error| error.to_string())
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

// Helper functions for creating tool schemas

pub fn json_schema_object(properties: Value, required: Vec<&str>) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

pub fn json_schema_string(description: &str) -> Value {
    json!({
        "type": "string",
        "description": description
    })
}

pub fn json_schema_number(description: &str) -> Value {
    json!({
        "type": "number",
        "description": description
    })
}

pub fn json_schema_boolean(description: &str) -> Value {
    json!({
        "type": "boolean",
        "description": description
    })
}

pub fn json_schema_array(items: Value, description: &str) -> Value {
    json!({
        "type": "array",
        "items": items,
        "description": description
    })
}
