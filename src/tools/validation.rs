//! Validate tool call arguments against JSON Schema before execution.

/// Validate tool arguments against a JSON Schema.
///
/// Top-level checks only: schema type, required field presence (a `null`
/// counts as absent), undeclared properties when `additionalProperties` is
/// `false`, property types, and string enums. Returns `Err(message)`
/// describing the first violation found.
pub fn validate_arguments(
    args: &serde_json::Value,
    schema: &serde_json::Value,
) -> Result<(), String> {
    if let Some(schema_type) = schema.get("type").and_then(|v| v.as_str()) {
        if schema_type == "object" && !args.is_object() {
            return Err(format!(
                "expected object arguments, got {}",
                json_type_name(args)
            ));
        }
    }

    let Some(obj) = args.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
        for name in required.iter().filter_map(|f| f.as_str()) {
            match obj.get(name) {
                None | Some(serde_json::Value::Null) => {
                    return Err(format!("missing required field '{name}'"));
                }
                Some(_) => {}
            }
        }
    }

    let properties = schema.get("properties").and_then(|v| v.as_object());
    let closed = schema.get("additionalProperties") == Some(&serde_json::Value::Bool(false));

    for (key, value) in obj {
        let Some(prop_schema) = properties.and_then(|p| p.get(key)) else {
            if closed {
                return Err(format!("unexpected field '{key}'"));
            }
            continue;
        };
        if let Some(expected_type) = prop_schema.get("type").and_then(|v| v.as_str()) {
            if !value_matches_type(value, expected_type) {
                return Err(format!(
                    "field '{}' expected type '{}', got {}",
                    key,
                    expected_type,
                    json_type_name(value)
                ));
            }
        }
        if let (Some(allowed), Some(s)) = (
            prop_schema.get("enum").and_then(|v| v.as_array()),
            value.as_str(),
        ) {
            if !allowed.iter().any(|a| a.as_str() == Some(s)) {
                let allowed = serde_json::Value::Array(allowed.clone());
                return Err(format!("field '{key}' must be one of {allowed}"));
            }
        }
    }

    Ok(())
}

fn value_matches_type(value: &serde_json::Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

pub(crate) fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
