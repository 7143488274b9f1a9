//! Tool argument validation against a tool's JSON parameter schema.
//!
//! Covers the subset of JSON Schema the built-in tools use: `required`,
//! primitive `type` checks, `enum` and string `pattern`. Models often send
//! numbers and booleans as strings, so those are coerced before checking.

use regex::Regex;
use serde_json::{Map, Value};

/// Validate `args` against `schema`, returning the coerced arguments.
///
/// Properties the schema does not describe are passed through untouched.
pub fn validate_arguments(schema: &Value, args: Value) -> Result<Value, String> {
    let mut obj = match args {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        Value::String(ref s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => map,
            _ => return Err(format!("arguments must be a JSON object, got {s:?}")),
        },
        other => return Err(format!("arguments must be a JSON object, got {other}")),
    };

    let properties = schema.get("properties").and_then(Value::as_object);

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        let missing: Vec<&str> = required
            .iter()
            .filter_map(Value::as_str)
            .filter(|key| obj.get(*key).is_none_or(Value::is_null))
            .collect();
        if !missing.is_empty() {
            return Err(format!("missing required parameter(s): {}", missing.join(", ")));
        }
    }

    let Some(properties) = properties else {
        return Ok(Value::Object(obj));
    };

    for (key, prop_schema) in properties {
        let Some(value) = obj.get_mut(key) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        check_property(key, prop_schema, value)?;
    }

    Ok(Value::Object(obj))
}

fn check_property(key: &str, schema: &Value, value: &mut Value) -> Result<(), String> {
    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if let Some(coerced) = coerce(expected, value) {
            *value = coerced;
        }
        if !type_matches(expected, value) {
            return Err(format!(
                "parameter '{key}' must be of type {expected}, got {}",
                type_name(value)
            ));
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array)
        && !allowed.contains(value)
    {
        return Err(format!(
            "parameter '{key}' must be one of {}",
            Value::Array(allowed.clone())
        ));
    }

    if let (Some(pattern), Some(s)) = (
        schema.get("pattern").and_then(Value::as_str),
        value.as_str(),
    ) {
        let re = Regex::new(pattern)
            .map_err(|e| format!("parameter '{key}' has an invalid pattern: {e}"))?;
        if !re.is_match(s) {
            return Err(format!("parameter '{key}' does not match pattern {pattern}"));
        }
    }

    Ok(())
}

fn coerce(expected: &str, value: &Value) -> Option<Value> {
    let s = value.as_str()?.trim();
    match expected {
        "integer" => s.parse::<i64>().ok().map(Value::from),
        "number" => s
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        "boolean" => match s.to_ascii_lowercase().as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        _ => None,
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
