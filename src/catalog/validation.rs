// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Argument checks against a tool's stored input schema.
//!
//! The schema is treated as data. Supported keywords: `type` (single or
//! union), `required`, `properties`, `enum`, `additionalProperties: false`
//! and array `items`. Anything else is accepted unchecked; the server stays
//! the final authority.

use serde_json::{Map, Value};

use crate::engine_core::errors::CatalogError;
use crate::engine_core::models::ToolRecord;

/// Normalize and validate `arguments` for `tool`.
///
/// `null` becomes `{}`. A lone `{"kwargs": {...}}` wrapper is unwrapped unless
/// the schema itself declares a `kwargs` property.
pub fn prepare_arguments(tool: &ToolRecord, arguments: Value) -> Result<Value, CatalogError> {
    let arguments = match arguments {
        Value::Null => Value::Object(Map::new()),
        other => unwrap_kwargs(&tool.input_schema, other),
    };

    if !arguments.is_object() {
        return Err(invalid(tool, "arguments must be a JSON object".to_string()));
    }

    let mut problems = Vec::new();
    check(&tool.input_schema, &arguments, "arguments", &mut problems);
    if problems.is_empty() {
        Ok(arguments)
    } else {
        Err(invalid(tool, problems.join("; ")))
    }
}

fn invalid(tool: &ToolRecord, reason: String) -> CatalogError {
    CatalogError::InvalidArguments {
        tool: tool.display_name.clone(),
        reason,
    }
}

fn unwrap_kwargs(schema: &Value, arguments: Value) -> Value {
    let declares_kwargs = schema
        .get("properties")
        .and_then(|p| p.get("kwargs"))
        .is_some();
    if declares_kwargs {
        return arguments;
    }
    match arguments {
        Value::Object(mut map) if map.len() == 1 && map.get("kwargs").is_some_and(Value::is_object) => {
            map.remove("kwargs").unwrap_or(Value::Object(Map::new()))
        }
        other => other,
    }
}

fn check(schema: &Value, value: &Value, path: &str, problems: &mut Vec<String>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    if let Some(expected) = schema.get("type") {
        if !type_matches(expected, value) {
            problems.push(format!(
                "{}: expected {}, got {}",
                path,
                describe_type(expected),
                json_type(value)
            ));
            return;
        }
    }

    if let Some(Value::Array(allowed)) = schema.get("enum") {
        if !allowed.contains(value) {
            problems.push(format!("{}: {} is not one of {}", path, value, Value::Array(allowed.clone())));
        }
    }

    match value {
        Value::Object(map) => check_object(schema, map, path, problems),
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    check(item_schema, item, &format!("{}[{}]", path, i), problems);
                }
            }
        }
        _ => {}
    }
}

fn check_object(
    schema: &Map<String, Value>,
    map: &Map<String, Value>,
    path: &str,
    problems: &mut Vec<String>,
) {
    if let Some(Value::Array(required)) = schema.get("required") {
        for name in required.iter().filter_map(Value::as_str) {
            if !map.contains_key(name) {
                problems.push(format!("{}: missing required property '{}'", path, name));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    let closed = matches!(schema.get("additionalProperties"), Some(Value::Bool(false)));

    for (key, item) in map {
        match properties.and_then(|p| p.get(key)) {
            Some(prop_schema) => check(prop_schema, item, &format!("{}.{}", path, key), problems),
            None if closed => {
                problems.push(format!("{}: unexpected property '{}'", path, key));
            }
            None => {}
        }
    }
}

fn type_matches(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(t) => single_type_matches(t, value),
        Value::Array(union) => union
            .iter()
            .filter_map(Value::as_str)
            .any(|t| single_type_matches(t, value)),
        // Unknown shape: do not reject.
        _ => true,
    }
}

fn single_type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn describe_type(expected: &Value) -> String {
    match expected {
        Value::String(t) => t.clone(),
        Value::Array(union) => union
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" | "),
        other => other.to_string(),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(schema: Value) -> ToolRecord {
        ToolRecord {
            display_name: "fs__read_file".into(),
            name: "read_file".into(),
            server: "fs".into(),
            description: String::new(),
            input_schema: schema,
        }
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "limit": {"type": "integer"},
                "mode": {"type": "string", "enum": ["text", "binary"]},
                "tags": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    #[test]
    fn test_valid_arguments_pass_through() {
        let args = json!({"path": "/tmp/a", "limit": 10, "mode": "text"});
        assert_eq!(prepare_arguments(&record(schema()), args.clone()).unwrap(), args);
    }

    #[test]
    fn test_missing_required_rejected() {
        let err = prepare_arguments(&record(schema()), json!({"limit": 1})).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidArguments { .. }));
        assert!(err.to_string().contains("'path'"));
    }

    #[test]
    fn test_type_enum_and_extra_property_errors_collected() {
        let err = prepare_arguments(
            &record(schema()),
            json!({"path": 3, "mode": "xml", "tags": ["a", 1], "extra": true}),
        )
        .unwrap_err()
        .to_string();
        assert!(err.contains("arguments.path: expected string, got number"));
        assert!(err.contains("not one of"));
        assert!(err.contains("arguments.tags[1]"));
        assert!(err.contains("unexpected property 'extra'"));
    }

    #[test]
    fn test_kwargs_wrapper_unwrapped() {
        let args = json!({"kwargs": {"path": "/etc/hosts"}});
        let out = prepare_arguments(&record(schema()), args).unwrap();
        assert_eq!(out, json!({"path": "/etc/hosts"}));
    }

    #[test]
    fn test_kwargs_kept_when_schema_declares_it() {
        let tool = record(json!({"type": "object", "properties": {"kwargs": {"type": "object"}}}));
        let args = json!({"kwargs": {"a": 1}});
        assert_eq!(prepare_arguments(&tool, args.clone()).unwrap(), args);
    }

    #[test]
    fn test_null_becomes_empty_object_and_non_object_rejected() {
        let open = record(json!({"type": "object"}));
        assert_eq!(prepare_arguments(&open, Value::Null).unwrap(), json!({}));
        assert!(prepare_arguments(&open, json!([1, 2])).is_err());
    }

    #[test]
    fn test_integer_accepts_whole_floats_and_unions() {
        let tool = record(json!({
            "type": "object",
            "properties": {"n": {"type": "integer"}, "v": {"type": ["string", "null"]}}
        }));
        assert!(prepare_arguments(&tool, json!({"n": 2.0, "v": null})).is_ok());
        assert!(prepare_arguments(&tool, json!({"n": 2.5})).is_err());
    }
}
