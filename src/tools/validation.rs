//! 按 JSON Schema 校验工具参数与结果
//!
//! 支持的关键字：type、required、properties、items、enum；嵌套对象与数组递归校验，
//! 违例描述带字段路径（如 `event.id`、`tags[1]`）。

use serde_json::Value;

use crate::core::AgentError;
use crate::tools::{ToolResult, ToolSpec};

/// 校验一个 JSON 值是否满足 schema；返回第一个违例的描述
pub fn validate_value(value: &Value, schema: &Value) -> Result<(), String> {
    validate_at(value, schema, "")
}

fn validate_at(value: &Value, schema: &Value, path: &str) -> Result<(), String> {
    if let Some(schema_type) = schema.get("type").and_then(Value::as_str) {
        if !value_matches_type(value, schema_type) {
            return Err(format!(
                "{}expected type '{}', got {}",
                describe(path),
                schema_type,
                json_type_name(value)
            ));
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(format!(
                "{}value {} is not one of {}",
                describe(path),
                value,
                Value::Array(allowed.clone())
            ));
        }
    }

    if let Some(obj) = value.as_object() {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for field in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(field) {
                    return Err(format!("missing required field '{}'", join(path, field)));
                }
            }
        }
        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for (key, v) in obj {
                if let Some(sub) = properties.get(key) {
                    validate_at(v, sub, &join(path, key))?;
                }
            }
        }
    }

    if let (Some(items), Some(arr)) = (schema.get("items"), value.as_array()) {
        for (i, v) in arr.iter().enumerate() {
            validate_at(v, items, &format!("{path}[{i}]"))?;
        }
    }

    Ok(())
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn describe(path: &str) -> String {
    if path.is_empty() {
        String::new()
    } else {
        format!("field '{path}' ")
    }
}

/// schema 中声明的必需字段
pub fn required_fields(schema: &Value) -> Vec<String> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// 发送前校验参数
pub fn validate_request(spec: &ToolSpec, parameters: &Value) -> Result<(), AgentError> {
    validate_value(parameters, &spec.request_schema)
        .map_err(|reason| AgentError::validation(&spec.name, format!("request: {reason}")))
}

/// 接收后校验成功结果的 payload；error 状态不做 payload 校验
pub fn validate_response(spec: &ToolSpec, result: &ToolResult) -> Result<(), AgentError> {
    let Some(payload) = result.payload.as_ref().filter(|_| result.is_ok()) else {
        return Ok(());
    };
    validate_value(payload, &spec.response_schema)
        .map_err(|reason| AgentError::validation(&spec.name, format!("malformed response: {reason}")))
}

fn value_matches_type(value: &Value, expected: &str) -> bool {
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

fn json_type_name(value: &Value) -> &'static str {
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

    fn create_event_spec() -> ToolSpec {
        ToolSpec::new("create_event")
            .with_request_schema(json!({
                "type": "object",
                "required": ["title", "start"],
                "properties": { "title": { "type": "string" }, "start": { "type": "string" } }
            }))
            .with_response_schema(json!({
                "type": "object",
                "required": ["event_id"],
                "properties": { "event_id": { "type": "string" } }
            }))
    }

    #[test]
    fn test_request_missing_field() {
        let spec = create_event_spec();
        let err = validate_request(&spec, &json!({"title": "standup"})).unwrap_err();
        assert!(matches!(err, AgentError::Validation { .. }));
        assert!(err.to_string().contains("missing required field 'start'"));
    }

    #[test]
    fn test_request_wrong_type() {
        let spec = create_event_spec();
        let err = validate_request(&spec, &json!({"title": 42, "start": "9am"})).unwrap_err();
        assert!(err.to_string().contains("field 'title' expected type 'string'"));
    }

    #[test]
    fn test_response_payload_checked_only_for_ok() {
        let spec = create_event_spec();
        assert!(validate_response(&spec, &ToolResult::ok(json!({"event_id": "e1"}))).is_ok());
        assert!(validate_response(&spec, &ToolResult::ok(json!({"id": "e1"}))).is_err());
        assert!(validate_response(&spec, &ToolResult::ok(json!(["e1"]))).is_err());
        assert!(validate_response(&spec, &ToolResult::error("conflict")).is_ok());
    }

    #[test]
    fn test_empty_schema_accepts_anything() {
        assert!(validate_value(&json!({"anything": 42}), &json!({})).is_ok());
        assert!(validate_value(&Value::Null, &json!({})).is_ok());
    }

    fn event_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "event": {
                    "type": "object",
                    "required": ["id"],
                    "properties": { "id": { "type": "string" } }
                },
                "tags": { "type": "array", "items": { "type": "string" } },
                "status": { "enum": ["confirmed", "tentative"] }
            }
        })
    }

    #[test]
    fn test_nested_required_reports_path() {
        let err = validate_value(&json!({"event": {}}), &event_schema()).unwrap_err();
        assert_eq!(err, "missing required field 'event.id'");

        let err = validate_value(&json!({"event": {"id": 7}}), &event_schema()).unwrap_err();
        assert!(err.contains("field 'event.id' expected type 'string'"));
    }

    #[test]
    fn test_array_item_type() {
        let err = validate_value(&json!({"tags": ["a", 2]}), &event_schema()).unwrap_err();
        assert!(err.contains("field 'tags[1]' expected type 'string', got number"));
        assert!(validate_value(&json!({"tags": ["a", "b"]}), &event_schema()).is_ok());
    }

    #[test]
    fn test_enum_membership() {
        let err = validate_value(&json!({"status": "bogus"}), &event_schema()).unwrap_err();
        assert!(err.contains("field 'status' value \"bogus\" is not one of"));
        assert!(validate_value(
            &json!({"event": {"id": "e1"}, "tags": [], "status": "tentative"}),
            &event_schema()
        )
        .is_ok());
    }

    #[test]
    fn test_required_fields() {
        assert_eq!(
            required_fields(&create_event_spec().request_schema),
            vec!["title", "start"]
        );
        assert!(required_fields(&json!({"type": "object"})).is_empty());
    }
}
