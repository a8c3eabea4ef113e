//! 工具调用的数据类型与线上协议
//!
//! 请求：`{tool_name, parameters, session_token}`；
//! 响应信封：`{status: "ok", result}` 或 `{status: "error", error}`。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 一次工具调用（由状态的 input_mapping 与记忆组装）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    pub parameters: Value,
    /// 请求 schema 的引用（`{tool}#request`）
    pub schema_ref: String,
    /// 会话内关联令牌 `{session_id}:{n}`
    pub session_token: String,
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>, parameters: Value, session_token: impl Into<String>) -> Self {
        let tool_name = tool_name.into();
        Self {
            schema_ref: format!("{}#request", tool_name),
            tool_name,
            parameters,
            session_token: session_token.into(),
        }
    }

    pub fn to_request(&self) -> ToolRequest {
        ToolRequest {
            tool_name: self.tool_name.clone(),
            parameters: self.parameters.clone(),
            session_token: self.session_token.clone(),
        }
    }
}

/// 发往工具端的请求体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub tool_name: String,
    pub parameters: Value,
    pub session_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Ok,
    Error,
}

/// 已确认的工具结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(payload: Value) -> Self {
        Self {
            status: ToolStatus::Ok,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            payload: None,
            error: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ToolStatus::Ok
    }

    /// 解析响应信封；结构不合法时返回原因
    pub fn from_envelope(envelope: &Value) -> Result<Self, String> {
        let obj = envelope
            .as_object()
            .ok_or_else(|| "response envelope is not an object".to_string())?;
        match obj.get("status").and_then(Value::as_str) {
            Some("ok") => {
                let result = obj
                    .get("result")
                    .ok_or_else(|| "ok response is missing 'result'".to_string())?;
                Ok(Self::ok(result.clone()))
            }
            Some("error") => {
                let message = match obj.get("error") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => return Err("error response is missing 'error'".into()),
                };
                Ok(Self::error(message))
            }
            Some(other) => Err(format!("unknown response status '{}'", other)),
            None => Err("response envelope is missing 'status'".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_parsing() {
        let ok = ToolResult::from_envelope(&json!({"status": "ok", "result": {"id": 1}})).unwrap();
        assert!(ok.is_ok());
        assert_eq!(ok.payload, Some(json!({"id": 1})));

        let err = ToolResult::from_envelope(&json!({"status": "error", "error": "slot taken"})).unwrap();
        assert!(!err.is_ok());
        assert_eq!(err.error.as_deref(), Some("slot taken"));
    }

    #[test]
    fn test_malformed_envelopes() {
        assert!(ToolResult::from_envelope(&json!("ok")).is_err());
        assert!(ToolResult::from_envelope(&json!({"result": 1})).is_err());
        assert!(ToolResult::from_envelope(&json!({"status": "ok"})).is_err());
        assert!(ToolResult::from_envelope(&json!({"status": "maybe", "result": 1})).is_err());
    }

    #[test]
    fn test_call_schema_ref() {
        let call = ToolCall::new("create_event", json!({}), "session_x:1");
        assert_eq!(call.schema_ref, "create_event#request");
        assert_eq!(call.to_request().session_token, "session_x:1");
    }
}
