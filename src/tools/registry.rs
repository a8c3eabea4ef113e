//! 工具注册表
//!
//! 工具规格（名称、描述、请求 / 响应 schema、幂等标记、端点、超时）在流程加载时注册，
//! 之后只读，以 `Arc<ToolRegistry>` 在会话间共享。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

/// 工具规格
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolSpec {
    pub name: String,
    /// 工具描述（供 LLM 理解功能）
    #[serde(default)]
    pub description: String,
    /// 参数 JSON Schema
    #[serde(default = "default_schema")]
    pub request_schema: Value,
    /// 成功结果 payload 的 JSON Schema
    #[serde(default = "default_schema")]
    pub response_schema: Value,
    /// 只有幂等工具才会重试
    #[serde(default)]
    pub idempotent: bool,
    /// HTTP 端点；本地工具可省略
    #[serde(default)]
    pub endpoint: Option<String>,
    /// 单工具超时，覆盖全局默认值
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            request_schema: default_schema(),
            response_schema: default_schema(),
            idempotent: false,
            endpoint: None,
            timeout_ms: None,
        }
    }

    pub fn with_request_schema(mut self, schema: Value) -> Self {
        self.request_schema = schema;
        self
    }

    pub fn with_response_schema(mut self, schema: Value) -> Self {
        self.response_schema = schema;
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    /// 单工具超时或给定默认值
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(default)
    }
}

/// 工具注册表：按名称存储 Arc<ToolSpec>
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<ToolSpec>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: ToolSpec) {
        self.tools.insert(spec.name.clone(), Arc::new(spec));
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolSpec>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 返回 (name, description) 列表
    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        let mut out: Vec<_> = self
            .tools
            .iter()
            .map(|(name, spec)| (name.clone(), spec.description.clone()))
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolSpec::new("list_events").idempotent(true).with_timeout_ms(250));
        registry.register(ToolSpec::new("create_event"));

        let spec = registry.get("list_events").unwrap();
        assert!(spec.idempotent);
        assert_eq!(spec.timeout_or(Duration::from_secs(5)), Duration::from_millis(250));
        assert_eq!(
            registry.get("create_event").unwrap().timeout_or(Duration::from_secs(5)),
            Duration::from_secs(5)
        );
        assert_eq!(registry.tool_names(), vec!["create_event", "list_events"]);
        assert!(registry.get("delete_event").is_none());
    }
}
