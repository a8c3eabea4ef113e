//! 工具调用器
//!
//! ToolInvoker 是 Agent 依赖的抽象能力；RegistryInvoker 是默认实现：
//! 发送前校验参数 → 超时内经传输层发送（幂等工具按策略重试）→ 解析信封并校验结果。
//! 每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::timeout;

use crate::core::AgentError;
use crate::tools::retry::RetryPolicy;
use crate::tools::transport::ToolTransport;
use crate::tools::{validation, ToolCall, ToolRegistry, ToolResult};

#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// 执行一次工具调用；error 状态的结果以 Ok 返回，由调用方决定如何处理
    async fn invoke(&self, call: &ToolCall, timeout: Duration) -> Result<ToolResult, AgentError>;
}

/// 基于注册表 + 传输层的调用器
pub struct RegistryInvoker {
    registry: Arc<ToolRegistry>,
    transport: Arc<dyn ToolTransport>,
    retry: RetryPolicy,
}

impl RegistryInvoker {
    pub fn new(registry: Arc<ToolRegistry>, transport: Arc<dyn ToolTransport>) -> Self {
        Self {
            registry,
            transport,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl ToolInvoker for RegistryInvoker {
    async fn invoke(&self, call: &ToolCall, limit: Duration) -> Result<ToolResult, AgentError> {
        let spec = self
            .registry
            .get(&call.tool_name)
            .ok_or_else(|| AgentError::UnknownTool(call.tool_name.clone()))?;

        validation::validate_request(&spec, &call.parameters)?;

        let policy = if spec.idempotent {
            self.retry.clone()
        } else {
            RetryPolicy::once()
        };
        let request = call.to_request();
        let start = Instant::now();
        let mut attempts = 0;

        let sent = policy
            .execute(|attempt| {
                attempts = attempt;
                let transport = Arc::clone(&self.transport);
                let spec = Arc::clone(&spec);
                let request = request.clone();
                async move {
                    match timeout(limit, transport.send(&spec, &request)).await {
                        Ok(result) => result,
                        Err(_) => Err(AgentError::transport(
                            &spec.name,
                            format!("timed out after {}ms", limit.as_millis()),
                        )),
                    }
                }
            })
            .await;

        let result = sent.and_then(|envelope| {
            let result = ToolResult::from_envelope(&envelope)
                .map_err(|reason| AgentError::validation(&spec.name, format!("malformed response: {reason}")))?;
            validation::validate_response(&spec, &result)?;
            Ok(result)
        });

        let outcome = match &result {
            Ok(r) if r.is_ok() => "ok",
            Ok(_) => "error",
            Err(AgentError::Validation { .. }) => "invalid",
            Err(AgentError::ToolUnavailable { .. }) => "unavailable",
            Err(_) => "failed",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.tool_name,
            "token": call.session_token,
            "ok": outcome == "ok",
            "outcome": outcome,
            "attempts": attempts,
            "idempotent": spec.idempotent,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&call.parameters),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        result
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
