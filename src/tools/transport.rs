//! 工具传输层
//!
//! ToolTransport 把请求送达工具并返回原始响应信封（JSON）。
//! - HttpTransport：POST 到工具端点
//! - ChannelTransport：请求经 mpsc 发出，响应由 ToolMailbox 按令牌回填（可乱序、可重复）
//! - LocalTransport：进程内 LocalTool

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::core::AgentError;
use crate::tools::{ToolRequest, ToolSpec};

#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// 发送请求并等待响应信封；网络失败返回 Transport
    async fn send(&self, spec: &ToolSpec, request: &ToolRequest) -> Result<Value, AgentError>;
}

/// HTTP 传输：`POST {endpoint}`，请求体为 ToolRequest
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolTransport for HttpTransport {
    async fn send(&self, spec: &ToolSpec, request: &ToolRequest) -> Result<Value, AgentError> {
        let endpoint = spec
            .endpoint
            .as_deref()
            .ok_or_else(|| AgentError::transport(&spec.name, "no endpoint configured"))?;
        let resp = self
            .client
            .post(endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| AgentError::transport(&spec.name, format!("Request failed: {}", e)))?;
        if resp.status().is_server_error() {
            return Err(AgentError::transport(&spec.name, format!("HTTP {}", resp.status())));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| AgentError::transport(&spec.name, format!("Read body: {}", e)))?;
        serde_json::from_str(&body)
            .map_err(|e| AgentError::validation(&spec.name, format!("response is not JSON: {}", e)))
    }
}

/// 挂起中的调用：令牌 -> 回填通道
#[derive(Clone, Default)]
pub struct ToolMailbox {
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>,
}

impl ToolMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, token: &str) -> Result<oneshot::Receiver<Value>, AgentError> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| AgentError::transport(token, "mailbox lock poisoned"))?;
        pending.insert(token.to_string(), tx);
        Ok(rx)
    }

    fn forget(&self, token: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(token);
        }
    }

    /// 回填响应；令牌未挂起（已完成、已取消或重复）时丢弃并返回 false
    pub fn respond(&self, token: &str, envelope: Value) -> bool {
        let sender = match self.pending.lock() {
            Ok(mut pending) => pending.remove(token),
            Err(_) => None,
        };
        match sender {
            Some(tx) => tx.send(envelope).is_ok(),
            None => {
                debug!(token = %token, "discarding response for unknown or resolved token");
                false
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

/// 调用被取消或超时（future 被丢弃）时移除挂起项
struct PendingGuard<'a> {
    mailbox: &'a ToolMailbox,
    token: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.mailbox.forget(&self.token);
    }
}

/// 异步信箱传输
pub struct ChannelTransport {
    outbox: mpsc::UnboundedSender<ToolRequest>,
    mailbox: ToolMailbox,
}

impl ChannelTransport {
    /// 返回传输与请求接收端（由工具宿主消费，并经 mailbox 回填）
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ToolRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                outbox: tx,
                mailbox: ToolMailbox::new(),
            },
            rx,
        )
    }

    pub fn mailbox(&self) -> ToolMailbox {
        self.mailbox.clone()
    }
}

#[async_trait]
impl ToolTransport for ChannelTransport {
    async fn send(&self, spec: &ToolSpec, request: &ToolRequest) -> Result<Value, AgentError> {
        let rx = self.mailbox.register(&request.session_token)?;
        let _guard = PendingGuard {
            mailbox: &self.mailbox,
            token: request.session_token.clone(),
        };
        self.outbox
            .send(request.clone())
            .map_err(|_| AgentError::transport(&spec.name, "tool host disconnected"))?;
        rx.await
            .map_err(|_| AgentError::transport(&spec.name, "response channel closed"))
    }
}

/// 进程内工具
#[async_trait]
pub trait LocalTool: Send + Sync {
    fn name(&self) -> &str;

    /// 执行工具；Err 作为 error 状态返回给调用方
    async fn call(&self, parameters: Value) -> Result<Value, String>;
}

/// 进程内传输：按名分派到 LocalTool，并包装为响应信封
#[derive(Default, Clone)]
pub struct LocalTransport {
    tools: HashMap<String, Arc<dyn LocalTool>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn LocalTool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn with_tool(mut self, tool: impl LocalTool + 'static) -> Self {
        self.register(Arc::new(tool));
        self
    }
}

#[async_trait]
impl ToolTransport for LocalTransport {
    async fn send(&self, spec: &ToolSpec, request: &ToolRequest) -> Result<Value, AgentError> {
        let tool = self
            .tools
            .get(&request.tool_name)
            .ok_or_else(|| AgentError::transport(&spec.name, "no local implementation"))?;
        Ok(match tool.call(request.parameters.clone()).await {
            Ok(result) => json!({"status": "ok", "result": result}),
            Err(error) => json!({"status": "error", "error": error}),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(token: &str) -> ToolRequest {
        ToolRequest {
            tool_name: "list_events".into(),
            parameters: json!({}),
            session_token: token.into(),
        }
    }

    #[tokio::test]
    async fn test_mailbox_matches_reordered_responses() {
        let (transport, mut requests) = ChannelTransport::new();
        let transport = Arc::new(transport);
        let mailbox = transport.mailbox();
        let spec = ToolSpec::new("list_events");

        let t1 = Arc::clone(&transport);
        let s1 = spec.clone();
        let first = tokio::spawn(async move { t1.send(&s1, &request("session_a:1")).await });
        let t2 = Arc::clone(&transport);
        let s2 = spec.clone();
        let second = tokio::spawn(async move { t2.send(&s2, &request("session_b:1")).await });

        requests.recv().await.unwrap();
        requests.recv().await.unwrap();

        // 反序回填
        assert!(mailbox.respond("session_b:1", json!({"status": "ok", "result": "b"})));
        assert!(mailbox.respond("session_a:1", json!({"status": "ok", "result": "a"})));
        // 重复响应被丢弃
        assert!(!mailbox.respond("session_a:1", json!({"status": "ok", "result": "dup"})));

        assert_eq!(first.await.unwrap().unwrap()["result"], "a");
        assert_eq!(second.await.unwrap().unwrap()["result"], "b");
        assert_eq!(mailbox.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_call_leaves_no_pending_entry() {
        let (transport, _requests) = ChannelTransport::new();
        let mailbox = transport.mailbox();
        let spec = ToolSpec::new("list_events");

        let timed_out = tokio::time::timeout(
            Duration::from_millis(20),
            transport.send(&spec, &request("session_a:7")),
        )
        .await;
        assert!(timed_out.is_err());
        assert_eq!(mailbox.pending_count(), 0);
        assert!(!mailbox.respond("session_a:7", json!({"status": "ok", "result": 1})));
    }

    struct Upper;

    #[async_trait]
    impl LocalTool for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        async fn call(&self, parameters: Value) -> Result<Value, String> {
            parameters
                .get("text")
                .and_then(Value::as_str)
                .map(|s| json!(s.to_uppercase()))
                .ok_or_else(|| "text is required".to_string())
        }
    }

    #[tokio::test]
    async fn test_local_transport_wraps_envelope() {
        let transport = LocalTransport::new().with_tool(Upper);
        let spec = ToolSpec::new("upper");
        let mut req = request("s:1");
        req.tool_name = "upper".into();
        req.parameters = json!({"text": "hi"});
        let ok = transport.send(&spec, &req).await.unwrap();
        assert_eq!(ok, json!({"status": "ok", "result": "HI"}));

        req.parameters = json!({});
        let err = transport.send(&spec, &req).await.unwrap();
        assert_eq!(err["status"], "error");
    }
}
