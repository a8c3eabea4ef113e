//! Agent 构建器：统一的 Agent 初始化逻辑
//!
//! REPL、SessionManager 与测试共用同一套装配：流程 + LLM + 工具传输（或现成的 invoker）+ 可选存储。

use std::sync::Arc;

use crate::agent::planner::{Planner, DEFAULT_SYSTEM_PROMPT};
use crate::agent::runtime::Agent;
use crate::config::{AgentSection, AppConfig, LlmSection, StorageSection, ToolsSection};
use crate::core::AgentError;
use crate::flow::Flow;
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::memory::{FileStore, InMemoryStore, SessionSnapshot, SnapshotStore, SqliteStore};
use crate::tools::{
    Calendar, HttpTransport, LocalTransport, RegistryInvoker, RetryPolicy, ToolInvoker,
    ToolTransport,
};

/// 新会话 ID
pub fn new_session_id() -> String {
    format!("session_{}", uuid::Uuid::new_v4())
}

/// 按 [llm] 段创建客户端：openai（默认）或 mock
pub fn llm_from_config(section: &LlmSection) -> Result<Arc<dyn LlmClient>, AgentError> {
    match section.provider.as_str() {
        "openai" => {
            let mut client = OpenAiClient::new(
                section.base_url.as_deref(),
                &section.model,
                section.api_key.as_deref(),
            );
            if let Some(t) = section.temperature {
                client = client.with_temperature(t);
            }
            Ok(Arc::new(client))
        }
        "mock" => Ok(Arc::new(MockLlmClient::new())),
        other => Err(AgentError::ConfigError(format!("unknown llm provider '{}'", other))),
    }
}

/// 按 [tools] 段创建传输：local 时挂上内存日历（同时返回，便于查看事件）
pub fn transport_from_config(
    section: &ToolsSection,
) -> Result<(Arc<dyn ToolTransport>, Option<Calendar>), AgentError> {
    match section.transport.as_str() {
        "local" => {
            let calendar = Calendar::new();
            let mut transport = LocalTransport::new();
            calendar.register(&mut transport);
            Ok((Arc::new(transport), Some(calendar)))
        }
        "http" => Ok((Arc::new(HttpTransport::new()), None)),
        other => Err(AgentError::ConfigError(format!("unknown tool transport '{}'", other))),
    }
}

/// 按 [storage] 段创建存储：file / sqlite / memory
pub fn store_from_config(section: &StorageSection) -> Result<Arc<dyn SnapshotStore>, AgentError> {
    match section.backend.as_str() {
        "file" => Ok(Arc::new(FileStore::new(&section.path)?)),
        "sqlite" => {
            if let Some(parent) = section.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| AgentError::Storage(e.to_string()))?;
                }
            }
            Ok(Arc::new(SqliteStore::open(&section.path)?))
        }
        "memory" => Ok(Arc::new(InMemoryStore::new())),
        other => Err(AgentError::ConfigError(format!("unknown storage backend '{}'", other))),
    }
}

/// Agent 构建器
pub struct AgentBuilder {
    flow: Arc<Flow>,
    llm: Option<Arc<dyn LlmClient>>,
    invoker: Option<Arc<dyn ToolInvoker>>,
    transport: Option<Arc<dyn ToolTransport>>,
    retry: RetryPolicy,
    store: Option<Arc<dyn SnapshotStore>>,
    settings: AgentSection,
    session_id: Option<String>,
}

impl AgentBuilder {
    pub fn new(flow: Arc<Flow>) -> Self {
        Self {
            flow,
            llm: None,
            invoker: None,
            transport: None,
            retry: RetryPolicy::default(),
            store: None,
            settings: AgentSection::default(),
            session_id: None,
        }
    }

    /// 从配置装配 LLM、传输、重试策略与 [agent] 段；存储需另行 with_store
    pub fn from_config(flow: Arc<Flow>, config: &AppConfig) -> Result<Self, AgentError> {
        let llm = llm_from_config(&config.llm)?;
        let (transport, _) = transport_from_config(&config.tools)?;
        Ok(Self::new(flow)
            .with_llm(llm)
            .with_transport(transport)
            .with_retry(config.tools.retry.clone())
            .with_settings(config.agent.clone()))
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 直接指定 invoker（优先于 with_transport）
    pub fn with_invoker(mut self, invoker: Arc<dyn ToolInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    /// 指定传输，build 时与流程的工具注册表组成 RegistryInvoker
    pub fn with_transport(mut self, transport: Arc<dyn ToolTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_settings(mut self, settings: AgentSection) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    fn system_prompt(&self) -> String {
        self.settings
            .system_prompt
            .clone()
            .or_else(|| {
                self.flow
                    .description()
                    .map(|d| format!("{}\nTask: {}", DEFAULT_SYSTEM_PROMPT, d))
            })
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string())
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        let system_prompt = self.system_prompt();
        let llm = self
            .llm
            .ok_or_else(|| AgentError::ConfigError("no LLM client configured".into()))?;
        let invoker: Arc<dyn ToolInvoker> = match (self.invoker, self.transport) {
            (Some(invoker), _) => invoker,
            (None, Some(transport)) => Arc::new(
                RegistryInvoker::new(Arc::clone(self.flow.tools()), transport).with_retry(self.retry),
            ),
            (None, None) => {
                return Err(AgentError::ConfigError(
                    "no tool invoker or transport configured".into(),
                ))
            }
        };
        let session_id = self.session_id.unwrap_or_else(new_session_id);
        Ok(Agent::new(
            session_id,
            self.flow,
            invoker,
            Planner::new(llm, system_prompt),
            self.settings,
            self.store,
        ))
    }

    /// 构建并从快照恢复（记忆从已设置的存储读取）
    pub fn resume(self, snapshot: SessionSnapshot) -> Result<Agent, AgentError> {
        let session_id = snapshot.session_id.clone();
        let mut agent = self.with_session_id(session_id).build()?;
        agent.restore(snapshot)?;
        Ok(agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowBuilder;

    fn flow() -> Arc<Flow> {
        Arc::new(
            FlowBuilder::new("greet")
                .description("Greet the user")
                .state("hello", &[])
                .terminal()
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_build_requires_llm_and_tools() {
        let err = AgentBuilder::new(flow()).build().err().unwrap();
        assert!(matches!(err, AgentError::ConfigError(_)));

        let err = AgentBuilder::new(flow())
            .with_llm(Arc::new(MockLlmClient::new()))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("invoker"));
    }

    #[test]
    fn test_build_assigns_session_id() {
        let agent = AgentBuilder::new(flow())
            .with_llm(Arc::new(MockLlmClient::new()))
            .with_transport(Arc::new(LocalTransport::new()))
            .build()
            .unwrap();
        assert!(agent.session_id().starts_with("session_"));
        assert_eq!(agent.current_state_id(), "hello");
    }

    #[test]
    fn test_unknown_backends_are_config_errors() {
        let llm = LlmSection {
            provider: "nope".into(),
            ..LlmSection::default()
        };
        assert!(matches!(llm_from_config(&llm), Err(AgentError::ConfigError(_))));

        let storage = StorageSection {
            backend: "nope".into(),
            ..StorageSection::default()
        };
        assert!(matches!(store_from_config(&storage), Err(AgentError::ConfigError(_))));
    }
}
