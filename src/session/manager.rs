//! 会话管理
//!
//! 统一管理多会话：每个会话一个 Agent，跨会话并发，会话内串行。
//! 会话内第二个并发 step 立即返回 Busy；cancel 放弃当前轮挂起的工具调用。

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::agent::{Agent, AgentBuilder, TurnInput, TurnOutcome};
use crate::config::AgentSection;
use crate::core::{AgentError, SessionSupervisor, TurnGuard};
use crate::flow::Flow;
use crate::llm::LlmClient;
use crate::memory::{SessionSnapshot, SnapshotStore};
use crate::tools::{RetryPolicy, ToolTransport};

/// 会话 ID
pub type SessionId = String;

/// 单个会话：Agent 与其监管
struct SessionHandle {
    agent: Mutex<Agent>,
    supervisor: SessionSupervisor,
    last_active: StdMutex<Instant>,
}

impl SessionHandle {
    fn new(agent: Agent) -> Self {
        Self {
            supervisor: SessionSupervisor::new(agent.session_id()),
            agent: Mutex::new(agent),
            last_active: StdMutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        if let Ok(mut t) = self.last_active.lock() {
            *t = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }
}

/// 会话管理器
pub struct SessionManager {
    /// 已注册流程（flow_id -> Flow）
    flows: RwLock<HashMap<String, Arc<Flow>>>,
    /// 活动会话（session_id -> SessionHandle）
    sessions: RwLock<HashMap<SessionId, Arc<SessionHandle>>>,
    llm: Arc<dyn LlmClient>,
    transport: Arc<dyn ToolTransport>,
    retry: RetryPolicy,
    settings: AgentSection,
    store: Option<Arc<dyn SnapshotStore>>,
}

impl SessionManager {
    pub fn new(llm: Arc<dyn LlmClient>, transport: Arc<dyn ToolTransport>) -> Self {
        Self {
            flows: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            llm,
            transport,
            retry: RetryPolicy::default(),
            settings: AgentSection::default(),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_settings(mut self, settings: AgentSection) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// 注册流程（同 id 覆盖；已存在的会话继续使用旧定义）
    pub async fn register_flow(&self, flow: Arc<Flow>) {
        self.flows.write().await.insert(flow.id().to_string(), flow);
    }

    async fn flow(&self, flow_id: &str) -> Result<Arc<Flow>, AgentError> {
        self.flows
            .read()
            .await
            .get(flow_id)
            .cloned()
            .ok_or_else(|| AgentError::ConfigError(format!("unknown flow '{}'", flow_id)))
    }

    fn builder(&self, flow: Arc<Flow>) -> AgentBuilder {
        let mut builder = AgentBuilder::new(flow)
            .with_llm(Arc::clone(&self.llm))
            .with_transport(Arc::clone(&self.transport))
            .with_retry(self.retry.clone())
            .with_settings(self.settings.clone());
        if let Some(store) = &self.store {
            builder = builder.with_store(Arc::clone(store));
        }
        builder
    }

    async fn handle(&self, session_id: &str) -> Result<Arc<SessionHandle>, AgentError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))
    }

    /// 占用会话的当前轮；句柄在取出后已被卸载或结束时返回 SessionNotFound
    async fn begin_turn(
        &self,
        session_id: &str,
        handle: &Arc<SessionHandle>,
    ) -> Result<TurnGuard, AgentError> {
        let guard = handle.supervisor.try_begin_turn()?;
        let attached = self
            .sessions
            .read()
            .await
            .get(session_id)
            .is_some_and(|h| Arc::ptr_eq(h, handle));
        if !attached {
            return Err(AgentError::SessionNotFound(session_id.to_string()));
        }
        Ok(guard)
    }

    /// 新建会话并返回 id
    pub async fn create(&self, flow_id: &str) -> Result<SessionId, AgentError> {
        let flow = self.flow(flow_id).await?;
        let agent = self.builder(flow).build()?;
        let session_id = agent.session_id().to_string();
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), Arc::new(SessionHandle::new(agent)));
        info!(session = %session_id, flow = %flow_id, "session created");
        Ok(session_id)
    }

    /// 执行一轮；会话正忙时立即返回 Busy
    pub async fn step(
        &self,
        session_id: &str,
        input: impl Into<TurnInput>,
    ) -> Result<TurnOutcome, AgentError> {
        let handle = self.handle(session_id).await?;
        let guard = self.begin_turn(session_id, &handle).await?;
        handle.touch();
        let mut agent = handle.agent.lock().await;
        let outcome = agent.step_with_cancel(input, guard.cancel_token()).await;
        handle.touch();
        outcome
    }

    /// 取消会话当前轮；空闲时返回 false
    pub async fn cancel(&self, session_id: &str) -> Result<bool, AgentError> {
        Ok(self.handle(session_id).await?.supervisor.cancel())
    }

    /// 从存储恢复会话；已在内存中则直接返回
    pub async fn resume(&self, session_id: &str) -> Result<SessionId, AgentError> {
        if self.sessions.read().await.contains_key(session_id) {
            return Ok(session_id.to_string());
        }
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))?;
        let snapshot = store.load_snapshot(session_id)?;
        let flow = self.flow(&snapshot.flow_id).await?;
        let agent = self.builder(flow).resume(snapshot)?;

        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(SessionHandle::new(agent)));
        info!(session = %session_id, "session resumed");
        Ok(session_id.to_string())
    }

    /// 当前快照（不落盘）
    pub async fn snapshot(&self, session_id: &str) -> Result<SessionSnapshot, AgentError> {
        let handle = self.handle(session_id).await?;
        let agent = handle.agent.lock().await;
        Ok(agent.serialize())
    }

    /// 结束会话：取消进行中的轮次，移出活动集合并归档
    pub async fn terminate(&self, session_id: &str) -> Result<(), AgentError> {
        let handle = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))?;
        handle.supervisor.cancel();
        let mut agent = handle.agent.lock().await;
        agent.archive()?;
        let (prompt, completion, total) = agent.token_usage();
        info!(
            session = %session_id,
            turns = agent.turn_count(),
            prompt_tokens = prompt,
            completion_tokens = completion,
            total_tokens = total,
            "session terminated"
        );
        Ok(())
    }

    /// 活动会话 id（排序）
    pub async fn list(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 存储中可恢复的会话
    pub fn list_stored(&self) -> Result<Vec<SessionId>, AgentError> {
        match &self.store {
            Some(store) => store.list_sessions(),
            None => Ok(Vec::new()),
        }
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// 卸载空闲超时的会话（每轮已 checkpoint，可再 resume）
    ///
    /// 移除时持有会话的轮次占用，进行中或正要开始的轮次不会被卸载。
    pub async fn cleanup_expired(&self, timeout: Duration) -> usize {
        let mut sessions = self.sessions.write().await;
        let mut expired = Vec::new();
        for (id, handle) in sessions.iter() {
            if handle.idle_for() < timeout {
                continue;
            }
            if let Ok(guard) = handle.supervisor.try_begin_turn() {
                expired.push((id.clone(), guard));
            }
        }
        for (id, _guard) in &expired {
            sessions.remove(id);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired sessions unloaded");
        }
        expired.len()
    }
}
