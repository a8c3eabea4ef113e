//! Agent：单会话的编排入口
//!
//! 一轮（step）的流程：
//! 1. 为当前状态缺失的输入调用 LLM 抽取（调用方已给出的跳过），追加用户记录
//! 2. 循环求值当前状态：缺输入则提问并结束本轮；绑定工具且输入齐全则调用工具；
//!    终止状态直接回复；否则按转移推进，无转移成立则停留并回复
//! 3. 每轮最多一次工具往返，因此记忆长度每轮只增加 1 或 2
//!
//! 失败处理：
//! - 校验错误 / 工具返回 error：回滚本轮记录、恢复游标，返回 ClarificationNeeded
//! - 推进超限：同样回滚，返回 LoopAborted
//! - 传输失败 / 工具不可用 / 取消：保留用户记录、恢复游标，向调用方返回错误
//!
//! 每轮结束后 checkpoint；存储失败只记日志，下一轮重试。

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::planner::{fallback_question, Planner};
use crate::agent::turn::{TurnInput, TurnOutcome, TurnStatus};
use crate::config::{AgentSection, FailedExchangePolicy};
use crate::core::{AgentError, RecoveryEngine};
use crate::flow::{Flow, State, StatePhase, StateRunner, StepOutcome};
use crate::memory::{Entry, Memory, SessionSnapshot, SnapshotStore, SNAPSHOT_VERSION};
use crate::tools::{ToolCall, ToolInvoker};

/// 本轮中止的原因
enum Abort {
    /// 回滚并请用户澄清
    Clarify { reason: String, reply: String },
    Fail(AgentError),
}

impl From<AgentError> for Abort {
    fn from(e: AgentError) -> Self {
        Abort::Fail(e)
    }
}

pub struct Agent {
    session_id: String,
    runner: StateRunner,
    memory: Memory,
    invoker: Arc<dyn ToolInvoker>,
    planner: Planner,
    settings: AgentSection,
    store: Option<Arc<dyn SnapshotStore>>,
    recovery: RecoveryEngine,
    turn_count: u64,
    token_seq: u64,
}

impl Agent {
    pub(crate) fn new(
        session_id: String,
        flow: Arc<Flow>,
        invoker: Arc<dyn ToolInvoker>,
        planner: Planner,
        settings: AgentSection,
        store: Option<Arc<dyn SnapshotStore>>,
    ) -> Self {
        let runner = StateRunner::new(flow).with_max_transitions(settings.max_self_transitions);
        Self {
            memory: Memory::new(session_id.clone()),
            session_id,
            runner,
            invoker,
            planner,
            settings,
            store,
            recovery: RecoveryEngine::new(),
            turn_count: 0,
            token_seq: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn flow(&self) -> &Arc<Flow> {
        self.runner.flow()
    }

    pub fn current_state_id(&self) -> &str {
        self.runner.current_id()
    }

    pub fn phase(&self) -> StatePhase {
        self.runner.phase()
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn turn_count(&self) -> u64 {
        self.turn_count
    }

    /// LLM 累计 token：(prompt, completion, total)
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.planner.token_usage()
    }

    /// 当前状态仍缺的输入（声明顺序）
    pub fn missing_inputs(&self) -> Vec<String> {
        self.runner.current().get_missing_inputs(&self.memory)
    }

    pub fn is_finished(&self) -> bool {
        self.runner.current().terminal
    }

    fn next_token(&mut self) -> String {
        self.token_seq += 1;
        format!("{}:{}", self.session_id, self.token_seq)
    }

    fn history(&self) -> Vec<crate::memory::Message> {
        self.memory.to_messages(Some(self.settings.context_window))
    }

    pub async fn step(&mut self, input: impl Into<TurnInput>) -> Result<TurnOutcome, AgentError> {
        self.step_with_cancel(input, CancellationToken::new()).await
    }

    /// 可取消的一轮：取消时放弃挂起的工具调用，只保留用户记录
    pub async fn step_with_cancel(
        &mut self,
        input: impl Into<TurnInput>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let input = input.into();
        let start_cursor = self.runner.cursor();
        let start_len = self.memory.len();
        self.runner.begin_turn();
        self.turn_count += 1;
        info!(
            session = %self.session_id,
            state = %self.runner.current_id(),
            turn = self.turn_count,
            "turn started"
        );

        let result = match self.run_turn(input, &cancel).await {
            Ok(outcome) => {
                info!(
                    session = %self.session_id,
                    state = %outcome.state_id,
                    status = ?outcome.status,
                    transitions = ?outcome.transitions,
                    "turn finished"
                );
                Ok(outcome)
            }
            Err(Abort::Clarify { reason, reply }) => {
                self.discard_turn(start_len)?;
                self.runner.restore_cursor(start_cursor);
                warn!(session = %self.session_id, reason = %reason, "tool exchange rejected, turn rolled back");
                Ok(self.outcome(TurnStatus::ClarificationNeeded { reason }, reply, Vec::new()))
            }
            Err(Abort::Fail(err @ AgentError::LoopDetected { .. })) => {
                self.discard_turn(start_len)?;
                self.runner.restore_cursor(start_cursor);
                warn!(session = %self.session_id, error = %err, "loop detected, turn rolled back");
                let limit = self.runner.max_transitions();
                let reply = self.recovery_reply(&err);
                Ok(self.outcome(TurnStatus::LoopAborted { limit }, reply, Vec::new()))
            }
            Err(Abort::Fail(e)) => {
                // 用户记录保留，其后的记录（如有）撤销
                let extra = self.memory.len().saturating_sub(start_len + 1);
                self.memory.rollback(extra)?;
                self.runner.restore_cursor(start_cursor);
                warn!(session = %self.session_id, error = %e, "turn failed");
                Err(e)
            }
        };

        if let Err(e) = self.checkpoint() {
            warn!(session = %self.session_id, error = %e, "checkpoint failed, will retry next turn");
        }
        result
    }

    async fn run_turn(
        &mut self,
        input: TurnInput,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, Abort> {
        let flow = Arc::clone(self.runner.flow());
        let TurnInput { text, mut facts } = input;

        let state = flow.state(self.runner.current_index());
        let needed: Vec<String> = state
            .get_missing_inputs(&self.memory)
            .into_iter()
            .filter(|name| !facts.contains_key(name))
            .collect();
        if !needed.is_empty() && !text.trim().is_empty() {
            let history = self.history();
            match self.planner.extract_inputs(&history, state, &needed, &text).await {
                Ok(extracted) => {
                    for (name, value) in extracted {
                        facts.entry(name).or_insert(value);
                    }
                }
                Err(e) => {
                    warn!(session = %self.session_id, error = %e, "input extraction failed, continuing without facts")
                }
            }
        }
        self.memory.append(Entry::user(text).with_facts(facts));

        let mut transitions = Vec::new();
        // 本轮已执行工具的状态下标与工具名
        let mut completed: Option<(usize, String)> = None;

        loop {
            let idx = self.runner.current_index();
            let state = flow.state(idx);

            if !state.check_completion(&self.memory) {
                self.runner.step(&self.memory)?;
                let missing = state.get_missing_inputs(&self.memory);
                let reply = self.ask_for(state, &missing).await;
                return Ok(self.outcome(TurnStatus::AwaitingInput { missing }, reply, transitions));
            }

            if state.should_call_tool(&self.memory) {
                if let Some((ran_at, tool)) = completed.take() {
                    // 每轮最多一次工具往返，下一个工具留到下一轮
                    let reply = self.reply_for(flow.state(ran_at), Some(&tool)).await;
                    return Ok(self.outcome(TurnStatus::ToolCompleted { tool }, reply, transitions));
                }
                let tool = self.call_tool(state, cancel).await?;
                completed = Some((idx, tool));
            }

            if state.terminal {
                self.runner.set_phase(StatePhase::Complete);
                let tool = completed.as_ref().map(|(_, t)| t.as_str());
                let reply = self.reply_for(state, tool).await;
                return Ok(self.outcome(TurnStatus::Finished, reply, transitions));
            }

            match self.runner.step(&self.memory)? {
                StepOutcome::Advanced(next) => transitions.push(flow.state(next).id.clone()),
                StepOutcome::Stayed | StepOutcome::Blocked => {
                    let tool = completed.map(|(_, t)| t);
                    let reply = self.reply_for(state, tool.as_deref()).await;
                    let status = match tool {
                        Some(tool) => TurnStatus::ToolCompleted { tool },
                        None => TurnStatus::Responded,
                    };
                    return Ok(self.outcome(status, reply, transitions));
                }
            }
        }
    }

    /// 调用当前状态绑定的工具；成功时追加工具记录并返回工具名
    async fn call_tool(&mut self, state: &State, cancel: &CancellationToken) -> Result<String, Abort> {
        let Some(binding) = &state.tool else {
            return Err(Abort::Fail(AgentError::UnknownTool(state.id.clone())));
        };
        let parameters = Value::Object(state.build_parameters(&self.memory));
        let token = self.next_token();
        let call = ToolCall::new(&binding.name, parameters, token);
        let default_timeout = self.settings.tool_timeout();
        let limit = self
            .runner
            .flow()
            .tools()
            .get(&binding.name)
            .map(|spec| spec.timeout_or(default_timeout))
            .unwrap_or(default_timeout);

        self.runner.set_phase(StatePhase::AwaitingTool);
        info!(
            session = %self.session_id,
            tool = %binding.name,
            token = %call.session_token,
            "invoking tool"
        );

        let invoker = Arc::clone(&self.invoker);
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            r = invoker.invoke(&call, limit) => r,
        };
        let result = match result {
            Ok(result) => result,
            Err(err @ AgentError::Validation { .. }) => {
                return Err(Abort::Clarify {
                    reason: err.to_string(),
                    reply: self.recovery_reply(&err),
                });
            }
            Err(e) => return Err(Abort::Fail(e)),
        };
        if !result.is_ok() {
            let reason = result.error.as_deref().unwrap_or("unknown error");
            return Err(Abort::Clarify {
                reason: format!("{} rejected the request: {}", binding.name, reason),
                reply: format!(
                    "I couldn't complete that: {}. Could you check the details and try again?",
                    reason
                ),
            });
        }

        let facts = state.on_tool_result(&result);
        self.memory.append(Entry::tool(call, result, facts));
        self.runner.set_phase(StatePhase::Complete);
        Ok(binding.name.clone())
    }

    async fn ask_for(&self, state: &State, missing: &[String]) -> String {
        let history = self.history();
        match self.planner.ask_for_missing(&history, state, missing).await {
            Ok(question) => question,
            Err(e) => {
                warn!(session = %self.session_id, error = %e, "question generation failed, using fallback");
                fallback_question(missing)
            }
        }
    }

    /// 状态的静态回复（可引用 `{fact}`），否则由 LLM 生成
    async fn reply_for(&self, state: &State, tool: Option<&str>) -> String {
        let facts = self.memory.facts();
        if let Some(text) = &state.response {
            return render_template(text, &facts);
        }
        let history = self.history();
        match self.planner.respond(&history, state, &facts).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(session = %self.session_id, error = %e, "reply generation failed, using fallback");
                match tool {
                    Some(tool) => format!("Done: {} completed.", tool),
                    None => "OK.".to_string(),
                }
            }
        }
    }

    fn recovery_reply(&self, err: &AgentError) -> String {
        self.recovery
            .handle(err)
            .message()
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string())
    }

    fn outcome(&self, status: TurnStatus, reply: String, transitions: Vec<String>) -> TurnOutcome {
        TurnOutcome {
            state_id: self.runner.current_id().to_string(),
            status,
            reply,
            transitions,
            missing_inputs: self.missing_inputs(),
        }
    }

    /// 撤销本轮记录（按配置删除或标记失败）
    fn discard_turn(&mut self, start_len: usize) -> Result<(), AgentError> {
        let n = self.memory.len().saturating_sub(start_len);
        match self.settings.failed_exchange {
            FailedExchangePolicy::Rollback => self.memory.rollback(n),
            FailedExchangePolicy::MarkFailed => self.memory.mark_failed(n),
        }
    }

    /// 生成会话快照
    pub fn serialize(&self) -> SessionSnapshot {
        SessionSnapshot {
            version: SNAPSHOT_VERSION,
            session_id: self.session_id.clone(),
            flow_id: self.runner.flow().id().to_string(),
            current_state_id: self.runner.current_id().to_string(),
            memory_ref: self.memory.session_id().to_string(),
            turn_count: self.turn_count,
            token_seq: self.token_seq,
        }
    }

    /// 从快照恢复；记忆日志从已挂接的存储读取
    pub fn restore(&mut self, snapshot: SessionSnapshot) -> Result<(), AgentError> {
        let store = self
            .store
            .clone()
            .ok_or_else(|| AgentError::Storage("no snapshot store attached".into()))?;
        let memory = Memory::load(store.as_ref(), &snapshot.memory_ref)?;
        self.restore_with_memory(snapshot, memory)
    }

    /// 从快照与已加载的记忆恢复；版本、流程或状态不匹配时不做任何修改
    pub fn restore_with_memory(
        &mut self,
        snapshot: SessionSnapshot,
        memory: Memory,
    ) -> Result<(), AgentError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(AgentError::Corruption(format!(
                "unsupported snapshot version {} for session {}",
                snapshot.version, snapshot.session_id
            )));
        }
        if snapshot.flow_id != self.runner.flow().id() {
            return Err(AgentError::Corruption(format!(
                "session {} belongs to flow '{}', not '{}'",
                snapshot.session_id,
                snapshot.flow_id,
                self.runner.flow().id()
            )));
        }
        if memory.session_id() != snapshot.memory_ref {
            return Err(AgentError::Corruption(format!(
                "memory '{}' does not match snapshot reference '{}'",
                memory.session_id(),
                snapshot.memory_ref
            )));
        }
        self.runner.seek(&snapshot.current_state_id)?;
        self.session_id = snapshot.session_id;
        self.memory = memory;
        self.turn_count = snapshot.turn_count;
        self.token_seq = snapshot.token_seq;
        info!(
            session = %self.session_id,
            state = %self.runner.current_id(),
            entries = self.memory.len(),
            "session restored"
        );
        Ok(())
    }

    /// 持久化记忆与快照；未挂接存储时为空操作
    pub fn checkpoint(&mut self) -> Result<(), AgentError> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        self.memory.persist(store.as_ref())?;
        store.save_snapshot(&self.serialize())
    }

    /// 结束会话：最后一次 checkpoint 后归档
    pub fn archive(&mut self) -> Result<(), AgentError> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        self.checkpoint()?;
        store.archive(&self.session_id)
    }
}

/// 把 `{name}` 替换为事实值（字符串不带引号）
fn render_template(text: &str, facts: &BTreeMap<String, Value>) -> String {
    let mut out = text.to_string();
    for (name, value) in facts {
        let placeholder = format!("{{{}}}", name);
        if out.contains(&placeholder) {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out = out.replace(&placeholder, &rendered);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_template() {
        let facts = BTreeMap::from([
            ("summary".to_string(), json!("standup")),
            ("attendees".to_string(), json!(3)),
        ]);
        assert_eq!(
            render_template("Booked {summary} for {attendees} people ({room})", &facts),
            "Booked standup for 3 people ({room})"
        );
    }
}
