//! 状态推进器
//!
//! 每个会话一个游标。step 在当前状态不完整时返回 Blocked；否则按声明顺序求值转移，
//! 第一个成立的条件胜出；都不成立则停留（隐式自环，结束本轮）。
//! 单轮推进次数受 max_self_transitions 约束，超过即 LoopDetected。

use std::sync::Arc;

use tracing::debug;

use crate::core::AgentError;
use crate::flow::graph::Flow;
use crate::flow::state::{State, StatePhase};
use crate::memory::Memory;

pub const DEFAULT_MAX_SELF_TRANSITIONS: usize = 5;

/// 单次 step 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// 当前状态缺输入
    Blocked,
    /// 显式转移（含指向自身的转移）
    Advanced(usize),
    /// 无转移成立
    Stayed,
}

/// 游标快照，用于一轮失败后恢复
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub state: usize,
    pub phase: StatePhase,
}

#[derive(Debug, Clone)]
pub struct StateRunner {
    flow: Arc<Flow>,
    current: usize,
    phase: StatePhase,
    max_transitions: usize,
    advances: usize,
}

impl StateRunner {
    pub fn new(flow: Arc<Flow>) -> Self {
        let current = flow.initial();
        Self {
            flow,
            current,
            phase: StatePhase::CollectingInputs,
            max_transitions: DEFAULT_MAX_SELF_TRANSITIONS,
            advances: 0,
        }
    }

    pub fn with_max_transitions(mut self, max: usize) -> Self {
        self.max_transitions = max;
        self
    }

    pub fn flow(&self) -> &Arc<Flow> {
        &self.flow
    }

    pub fn current(&self) -> &State {
        self.flow.state(self.current)
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current_id(&self) -> &str {
        &self.current().id
    }

    pub fn phase(&self) -> StatePhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: StatePhase) {
        self.phase = phase;
    }

    pub fn max_transitions(&self) -> usize {
        self.max_transitions
    }

    /// 本轮已推进次数
    pub fn advances(&self) -> usize {
        self.advances
    }

    /// 新一轮开始：重置推进计数
    pub fn begin_turn(&mut self) {
        self.advances = 0;
    }

    pub fn cursor(&self) -> Cursor {
        Cursor {
            state: self.current,
            phase: self.phase,
        }
    }

    pub fn restore_cursor(&mut self, cursor: Cursor) {
        self.current = cursor.state;
        self.phase = cursor.phase;
    }

    /// 直接定位到某状态（快照恢复）
    pub fn seek(&mut self, state_id: &str) -> Result<(), AgentError> {
        let idx = self.flow.index_of(state_id).ok_or_else(|| {
            AgentError::Corruption(format!(
                "state '{}' does not exist in flow '{}'",
                state_id,
                self.flow.id()
            ))
        })?;
        self.current = idx;
        self.phase = StatePhase::CollectingInputs;
        Ok(())
    }

    pub fn step(&mut self, memory: &Memory) -> Result<StepOutcome, AgentError> {
        let state = self.flow.state(self.current);
        if !state.check_completion(memory) {
            self.phase = StatePhase::Blocked;
            return Ok(StepOutcome::Blocked);
        }

        let next = state
            .transitions
            .iter()
            .find(|t| t.condition.evaluate(memory))
            .map(|t| t.target);

        let Some(next) = next else {
            self.phase = StatePhase::Complete;
            return Ok(StepOutcome::Stayed);
        };

        if self.advances >= self.max_transitions {
            return Err(AgentError::LoopDetected {
                state: state.id.clone(),
                limit: self.max_transitions,
            });
        }
        self.advances += 1;
        debug!(
            from = %state.id,
            to = %self.flow.state(next).id,
            advances = self.advances,
            "state transition"
        );
        self.current = next;
        self.phase = StatePhase::CollectingInputs;
        Ok(StepOutcome::Advanced(next))
    }
}
