//! 单轮输入与结果

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 一轮用户输入；调用方可直接给出结构化事实（跳过 LLM 抽取）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnInput {
    pub text: String,
    #[serde(default)]
    pub facts: BTreeMap<String, Value>,
}

impl TurnInput {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            facts: BTreeMap::new(),
        }
    }

    pub fn with_fact(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.facts.insert(name.into(), value.into());
        self
    }
}

impl From<&str> for TurnInput {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for TurnInput {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

/// 本轮如何结束
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnStatus {
    /// 当前状态缺输入，已向用户提问
    AwaitingInput { missing: Vec<String> },
    /// 工具调用成功
    ToolCompleted { tool: String },
    /// 普通对话回复
    Responded,
    /// 到达终止状态
    Finished,
    /// 工具拒绝或返回格式错误：本轮已回滚，请用户澄清
    ClarificationNeeded { reason: String },
    /// 单轮推进超过上限：本轮已回滚
    LoopAborted { limit: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnOutcome {
    /// 本轮结束时所在状态
    pub state_id: String,
    pub status: TurnStatus,
    pub reply: String,
    /// 本轮依次进入的状态
    pub transitions: Vec<String>,
    /// 当前状态仍缺的输入
    pub missing_inputs: Vec<String>,
}

impl TurnOutcome {
    /// 本轮被回滚，用户可以下一轮重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.status,
            TurnStatus::ClarificationNeeded { .. } | TurnStatus::LoopAborted { .. }
        )
    }

    pub fn is_finished(&self) -> bool {
        self.status == TurnStatus::Finished
    }
}
