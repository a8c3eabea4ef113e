//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定 RollbackAndClarify / RetryNextTurn / Abort。

use thiserror::Error;

use crate::flow::FlowError;

/// Agent 运行过程中可能出现的错误（校验、传输、工具不可用、状态循环、存储、快照损坏等）
#[derive(Error, Debug)]
pub enum AgentError {
    /// 工具请求或响应不符合声明的 schema
    #[error("Validation error ({tool}): {reason}")]
    Validation { tool: String, reason: String },

    /// 网络或超时，未能到达工具
    #[error("Transport error ({tool}): {reason}")]
    Transport { tool: String, reason: String },

    /// 幂等工具重试耗尽，或非幂等工具首次即失败
    #[error("Tool unavailable: {tool} after {attempts} attempt(s): {reason}")]
    ToolUnavailable {
        tool: String,
        attempts: u32,
        reason: String,
    },

    /// 单轮内状态推进次数超过 max_self_transitions
    #[error("Loop detected at state '{state}': more than {limit} transitions in one turn")]
    LoopDetected { state: String, limit: usize },

    #[error("Storage error: {0}")]
    Storage(String),

    /// 快照或记忆日志无法反序列化 / 不存在
    #[error("Corruption error: {0}")]
    Corruption(String),

    /// rollback / mark_failed 请求的条数超过现有记录
    #[error("Invalid rollback: {requested} entries requested, {available} available")]
    Rollback { requested: usize, available: usize },

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error("LLM error: {0}")]
    LlmError(String),

    /// 会话正在处理上一轮（工具调用挂起中），拒绝并发 step
    #[error("Session busy: {0}")]
    Busy(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Turn cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl AgentError {
    pub fn validation(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    pub fn transport(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transport {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// 下一轮可重试（不影响会话本身）的错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Transport { .. }
                | AgentError::ToolUnavailable { .. }
                | AgentError::LoopDetected { .. }
                | AgentError::Storage(_)
                | AgentError::LlmError(_)
                | AgentError::Busy(_)
                | AgentError::Cancelled
        )
    }

    /// 对该会话致命：需要新建会话
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, AgentError::Corruption(_))
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 回滚触发本轮的记录，并请用户澄清（如工具返回格式错误）
    RollbackAndClarify(String),
    /// 保留用户消息，提示调用方下一轮重试（如工具不可用）
    RetryNextTurn(String),
    /// 终止（如快照损坏，需新建会话）
    Abort,
}

impl RecoveryAction {
    /// 面向用户的提示；Abort 没有
    pub fn message(&self) -> Option<&str> {
        match self {
            RecoveryAction::RollbackAndClarify(msg) | RecoveryAction::RetryNextTurn(msg) => Some(msg),
            RecoveryAction::Abort => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(AgentError::transport("create_event", "timeout").is_retryable());
        assert!(AgentError::LoopDetected {
            state: "retry".into(),
            limit: 5
        }
        .is_retryable());
        assert!(!AgentError::validation("create_event", "missing field").is_retryable());
        assert!(!AgentError::Corruption("bad json".into()).is_retryable());
        assert!(AgentError::Corruption("bad json".into()).is_fatal_to_session());
    }

    #[test]
    fn test_display_includes_tool() {
        let err = AgentError::ToolUnavailable {
            tool: "list_events".into(),
            attempts: 3,
            reason: "connection refused".into(),
        };
        let s = err.to_string();
        assert!(s.contains("list_events"));
        assert!(s.contains("3 attempt"));
    }
}
