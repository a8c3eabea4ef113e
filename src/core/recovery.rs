//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供 Agent::step 决定是回滚澄清、下一轮重试还是终止。

use crate::core::{AgentError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作（回滚并澄清 / 下一轮重试 / 终止）
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::Validation { tool, .. } => RecoveryAction::RollbackAndClarify(format!(
                "The '{tool}' tool returned a malformed response. Could you rephrase or confirm the details?"
            )),
            AgentError::LoopDetected { state, .. } => RecoveryAction::RollbackAndClarify(format!(
                "I got stuck while processing step '{state}'. Could you clarify what you would like to do?"
            )),
            AgentError::Transport { tool, .. } | AgentError::ToolUnavailable { tool, .. } => {
                RecoveryAction::RetryNextTurn(format!(
                    "The '{tool}' service is not reachable right now. Please try again in a moment."
                ))
            }
            AgentError::Busy(_) => RecoveryAction::RetryNextTurn(
                "Still working on your previous message.".to_string(),
            ),
            AgentError::Storage(_) | AgentError::LlmError(_) | AgentError::Cancelled => {
                RecoveryAction::RetryNextTurn("Something went wrong, please try again.".to_string())
            }
            _ => RecoveryAction::Abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_validation_rolls_back() {
        let engine = RecoveryEngine::new();
        let err = AgentError::validation("create_event", "missing field 'id'");
        match engine.handle(&err) {
            RecoveryAction::RollbackAndClarify(msg) => assert!(msg.contains("create_event")),
            other => panic!("Expected RollbackAndClarify, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_loop_detected_rolls_back() {
        let engine = RecoveryEngine::new();
        let err = AgentError::LoopDetected {
            state: "verify".into(),
            limit: 5,
        };
        assert!(matches!(
            engine.handle(&err),
            RecoveryAction::RollbackAndClarify(_)
        ));
    }

    #[test]
    fn test_recovery_tool_unavailable_retries_next_turn() {
        let engine = RecoveryEngine::new();
        let err = AgentError::ToolUnavailable {
            tool: "list_events".into(),
            attempts: 3,
            reason: "timeout".into(),
        };
        assert!(matches!(engine.handle(&err), RecoveryAction::RetryNextTurn(_)));
    }

    #[test]
    fn test_recovery_corruption_aborts() {
        let engine = RecoveryEngine::new();
        let err = AgentError::Corruption("truncated snapshot".into());
        assert_eq!(engine.handle(&err), RecoveryAction::Abort);
    }
}
