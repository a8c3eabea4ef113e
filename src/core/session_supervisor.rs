//! 会话监管：单会话串行、忙碌拒绝、中断管理
//!
//! 每个会话同一时刻只允许一个 Agent::step；进行中的一轮持有 TurnGuard，
//! 期间再次进入返回 AgentError::Busy。cancel() 取消当前轮（挂起的工具调用随之放弃）。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::core::AgentError;

/// 会话级生命周期管理：忙碌标记与当前轮的取消令牌
#[derive(Debug)]
pub struct SessionSupervisor {
    session_id: String,
    busy: Arc<AtomicBool>,
    /// 当前轮的取消令牌；空闲时为 None
    current: Arc<Mutex<Option<CancellationToken>>>,
}

impl SessionSupervisor {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            busy: Arc::new(AtomicBool::new(false)),
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// 开始一轮；会话忙碌时立即返回 Busy，不排队
    pub fn try_begin_turn(&self) -> Result<TurnGuard, AgentError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AgentError::Busy(self.session_id.clone()));
        }
        let token = CancellationToken::new();
        if let Ok(mut slot) = self.current.lock() {
            *slot = Some(token.clone());
        }
        Ok(TurnGuard {
            busy: Arc::clone(&self.busy),
            current: Arc::clone(&self.current),
            token,
        })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// 取消当前轮（如客户端断开）；空闲时无效果
    pub fn cancel(&self) -> bool {
        match self.current.lock() {
            Ok(slot) => match slot.as_ref() {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }
}

/// 一轮进行中的凭证；Drop 时释放忙碌标记
#[derive(Debug)]
pub struct TurnGuard {
    busy: Arc<AtomicBool>,
    current: Arc<Mutex<Option<CancellationToken>>>,
    token: CancellationToken,
}

impl TurnGuard {
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.current.lock() {
            *slot = None;
        }
        self.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_turn_is_rejected_while_busy() {
        let supervisor = SessionSupervisor::new("session_a");
        let guard = supervisor.try_begin_turn().unwrap();
        assert!(supervisor.is_busy());
        assert!(matches!(
            supervisor.try_begin_turn(),
            Err(AgentError::Busy(id)) if id == "session_a"
        ));
        drop(guard);
        assert!(!supervisor.is_busy());
        assert!(supervisor.try_begin_turn().is_ok());
    }

    #[test]
    fn test_cancel_reaches_current_turn_only() {
        let supervisor = SessionSupervisor::new("session_a");
        assert!(!supervisor.cancel());

        let guard = supervisor.try_begin_turn().unwrap();
        let token = guard.cancel_token();
        assert!(supervisor.cancel());
        assert!(token.is_cancelled());
        drop(guard);

        let next = supervisor.try_begin_turn().unwrap();
        assert!(!next.cancel_token().is_cancelled());
    }
}
