//! 工具调用重试：指数退避 + 抖动
//!
//! 只有 Transport 错误会重试；耗尽后转为 ToolUnavailable（记录尝试次数）。
//! 非幂等工具使用 `RetryPolicy::once()`，首次传输失败即 ToolUnavailable。

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

use crate::core::AgentError;

/// 重试策略
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 最大尝试次数（含首次）
    pub max_attempts: u32,
    #[serde(rename = "initial_backoff_ms", deserialize_with = "millis::deserialize")]
    pub initial_backoff: Duration,
    #[serde(rename = "max_backoff_ms", deserialize_with = "millis::deserialize")]
    pub max_backoff: Duration,
    pub multiplier: f64,
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// 只尝试一次
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// 第 attempt 次失败后的等待时间（attempt 从 1 开始），抖动范围 75%–125%
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let base = (self.initial_backoff.as_secs_f64() * exp).min(self.max_backoff.as_secs_f64());
        let jitter = rand::rng().random_range(0.75..=1.25);
        Duration::from_secs_f64(base * jitter)
    }

    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, AgentError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(AgentError::Transport { tool, reason }) => {
                    if attempt >= max_attempts {
                        return Err(AgentError::ToolUnavailable {
                            tool,
                            attempts: attempt,
                            reason,
                        });
                    }
                    let delay = self.backoff_for(attempt);
                    tracing::warn!(
                        tool = %tool,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "Retrying tool call after transport error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_is_capped_and_jittered() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(400),
            multiplier: 2.0,
        };
        let first = policy.backoff_for(1);
        assert!(first >= Duration::from_millis(75) && first <= Duration::from_millis(125));
        let late = policy.backoff_for(8);
        assert!(late <= Duration::from_millis(500));
        assert!(late >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_transport_errors_exhaust_to_unavailable() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result: Result<(), _> = fast()
            .execute(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(AgentError::transport("list_events", "timeout")) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(
            result,
            Err(AgentError::ToolUnavailable { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let result = fast()
            .execute(|attempt| async move {
                if attempt < 2 {
                    Err(AgentError::transport("list_events", "reset"))
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_validation_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result: Result<(), _> = fast()
            .execute(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(AgentError::validation("list_events", "bad")) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(AgentError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_once_fails_immediately() {
        let result: Result<(), _> = RetryPolicy::once()
            .execute(|_| async { Err(AgentError::transport("create_event", "refused")) })
            .await;
        assert!(matches!(
            result,
            Err(AgentError::ToolUnavailable { attempts: 1, .. })
        ));
    }
}
