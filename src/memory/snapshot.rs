//! 持久化记录
//!
//! 每个会话两份记录：会话快照（游标位置、轮次、令牌序号）与记忆日志（全部 Entry）。
//! 两者都带版本号，读取时不匹配即视为损坏。

use serde::{Deserialize, Serialize};

use crate::memory::Entry;

pub const SNAPSHOT_VERSION: u32 = 1;
pub const MEMORY_LOG_VERSION: u32 = 1;

/// 会话快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub version: u32,
    pub session_id: String,
    pub flow_id: String,
    pub current_state_id: String,
    /// 记忆日志在存储中的键
    pub memory_ref: String,
    #[serde(default)]
    pub turn_count: u64,
    /// 已分配的最后一个工具令牌序号
    #[serde(default)]
    pub token_seq: u64,
}

/// 记忆日志
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryLog {
    pub version: u32,
    pub session_id: String,
    /// 已分配的最后一个 sequence_no（rollback 不回退）
    #[serde(default)]
    pub last_seq: u64,
    pub entries: Vec<Entry>,
}
