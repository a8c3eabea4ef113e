//! 会话记忆：只追加的对话 / 工具往返记录
//!
//! 每个 Entry 带严格递增的 sequence_no；只有 rollback 能缩短日志（撤销失败的一次工具往返）。
//! 状态所需的输入从 Entry.facts 解析：越新的（且未标记失败的）记录优先。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;
use crate::memory::{MemoryLog, SnapshotStore, MEMORY_LOG_VERSION};
use crate::tools::{ToolCall, ToolResult};

/// 消息角色（与 LLM API 一致，另加 Tool 表示工具往返）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// 发给 LLM 的单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 记忆中的一条记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// 由 Memory::append 分配
    pub sequence_no: u64,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResult>,
    /// 具名事实（用户输入中抽取的槽位值，或工具结果映射出的值）
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub facts: BTreeMap<String, Value>,
    /// 审计模式下失败的往返不删除，只标记；解析事实与构建 prompt 时跳过
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
    /// Unix 毫秒
    pub timestamp: i64,
}

impl Entry {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            sequence_no: 0,
            role,
            content: content.into(),
            tool_call: None,
            tool_result: None,
            facts: BTreeMap::new(),
            failed: false,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// 一次已确认的工具往返（请求 + 结果 + 映射出的事实）
    pub fn tool(call: ToolCall, result: ToolResult, facts: BTreeMap<String, Value>) -> Self {
        let content = match (&result.payload, &result.error) {
            (Some(payload), _) => payload.to_string(),
            (None, Some(error)) => error.clone(),
            (None, None) => String::new(),
        };
        Self {
            tool_call: Some(call),
            tool_result: Some(result),
            facts,
            ..Self::new(Role::Tool, content)
        }
    }

    pub fn with_facts(mut self, facts: BTreeMap<String, Value>) -> Self {
        self.facts.extend(facts);
        self
    }

    pub fn with_fact(mut self, name: impl Into<String>, value: Value) -> Self {
        self.facts.insert(name.into(), value);
        self
    }

    /// 渲染为 LLM 消息；工具往返以 system 消息呈现
    pub fn to_message(&self) -> Message {
        match self.role {
            Role::Tool => {
                let tool = self
                    .tool_call
                    .as_ref()
                    .map(|c| c.tool_name.as_str())
                    .unwrap_or("tool");
                Message::system(format!("Tool '{}' returned: {}", tool, self.content))
            }
            role => Message {
                role,
                content: self.content.clone(),
            },
        }
    }
}

/// 单会话记忆：有序、只追加
#[derive(Clone, Debug)]
pub struct Memory {
    session_id: String,
    entries: Vec<Entry>,
    /// 已分配的最后一个 sequence_no
    last_seq: u64,
    /// 自上次成功 persist 后是否有改动
    dirty: bool,
}

impl Memory {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            entries: Vec::new(),
            last_seq: 0,
            dirty: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// 追加一条记录，返回其 sequence_no（严格递增，从 1 开始；回滚掉的序号不复用）
    pub fn append(&mut self, mut entry: Entry) -> u64 {
        self.last_seq += 1;
        let seq = self.last_seq;
        entry.sequence_no = seq;
        self.entries.push(entry);
        self.dirty = true;
        seq
    }

    /// 最近 window 条记录（None 表示全部），保持顺序
    pub fn context(&self, window: Option<usize>) -> &[Entry] {
        match window {
            Some(w) => &self.entries[self.entries.len().saturating_sub(w)..],
            None => &self.entries,
        }
    }

    /// 删除最后 n 条；n 超过长度时不做任何修改
    pub fn rollback(&mut self, n: usize) -> Result<(), AgentError> {
        if n > self.entries.len() {
            return Err(AgentError::Rollback {
                requested: n,
                available: self.entries.len(),
            });
        }
        if n == 0 {
            return Ok(());
        }
        self.entries.truncate(self.entries.len() - n);
        self.dirty = true;
        Ok(())
    }

    /// 把最后 n 条标记为失败（保留审计痕迹）；n 超过长度时不做任何修改
    pub fn mark_failed(&mut self, n: usize) -> Result<(), AgentError> {
        if n > self.entries.len() {
            return Err(AgentError::Rollback {
                requested: n,
                available: self.entries.len(),
            });
        }
        let start = self.entries.len() - n;
        for entry in &mut self.entries[start..] {
            entry.failed = true;
        }
        if n > 0 {
            self.dirty = true;
        }
        Ok(())
    }

    /// 解析具名事实：最新的未失败记录优先
    pub fn resolve(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .rev()
            .filter(|e| !e.failed)
            .find_map(|e| e.facts.get(name))
            .filter(|v| !v.is_null())
    }

    pub fn has(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    /// 当前可见的所有事实（同名取最新）
    pub fn facts(&self) -> BTreeMap<String, Value> {
        let mut facts = BTreeMap::new();
        for entry in self.entries.iter().filter(|e| !e.failed) {
            for (k, v) in &entry.facts {
                if !v.is_null() {
                    facts.insert(k.clone(), v.clone());
                }
            }
        }
        facts
    }

    /// 最近 window 条未失败记录渲染为 LLM 消息
    pub fn to_messages(&self, window: Option<usize>) -> Vec<Message> {
        self.context(window)
            .iter()
            .filter(|e| !e.failed)
            .map(Entry::to_message)
            .collect()
    }

    pub fn to_log(&self) -> MemoryLog {
        MemoryLog {
            version: MEMORY_LOG_VERSION,
            session_id: self.session_id.clone(),
            last_seq: self.last_seq,
            entries: self.entries.clone(),
        }
    }

    /// 从持久化日志重建；sequence_no 必须严格递增
    pub fn from_log(log: MemoryLog) -> Result<Self, AgentError> {
        if log.version != MEMORY_LOG_VERSION {
            return Err(AgentError::Corruption(format!(
                "unsupported memory log version {} for session {}",
                log.version, log.session_id
            )));
        }
        let ordered = log
            .entries
            .windows(2)
            .all(|w| w[0].sequence_no < w[1].sequence_no);
        if !ordered {
            return Err(AgentError::Corruption(format!(
                "memory log for session {} is not strictly ordered",
                log.session_id
            )));
        }
        let last_seq = log
            .entries
            .last()
            .map_or(log.last_seq, |e| e.sequence_no.max(log.last_seq));
        Ok(Self {
            session_id: log.session_id,
            entries: log.entries,
            last_seq,
            dirty: false,
        })
    }

    /// 写入持久化存储；失败时保持 dirty，下一个 checkpoint 重试
    pub fn persist(&mut self, store: &dyn SnapshotStore) -> Result<(), AgentError> {
        if !self.dirty {
            return Ok(());
        }
        store.save_memory(&self.to_log())?;
        self.dirty = false;
        Ok(())
    }

    /// 从持久化存储加载；缺失或损坏返回 Corruption
    pub fn load(store: &dyn SnapshotStore, session_id: &str) -> Result<Self, AgentError> {
        let log = store.load_memory(session_id)?;
        if log.session_id != session_id {
            return Err(AgentError::Corruption(format!(
                "memory log belongs to session {}, expected {}",
                log.session_id, session_id
            )));
        }
        Self::from_log(log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use serde_json::json;

    #[test]
    fn test_append_assigns_increasing_sequence() {
        let mut mem = Memory::new("s1");
        assert_eq!(mem.append(Entry::user("hi")), 1);
        assert_eq!(mem.append(Entry::user("there")), 2);
        assert_eq!(mem.context(None)[1].sequence_no, 2);
    }

    #[test]
    fn test_context_window_keeps_order() {
        let mut mem = Memory::new("s1");
        for i in 0..5 {
            mem.append(Entry::user(format!("m{i}")));
        }
        let recent: Vec<_> = mem.context(Some(2)).iter().map(|e| e.content.as_str()).collect();
        assert_eq!(recent, vec!["m3", "m4"]);
        assert_eq!(mem.context(Some(50)).len(), 5);
    }

    #[test]
    fn test_rollback_is_all_or_nothing() {
        let mut mem = Memory::new("s1");
        mem.append(Entry::user("a"));
        mem.append(Entry::user("b"));

        assert!(mem.rollback(3).is_err());
        assert_eq!(mem.len(), 2);

        mem.rollback(1).unwrap();
        assert_eq!(mem.len(), 1);
    }

    #[test]
    fn test_sequence_not_reused_after_rollback() {
        let store = InMemoryStore::new();
        let mut mem = Memory::new("s1");
        mem.append(Entry::user("a"));
        mem.append(Entry::user("b"));
        mem.rollback(1).unwrap();
        assert_eq!(mem.append(Entry::user("c")), 3);

        mem.rollback(1).unwrap();
        mem.persist(&store).unwrap();
        let mut loaded = Memory::load(&store, "s1").unwrap();
        assert_eq!(loaded.append(Entry::user("d")), 4);
    }

    #[test]
    fn test_resolve_prefers_latest_non_failed() {
        let mut mem = Memory::new("s1");
        mem.append(Entry::user("summary is standup").with_fact("summary", json!("standup")));
        mem.append(Entry::user("actually retro").with_fact("summary", json!("retro")));
        assert_eq!(mem.resolve("summary"), Some(&json!("retro")));

        mem.mark_failed(1).unwrap();
        assert_eq!(mem.resolve("summary"), Some(&json!("standup")));
        assert_eq!(mem.len(), 2);
    }

    #[test]
    fn test_null_fact_does_not_resolve() {
        let mut mem = Memory::new("s1");
        mem.append(Entry::user("no start").with_fact("start", Value::Null));
        assert!(!mem.has("start"));
    }

    #[test]
    fn test_persist_and_load() {
        let store = InMemoryStore::new();
        let mut mem = Memory::new("s1");
        mem.append(Entry::user("book it").with_fact("summary", json!("standup")));
        assert!(mem.is_dirty());
        mem.persist(&store).unwrap();
        assert!(!mem.is_dirty());

        let loaded = Memory::load(&store, "s1").unwrap();
        assert_eq!(loaded.context(None), mem.context(None));
    }

    #[test]
    fn test_load_missing_is_corruption() {
        let store = InMemoryStore::new();
        assert!(matches!(
            Memory::load(&store, "nope"),
            Err(AgentError::Corruption(_))
        ));
    }

    #[test]
    fn test_from_log_rejects_unordered_entries() {
        let mut a = Entry::user("a");
        a.sequence_no = 2;
        let mut b = Entry::user("b");
        b.sequence_no = 1;
        let log = MemoryLog {
            version: MEMORY_LOG_VERSION,
            session_id: "s1".into(),
            last_seq: 2,
            entries: vec![a, b],
        };
        assert!(matches!(Memory::from_log(log), Err(AgentError::Corruption(_))));
    }
}
