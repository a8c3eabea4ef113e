//! 会话持久化
//!
//! SnapshotStore 是持久化契约：保存 / 读取会话快照与记忆日志、归档、列出会话。
//! 读取时记录缺失或无法反序列化返回 Corruption；写入失败返回 Storage。
//! 提供 JSON 文件实现（FileStore）与内存实现（InMemoryStore，测试用）。

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::AgentError;
use crate::memory::{MemoryLog, SessionSnapshot};

pub trait SnapshotStore: Send + Sync {
    fn save_snapshot(&self, snapshot: &SessionSnapshot) -> Result<(), AgentError>;
    fn load_snapshot(&self, session_id: &str) -> Result<SessionSnapshot, AgentError>;
    fn save_memory(&self, log: &MemoryLog) -> Result<(), AgentError>;
    fn load_memory(&self, memory_ref: &str) -> Result<MemoryLog, AgentError>;
    /// 会话结束：移出活动集合，记录保留供审计
    fn archive(&self, session_id: &str) -> Result<(), AgentError>;
    /// 活动会话 id（排序）
    fn list_sessions(&self) -> Result<Vec<String>, AgentError>;
}

/// JSON 文件存储
///
/// 目录结构：`sessions/{id}.json`、`memory/{id}.json`、`archive/`。
/// 写入先落临时文件再 rename，避免留下半截记录。
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, AgentError> {
        let root = root.as_ref().to_path_buf();
        for dir in ["sessions", "memory", "archive"] {
            std::fs::create_dir_all(root.join(dir)).map_err(|e| {
                AgentError::Storage(format!("create {}: {}", root.join(dir).display(), e))
            })?;
        }
        Ok(Self { root })
    }

    fn snapshot_path(&self, session_id: &str) -> PathBuf {
        self.root.join("sessions").join(format!("{}.json", session_id))
    }

    fn memory_path(&self, memory_ref: &str) -> PathBuf {
        self.root.join("memory").join(format!("{}.json", memory_ref))
    }

    fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), AgentError> {
        let data = serde_json::to_string_pretty(value)
            .map_err(|e| AgentError::Storage(format!("serialize {}: {}", path.display(), e)))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data)
            .and_then(|_| std::fs::rename(&tmp, path))
            .map_err(|e| AgentError::Storage(format!("write {}: {}", path.display(), e)))
    }

    fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, AgentError> {
        let data = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => AgentError::Corruption(format!("{} not found", path.display())),
            _ => AgentError::Storage(format!("read {}: {}", path.display(), e)),
        })?;
        serde_json::from_str(&data)
            .map_err(|e| AgentError::Corruption(format!("{}: {}", path.display(), e)))
    }
}

impl SnapshotStore for FileStore {
    fn save_snapshot(&self, snapshot: &SessionSnapshot) -> Result<(), AgentError> {
        Self::write_json(&self.snapshot_path(&snapshot.session_id), snapshot)
    }

    fn load_snapshot(&self, session_id: &str) -> Result<SessionSnapshot, AgentError> {
        Self::read_json(&self.snapshot_path(session_id))
    }

    fn save_memory(&self, log: &MemoryLog) -> Result<(), AgentError> {
        Self::write_json(&self.memory_path(&log.session_id), log)
    }

    fn load_memory(&self, memory_ref: &str) -> Result<MemoryLog, AgentError> {
        Self::read_json(&self.memory_path(memory_ref))
    }

    fn archive(&self, session_id: &str) -> Result<(), AgentError> {
        let archive = self.root.join("archive");
        for (kind, path) in [
            ("session", self.snapshot_path(session_id)),
            ("memory", self.memory_path(session_id)),
        ] {
            if !path.exists() {
                continue;
            }
            let dest = archive.join(format!("{}.{}.json", session_id, kind));
            std::fs::rename(&path, &dest)
                .map_err(|e| AgentError::Storage(format!("archive {}: {}", path.display(), e)))?;
        }
        Ok(())
    }

    fn list_sessions(&self) -> Result<Vec<String>, AgentError> {
        let dir = self.root.join("sessions");
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| AgentError::Storage(format!("list {}: {}", dir.display(), e)))?;
        let mut ids: Vec<String> = entries
            .filter_map(Result::ok)
            .filter_map(|e| {
                let path = e.path();
                match path.extension().and_then(|x| x.to_str()) {
                    Some("json") => path.file_stem().and_then(|s| s.to_str()).map(str::to_string),
                    _ => None,
                }
            })
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// 内存存储；`fail_writes` 可模拟存储故障
#[derive(Debug, Default)]
pub struct InMemoryStore {
    snapshots: Mutex<HashMap<String, SessionSnapshot>>,
    memories: Mutex<HashMap<String, MemoryLog>>,
    archived: Mutex<Vec<String>>,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn archived(&self) -> Vec<String> {
        self.archived.lock().map(|a| a.clone()).unwrap_or_default()
    }

    fn check_writable(&self) -> Result<(), AgentError> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(AgentError::Storage("store is unavailable".into()));
        }
        Ok(())
    }
}

fn poisoned(_: impl std::fmt::Display) -> AgentError {
    AgentError::Storage("store lock poisoned".into())
}

impl SnapshotStore for InMemoryStore {
    fn save_snapshot(&self, snapshot: &SessionSnapshot) -> Result<(), AgentError> {
        self.check_writable()?;
        self.snapshots
            .lock()
            .map_err(poisoned)?
            .insert(snapshot.session_id.clone(), snapshot.clone());
        Ok(())
    }

    fn load_snapshot(&self, session_id: &str) -> Result<SessionSnapshot, AgentError> {
        self.snapshots
            .lock()
            .map_err(poisoned)?
            .get(session_id)
            .cloned()
            .ok_or_else(|| AgentError::Corruption(format!("no snapshot for session {}", session_id)))
    }

    fn save_memory(&self, log: &MemoryLog) -> Result<(), AgentError> {
        self.check_writable()?;
        self.memories
            .lock()
            .map_err(poisoned)?
            .insert(log.session_id.clone(), log.clone());
        Ok(())
    }

    fn load_memory(&self, memory_ref: &str) -> Result<MemoryLog, AgentError> {
        self.memories
            .lock()
            .map_err(poisoned)?
            .get(memory_ref)
            .cloned()
            .ok_or_else(|| AgentError::Corruption(format!("no memory log '{}'", memory_ref)))
    }

    fn archive(&self, session_id: &str) -> Result<(), AgentError> {
        self.check_writable()?;
        self.snapshots.lock().map_err(poisoned)?.remove(session_id);
        self.memories.lock().map_err(poisoned)?.remove(session_id);
        self.archived
            .lock()
            .map_err(poisoned)?
            .push(session_id.to_string());
        Ok(())
    }

    fn list_sessions(&self) -> Result<Vec<String>, AgentError> {
        let mut ids: Vec<String> = self.snapshots.lock().map_err(poisoned)?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
