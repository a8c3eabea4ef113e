//! SQLite 持久化（rusqlite，同步）
//!
//! 表结构：
//! - sessions：会话快照（archived 标记归档）
//! - entries：记忆日志逐条存储，(memory_ref, seq) 为主键
//! - memory_logs：每个记忆日志已分配的最后一个 seq
//!
//! 保存记忆日志时在一个事务中整体替换，rollback 后的日志也能如实写回。

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::core::AgentError;
use crate::memory::{Entry, MemoryLog, SessionSnapshot, MEMORY_LOG_VERSION};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn storage(e: impl std::fmt::Display) -> AgentError {
    AgentError::Storage(e.to_string())
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let conn = Connection::open(path).map_err(storage)?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, AgentError> {
        let conn = Connection::open_in_memory().map_err(storage)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, AgentError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                flow_id TEXT NOT NULL,
                snapshot TEXT NOT NULL,
                archived INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS entries (
                memory_ref TEXT NOT NULL,
                seq INTEGER NOT NULL,
                entry TEXT NOT NULL,
                PRIMARY KEY (memory_ref, seq)
            );
            CREATE TABLE IF NOT EXISTS memory_logs (
                memory_ref TEXT PRIMARY KEY,
                last_seq INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_entries_ref ON entries(memory_ref);",
        )
        .map_err(storage)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, AgentError> {
        self.conn
            .lock()
            .map_err(|_| AgentError::Storage("sqlite connection lock poisoned".into()))
    }
}

impl crate::memory::SnapshotStore for SqliteStore {
    fn save_snapshot(&self, snapshot: &SessionSnapshot) -> Result<(), AgentError> {
        let data = serde_json::to_string(snapshot).map_err(storage)?;
        let now = chrono::Utc::now().to_rfc3339();
        self.conn()?
            .execute(
                "INSERT INTO sessions (id, flow_id, snapshot, archived, updated_at)
                 VALUES (?1, ?2, ?3, 0, ?4)
                 ON CONFLICT(id) DO UPDATE SET flow_id = ?2, snapshot = ?3, updated_at = ?4",
                params![snapshot.session_id, snapshot.flow_id, data, now],
            )
            .map_err(storage)?;
        Ok(())
    }

    fn load_snapshot(&self, session_id: &str) -> Result<SessionSnapshot, AgentError> {
        let data: Option<String> = self
            .conn()?
            .query_row(
                "SELECT snapshot FROM sessions WHERE id = ?1 AND archived = 0",
                params![session_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage)?;
        let data = data.ok_or_else(|| {
            AgentError::Corruption(format!("no snapshot for session {}", session_id))
        })?;
        serde_json::from_str(&data)
            .map_err(|e| AgentError::Corruption(format!("snapshot {}: {}", session_id, e)))
    }

    fn save_memory(&self, log: &MemoryLog) -> Result<(), AgentError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage)?;
        tx.execute("DELETE FROM entries WHERE memory_ref = ?1", params![log.session_id])
            .map_err(storage)?;
        tx.execute(
            "INSERT INTO memory_logs (memory_ref, last_seq) VALUES (?1, ?2)
             ON CONFLICT(memory_ref) DO UPDATE SET last_seq = ?2",
            params![log.session_id, log.last_seq as i64],
        )
        .map_err(storage)?;
        {
            let mut stmt = tx
                .prepare("INSERT INTO entries (memory_ref, seq, entry) VALUES (?1, ?2, ?3)")
                .map_err(storage)?;
            for entry in &log.entries {
                let data = serde_json::to_string(entry).map_err(storage)?;
                stmt.execute(params![log.session_id, entry.sequence_no as i64, data])
                    .map_err(storage)?;
            }
        }
        tx.commit().map_err(storage)
    }

    fn load_memory(&self, memory_ref: &str) -> Result<MemoryLog, AgentError> {
        let conn = self.conn()?;
        let known: Option<String> = conn
            .query_row(
                "SELECT id FROM sessions WHERE id = ?1",
                params![memory_ref],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage)?;
        let last_seq: Option<i64> = conn
            .query_row(
                "SELECT last_seq FROM memory_logs WHERE memory_ref = ?1",
                params![memory_ref],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage)?;
        let mut stmt = conn
            .prepare("SELECT entry FROM entries WHERE memory_ref = ?1 ORDER BY seq")
            .map_err(storage)?;
        let rows = stmt
            .query_map(params![memory_ref], |row| row.get::<_, String>(0))
            .map_err(storage)?;
        let mut entries = Vec::new();
        for row in rows {
            let data = row.map_err(storage)?;
            let entry: Entry = serde_json::from_str(&data)
                .map_err(|e| AgentError::Corruption(format!("memory {}: {}", memory_ref, e)))?;
            entries.push(entry);
        }
        if entries.is_empty() && known.is_none() && last_seq.is_none() {
            return Err(AgentError::Corruption(format!("no memory log '{}'", memory_ref)));
        }
        Ok(MemoryLog {
            version: MEMORY_LOG_VERSION,
            session_id: memory_ref.to_string(),
            last_seq: last_seq.unwrap_or_default() as u64,
            entries,
        })
    }

    fn archive(&self, session_id: &str) -> Result<(), AgentError> {
        self.conn()?
            .execute(
                "UPDATE sessions SET archived = 1, updated_at = ?2 WHERE id = ?1",
                params![session_id, chrono::Utc::now().to_rfc3339()],
            )
            .map_err(storage)?;
        Ok(())
    }

    fn list_sessions(&self) -> Result<Vec<String>, AgentError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id FROM sessions WHERE archived = 0 ORDER BY id")
            .map_err(storage)?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(storage)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage)?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Memory, SnapshotStore, SNAPSHOT_VERSION};
    use serde_json::json;

    fn snapshot(id: &str, state: &str) -> SessionSnapshot {
        SessionSnapshot {
            version: SNAPSHOT_VERSION,
            session_id: id.into(),
            flow_id: "schedule".into(),
            current_state_id: state.into(),
            memory_ref: id.into(),
            turn_count: 1,
            token_seq: 0,
        }
    }

    #[test]
    fn test_snapshot_upsert() {
        let store = SqliteStore::in_memory().unwrap();
        store.save_snapshot(&snapshot("s1", "collect")).unwrap();
        store.save_snapshot(&snapshot("s1", "confirm")).unwrap();
        assert_eq!(store.load_snapshot("s1").unwrap().current_state_id, "confirm");
        assert_eq!(store.list_sessions().unwrap(), vec!["s1"]);
    }

    #[test]
    fn test_memory_replaced_after_rollback() {
        let store = SqliteStore::in_memory().unwrap();
        store.save_snapshot(&snapshot("s1", "collect")).unwrap();
        let mut mem = Memory::new("s1");
        mem.append(Entry::user("a").with_fact("summary", json!("standup")));
        mem.append(Entry::user("b"));
        mem.persist(&store).unwrap();

        mem.rollback(1).unwrap();
        mem.persist(&store).unwrap();

        let mut loaded = Memory::load(&store, "s1").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.resolve("summary"), Some(&json!("standup")));
        assert_eq!(loaded.append(Entry::user("c")), 3);
    }

    #[test]
    fn test_archive_hides_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("ark.db")).unwrap();
        store.save_snapshot(&snapshot("s1", "collect")).unwrap();
        store.archive("s1").unwrap();
        assert!(store.list_sessions().unwrap().is_empty());
        assert!(matches!(store.load_snapshot("s1"), Err(AgentError::Corruption(_))));
    }

    #[test]
    fn test_unknown_memory_is_corruption() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(matches!(store.load_memory("ghost"), Err(AgentError::Corruption(_))));
    }
}
