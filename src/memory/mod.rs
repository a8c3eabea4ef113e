//! 记忆层：会话记忆（只追加日志）与持久化（快照 / 记忆日志，文件与 SQLite 两种后端）

pub mod conversation;
pub mod persistence;
pub mod snapshot;
pub mod sqlite;

pub use conversation::{Entry, Memory, Message, Role};
pub use persistence::{FileStore, InMemoryStore, SnapshotStore};
pub use snapshot::{MemoryLog, SessionSnapshot, MEMORY_LOG_VERSION, SNAPSHOT_VERSION};
pub use sqlite::SqliteStore;
