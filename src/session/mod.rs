//! 多会话管理

pub mod manager;

pub use manager::{SessionId, SessionManager};
