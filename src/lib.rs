//! Ark - Rust 流程驱动对话智能体
//!
//! 模块划分：
//! - **agent**: 单会话运行时（一轮的编排、回滚、快照与恢复）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、会话监管
//! - **flow**: 声明式状态图（定义、编译校验、推进）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 会话记忆与持久化（文件 / SQLite / 内存）
//! - **observability**: tracing 初始化
//! - **session**: 多会话管理（并发、忙碌拒绝、取消、恢复）
//! - **tools**: 工具注册表、schema 校验、重试、传输与调用器

pub mod agent;
pub mod config;
pub mod core;
pub mod flow;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod session;
pub mod tools;

pub use agent::{Agent, AgentBuilder, TurnInput, TurnOutcome, TurnStatus};
pub use core::AgentError;
pub use flow::Flow;
pub use session::SessionManager;
