//! Agent 层：按流程驱动对话的单会话运行时
//!
//! - runtime：Agent（一轮的编排、回滚、快照与恢复）
//! - builder：装配 LLM、工具传输与存储
//! - planner：对 LLM 的抽取 / 提问 / 回复
//! - turn：单轮输入与结果

pub mod builder;
pub mod planner;
pub mod runtime;
pub mod turn;

pub use builder::{
    llm_from_config, new_session_id, store_from_config, transport_from_config, AgentBuilder,
};
pub use planner::Planner;
pub use runtime::Agent;
pub use turn::{TurnInput, TurnOutcome, TurnStatus};
