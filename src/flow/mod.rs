//! 流程层：声明式状态图的定义、编译、状态判断与推进

pub mod builder;
pub mod graph;
pub mod runner;
pub mod state;
pub mod types;

pub use builder::FlowBuilder;
pub use graph::Flow;
pub use runner::{Cursor, StateRunner, StepOutcome, DEFAULT_MAX_SELF_TRANSITIONS};
pub use state::{State, StatePhase, Transition};
pub use types::{
    Condition, FlowDefinition, FlowError, StateDefinition, StateId, ToolBinding,
    TransitionDefinition,
};
