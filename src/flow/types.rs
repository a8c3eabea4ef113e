//! 流程定义类型
//!
//! 定义流程文件（TOML / JSON）的反序列化结构、转移条件与加载期错误。
//! 定义只在加载时出现一次，随后被编译为不可变的 [`Flow`](crate::flow::Flow)。

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::memory::Memory;
use crate::tools::ToolSpec;

pub type StateId = String;

/// 流程文件顶层结构
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FlowDefinition {
    /// 流程唯一标识（写入会话快照）
    pub id: String,
    /// 初始状态
    pub initial: StateId,
    #[serde(default)]
    pub description: Option<String>,
    /// 本流程可用的工具注册表
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    pub states: Vec<StateDefinition>,
}

/// 单个状态节点
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StateDefinition {
    pub id: StateId,
    /// 用于 LLM 提问与回复的状态说明
    #[serde(default)]
    pub description: Option<String>,
    /// 有序的必需输入（事实名）
    #[serde(default)]
    pub required_inputs: Vec<String>,
    #[serde(default)]
    pub tool: Option<ToolBinding>,
    /// 按声明顺序求值，第一个成立者胜出
    #[serde(default)]
    pub transitions: Vec<TransitionDefinition>,
    /// 静态回复文本
    #[serde(default)]
    pub response: Option<String>,
    /// 终止状态：到达后会话结束
    #[serde(default)]
    pub terminal: bool,
}

/// 状态与工具的绑定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolBinding {
    /// 注册表中的工具名
    pub name: String,
    /// 工具参数名 -> 事实名；为空时按 required_inputs 同名传参
    #[serde(default)]
    pub input_mapping: BTreeMap<String, String>,
    /// 事实名 -> 结果 payload 中的 JSON Pointer（如 `/event/id`）
    #[serde(default)]
    pub output_mapping: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TransitionDefinition {
    pub target: StateId,
    #[serde(default)]
    pub when: Condition,
}

/// 转移条件（基于记忆中的事实求值）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    #[default]
    Always,
    /// 事实存在
    Has(String),
    /// 事实不存在
    Missing(String),
    /// 事实等于给定值
    Equals { input: String, value: Value },
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn evaluate(&self, memory: &Memory) -> bool {
        match self {
            Condition::Always => true,
            Condition::Has(name) => memory.has(name),
            Condition::Missing(name) => !memory.has(name),
            Condition::Equals { input, value } => memory.resolve(input) == Some(value),
            Condition::All(conds) => conds.iter().all(|c| c.evaluate(memory)),
            Condition::Any(conds) => conds.iter().any(|c| c.evaluate(memory)),
            Condition::Not(cond) => !cond.evaluate(memory),
        }
    }
}

/// 流程加载错误：全部在加载期发现，运行期不再解释流程文本
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Failed to read flow file {path}: {reason}")]
    Io { path: String, reason: String },
    #[error("Failed to parse flow definition: {0}")]
    Parse(String),
    #[error("Flow '{0}' has no states")]
    Empty(String),
    #[error("Duplicate state '{0}'")]
    DuplicateState(String),
    #[error("Duplicate tool '{0}'")]
    DuplicateTool(String),
    #[error("Initial state '{0}' does not exist")]
    UnknownInitial(String),
    #[error("State '{state}' transitions to unknown state '{target}'")]
    UnknownTarget { state: String, target: String },
    #[error("State '{state}' binds unknown tool '{tool}'")]
    UnknownTool { state: String, tool: String },
    #[error("State '{state}' declares input '{input}' more than once")]
    DuplicateInput { state: String, input: String },
    #[error("State '{state}' maps parameter '{param}' from '{fact}', which is not a required input")]
    UndeclaredInput {
        state: String,
        param: String,
        fact: String,
    },
    #[error("State '{state}' does not supply required parameter '{param}' of tool '{tool}'")]
    MissingParameter {
        state: String,
        tool: String,
        param: String,
    },
    #[error("Tool '{tool}' has an invalid schema: {reason}")]
    InvalidSchema { tool: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Entry;
    use serde_json::json;

    #[test]
    fn test_condition_toml_forms() {
        #[derive(Deserialize)]
        struct Wrap {
            when: Vec<Condition>,
        }
        let w: Wrap = toml::from_str(
            r#"
            when = [
                "always",
                { has = "start" },
                { equals = { input = "confirmed", value = true } },
                { not = { missing = "summary" } },
                { any = [ { has = "a" }, { has = "b" } ] },
            ]
            "#,
        )
        .unwrap();
        assert_eq!(w.when[0], Condition::Always);
        assert_eq!(w.when[1], Condition::Has("start".into()));
        assert!(matches!(&w.when[2], Condition::Equals { input, .. } if input == "confirmed"));
        assert!(matches!(&w.when[3], Condition::Not(_)));
        assert!(matches!(&w.when[4], Condition::Any(v) if v.len() == 2));
    }

    #[test]
    fn test_condition_evaluation() {
        let mut mem = Memory::new("s1");
        mem.append(
            Entry::user("yes")
                .with_fact("confirmed", json!(true))
                .with_fact("summary", json!("standup")),
        );

        assert!(Condition::Has("summary".into()).evaluate(&mem));
        assert!(Condition::Missing("start".into()).evaluate(&mem));
        assert!(Condition::Equals {
            input: "confirmed".into(),
            value: json!(true)
        }
        .evaluate(&mem));
        assert!(!Condition::All(vec![
            Condition::Has("summary".into()),
            Condition::Has("start".into())
        ])
        .evaluate(&mem));
        assert!(Condition::Not(Box::new(Condition::Has("start".into()))).evaluate(&mem));
    }
}
