//! 运行期状态节点
//!
//! 由 StateDefinition 编译而来：转移目标已解析为下标。判断逻辑全部是记忆的纯函数。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::flow::types::{Condition, StateId, ToolBinding};
use crate::memory::Memory;
use crate::tools::ToolResult;

/// 单状态的微生命周期：collecting_inputs → awaiting_tool → complete，blocked 为汇点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatePhase {
    /// 刚进入，正在收集输入
    CollectingInputs,
    /// 输入齐全，工具调用进行中
    AwaitingTool,
    /// 输入齐全（且工具已成功返回）
    Complete,
    /// 本轮无法补齐输入，控制权交还用户
    Blocked,
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub condition: Condition,
    /// 目标状态在 Flow.states 中的下标
    pub target: usize,
}

#[derive(Debug, Clone)]
pub struct State {
    pub id: StateId,
    pub description: Option<String>,
    pub required_inputs: Vec<String>,
    pub tool: Option<ToolBinding>,
    pub transitions: Vec<Transition>,
    pub response: Option<String>,
    pub terminal: bool,
}

impl State {
    /// 尚未在记忆中解析到的输入，按声明顺序
    pub fn get_missing_inputs(&self, memory: &Memory) -> Vec<String> {
        self.required_inputs
            .iter()
            .filter(|name| !memory.has(name))
            .cloned()
            .collect()
    }

    pub fn check_completion(&self, memory: &Memory) -> bool {
        self.required_inputs.iter().all(|name| memory.has(name))
    }

    pub fn should_call_tool(&self, memory: &Memory) -> bool {
        self.tool.is_some() && self.check_completion(memory)
    }

    /// 按 input_mapping 从记忆组装工具参数
    pub fn build_parameters(&self, memory: &Memory) -> Map<String, Value> {
        let mut params = Map::new();
        let Some(binding) = &self.tool else {
            return params;
        };
        if binding.input_mapping.is_empty() {
            for name in &self.required_inputs {
                if let Some(v) = memory.resolve(name) {
                    params.insert(name.clone(), v.clone());
                }
            }
        } else {
            for (param, fact) in &binding.input_mapping {
                if let Some(v) = memory.resolve(fact) {
                    params.insert(param.clone(), v.clone());
                }
            }
        }
        params
    }

    /// 把成功结果的 payload 映射为具名事实
    ///
    /// 有 output_mapping 时按 JSON Pointer 取值（缺失的指针跳过）；
    /// 否则对象 payload 的顶层键原样成为事实。
    pub fn on_tool_result(&self, result: &ToolResult) -> BTreeMap<String, Value> {
        let mut facts = BTreeMap::new();
        let Some(payload) = result.payload.as_ref() else {
            return facts;
        };
        let mapping = self.tool.as_ref().map(|b| &b.output_mapping);
        match mapping {
            Some(mapping) if !mapping.is_empty() => {
                for (fact, pointer) in mapping {
                    if let Some(v) = payload.pointer(pointer) {
                        facts.insert(fact.clone(), v.clone());
                    }
                }
            }
            _ => {
                if let Value::Object(obj) = payload {
                    for (k, v) in obj {
                        facts.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        facts
    }
}
