//! 流程构建器
//!
//! 提供流畅的 API 在代码中构建流程（测试与嵌入场景），最终同样经过 Flow::compile 校验

use crate::flow::graph::Flow;
use crate::flow::types::*;
use crate::tools::ToolSpec;

/// 流程构建器
pub struct FlowBuilder {
    id: String,
    initial: Option<StateId>,
    description: Option<String>,
    tools: Vec<ToolSpec>,
    states: Vec<StateDefinition>,
}

impl FlowBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            initial: None,
            description: None,
            tools: Vec::new(),
            states: Vec::new(),
        }
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// 设置初始状态；未设置时取第一个添加的状态
    pub fn initial(mut self, state: impl Into<StateId>) -> Self {
        self.initial = Some(state.into());
        self
    }

    pub fn tool(mut self, spec: ToolSpec) -> Self {
        self.tools.push(spec);
        self
    }

    /// 添加状态
    pub fn state(mut self, id: impl Into<StateId>, required_inputs: &[&str]) -> Self {
        self.states.push(StateDefinition {
            id: id.into(),
            description: None,
            required_inputs: required_inputs.iter().map(|s| s.to_string()).collect(),
            tool: None,
            transitions: Vec::new(),
            response: None,
            terminal: false,
        });
        self
    }

    /// 为最近添加的状态绑定工具
    pub fn bind_tool(mut self, binding: ToolBinding) -> Self {
        if let Some(state) = self.states.last_mut() {
            state.tool = Some(binding);
        }
        self
    }

    /// 为最近添加的状态追加一条转移
    pub fn transition(mut self, target: impl Into<StateId>, when: Condition) -> Self {
        if let Some(state) = self.states.last_mut() {
            state.transitions.push(TransitionDefinition {
                target: target.into(),
                when,
            });
        }
        self
    }

    pub fn response(mut self, text: impl Into<String>) -> Self {
        if let Some(state) = self.states.last_mut() {
            state.response = Some(text.into());
        }
        self
    }

    pub fn terminal(mut self) -> Self {
        if let Some(state) = self.states.last_mut() {
            state.terminal = true;
        }
        self
    }

    pub fn definition(self) -> Result<FlowDefinition, FlowError> {
        let initial = match self.initial {
            Some(initial) => initial,
            None => self
                .states
                .first()
                .map(|s| s.id.clone())
                .ok_or_else(|| FlowError::Empty(self.id.clone()))?,
        };
        Ok(FlowDefinition {
            id: self.id,
            initial,
            description: self.description,
            tools: self.tools,
            states: self.states,
        })
    }

    /// 构建并校验流程
    pub fn build(self) -> Result<Flow, FlowError> {
        Flow::compile(self.definition()?)
    }
}
