//! 流程图编译
//!
//! 把 FlowDefinition 编译为不可变的 Flow：状态放在 Vec 中，转移按下标引用目标。
//! 所有引用（初始状态、转移目标、工具、输入映射）在加载期一次性校验。

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use crate::flow::state::{State, Transition};
use crate::flow::types::{FlowDefinition, FlowError, StateId};
use crate::tools::{validation, ToolRegistry};

/// 已校验的流程图；在会话间以 `Arc<Flow>` 共享，运行期只读
#[derive(Debug)]
pub struct Flow {
    id: String,
    description: Option<String>,
    initial: usize,
    states: Vec<State>,
    index: HashMap<StateId, usize>,
    tools: Arc<ToolRegistry>,
}

impl Flow {
    pub fn compile(def: FlowDefinition) -> Result<Self, FlowError> {
        if def.states.is_empty() {
            return Err(FlowError::Empty(def.id));
        }

        let mut tools = ToolRegistry::new();
        for spec in def.tools {
            if !spec.request_schema.is_object() || !spec.response_schema.is_object() {
                return Err(FlowError::InvalidSchema {
                    tool: spec.name,
                    reason: "request_schema and response_schema must be JSON objects".into(),
                });
            }
            if tools.get(&spec.name).is_some() {
                return Err(FlowError::DuplicateTool(spec.name));
            }
            tools.register(spec);
        }

        let mut index = HashMap::new();
        for (i, s) in def.states.iter().enumerate() {
            if index.insert(s.id.clone(), i).is_some() {
                return Err(FlowError::DuplicateState(s.id.clone()));
            }
        }

        let initial = *index
            .get(&def.initial)
            .ok_or_else(|| FlowError::UnknownInitial(def.initial.clone()))?;

        let mut states = Vec::with_capacity(def.states.len());
        for s in def.states {
            let mut seen = HashSet::new();
            for input in &s.required_inputs {
                if !seen.insert(input.as_str()) {
                    return Err(FlowError::DuplicateInput {
                        state: s.id.clone(),
                        input: input.clone(),
                    });
                }
            }

            if let Some(binding) = &s.tool {
                let spec = tools.get(&binding.name).ok_or_else(|| FlowError::UnknownTool {
                    state: s.id.clone(),
                    tool: binding.name.clone(),
                })?;

                for (param, fact) in &binding.input_mapping {
                    if !seen.contains(fact.as_str()) {
                        return Err(FlowError::UndeclaredInput {
                            state: s.id.clone(),
                            param: param.clone(),
                            fact: fact.clone(),
                        });
                    }
                }

                // 无映射时按同名传参
                let supplied: HashSet<&str> = if binding.input_mapping.is_empty() {
                    seen.clone()
                } else {
                    binding.input_mapping.keys().map(String::as_str).collect()
                };
                for param in validation::required_fields(&spec.request_schema) {
                    if !supplied.contains(param.as_str()) {
                        return Err(FlowError::MissingParameter {
                            state: s.id.clone(),
                            tool: binding.name.clone(),
                            param,
                        });
                    }
                }
            }

            let mut transitions = Vec::with_capacity(s.transitions.len());
            for t in s.transitions {
                let target = *index.get(&t.target).ok_or_else(|| FlowError::UnknownTarget {
                    state: s.id.clone(),
                    target: t.target.clone(),
                })?;
                transitions.push(Transition {
                    condition: t.when,
                    target,
                });
            }

            states.push(State {
                id: s.id,
                description: s.description,
                required_inputs: s.required_inputs,
                tool: s.tool,
                transitions,
                response: s.response,
                terminal: s.terminal,
            });
        }

        Ok(Self {
            id: def.id,
            description: def.description,
            initial,
            states,
            index,
            tools: Arc::new(tools),
        })
    }

    pub fn from_toml_str(text: &str) -> Result<Self, FlowError> {
        let def: FlowDefinition =
            toml::from_str(text).map_err(|e| FlowError::Parse(e.to_string()))?;
        Self::compile(def)
    }

    pub fn from_json_str(text: &str) -> Result<Self, FlowError> {
        let def: FlowDefinition =
            serde_json::from_str(text).map_err(|e| FlowError::Parse(e.to_string()))?;
        Self::compile(def)
    }

    /// 按扩展名加载：`.json` 走 JSON，其余按 TOML
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| FlowError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&text)
        } else {
            Self::from_toml_str(&text)
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn initial(&self) -> usize {
        self.initial
    }

    pub fn state(&self, idx: usize) -> &State {
        &self.states[idx]
    }

    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }
}
