//! Planner：Agent 对 LLM 的三种用法
//!
//! - extract_inputs：从用户输入中抽取当前状态缺失的槽位值（JSON 输出）
//! - ask_for_missing：为缺失输入生成一句提问
//! - respond：生成对话回复
//!
//! LLM 输出可能带 ```json 代码块或前后说明文字，extract_json 负责取出 JSON 部分。

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::core::AgentError;
use crate::flow::State;
use crate::llm::LlmClient;
use crate::memory::Message;

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are Ark, an assistant that helps the user complete a task step by step. Be brief.";

/// 从 LLM 文本中取出 JSON 对象（```json ... ``` 或首个 `{` 到末个 `}`）
pub fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// 缺失输入的固定提问（LLM 不可用时使用）
pub fn fallback_question(missing: &[String]) -> String {
    format!("Please provide: {}", missing.join(", "))
}

/// Planner：持有 LLM 与 system prompt
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
        }
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    fn state_context(state: &State) -> String {
        match &state.description {
            Some(desc) => format!("\nCurrent step '{}': {}", state.id, desc),
            None => format!("\nCurrent step: {}", state.id),
        }
    }

    async fn complete_with_system(
        &self,
        system: String,
        history: &[Message],
        tail: Option<Message>,
    ) -> Result<String, AgentError> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(system));
        messages.extend_from_slice(history);
        messages.extend(tail);
        self.llm
            .complete(&messages)
            .await
            .map_err(AgentError::LlmError)
    }

    /// 抽取槽位值；只保留 `fields` 中列出且非 null 的键
    pub async fn extract_inputs(
        &self,
        history: &[Message],
        state: &State,
        fields: &[String],
        user_text: &str,
    ) -> Result<BTreeMap<String, Value>, AgentError> {
        let system = format!(
            "{}{}\nExtract values for these fields from the user's latest message: {}.\n\
             Reply with one JSON object using exactly these keys. Use null for any field the user did not provide. \
             Do not guess.",
            self.system_prompt,
            Self::state_context(state),
            fields.join(", ")
        );
        let output = self
            .complete_with_system(system, history, Some(Message::user(user_text)))
            .await?;
        let json = extract_json(&output)
            .ok_or_else(|| AgentError::LlmError(format!("no JSON in extraction output: {}", output)))?;
        let parsed: serde_json::Map<String, Value> = serde_json::from_str(json)
            .map_err(|e| AgentError::LlmError(format!("{}: {}", e, json)))?;

        Ok(parsed
            .into_iter()
            .filter(|(k, _)| fields.contains(k))
            .filter(|(_, v)| match v {
                Value::Null => false,
                Value::String(s) => !s.trim().is_empty(),
                _ => true,
            })
            .collect())
    }

    /// 为缺失输入生成一句提问
    pub async fn ask_for_missing(
        &self,
        history: &[Message],
        state: &State,
        missing: &[String],
    ) -> Result<String, AgentError> {
        let system = format!(
            "{}{}\nThe following information is still missing: {}. \
             Ask the user for it in one short, friendly question.",
            self.system_prompt,
            Self::state_context(state),
            missing.join(", ")
        );
        let question = self.complete_with_system(system, history, None).await?;
        non_empty(question)
    }

    /// 生成对话回复；`known` 为当前已知事实
    pub async fn respond(
        &self,
        history: &[Message],
        state: &State,
        known: &BTreeMap<String, Value>,
    ) -> Result<String, AgentError> {
        let facts = serde_json::to_string(known).unwrap_or_default();
        let system = format!(
            "{}{}\nKnown facts: {}\nReply to the user.",
            self.system_prompt,
            Self::state_context(state),
            facts
        );
        let reply = self.complete_with_system(system, history, None).await?;
        non_empty(reply)
    }
}

fn non_empty(text: String) -> Result<String, AgentError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(AgentError::LlmError("empty completion".into()));
    }
    Ok(trimmed.to_string())
}
