//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ARK__*` 覆盖（双下划线表示嵌套，如 `ARK__AGENT__MAX_SELF_TRANSITIONS=8`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::tools::RetryPolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub tools: ToolsSection,
    pub storage: StorageSection,
}

/// [app] 段：应用名、流程文件
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 流程定义文件（TOML / JSON）
    pub flow_path: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "ark".to_string(),
            flow_path: PathBuf::from("flows/schedule_event.toml"),
        }
    }
}

/// [llm] 段：后端选择（openai / mock）与端点
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub provider: String,
    pub model: String,
    /// OpenAI 兼容端点，如本地 vLLM / TGI
    pub base_url: Option<String>,
    /// 未设置时读 OPENAI_API_KEY
    pub api_key: Option<String>,
    pub temperature: Option<f32>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            temperature: Some(0.0),
        }
    }
}

/// 工具失败（校验错误 / error 状态）时如何处理本轮记录
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedExchangePolicy {
    /// 删除本轮记录
    #[default]
    Rollback,
    /// 保留并标记失败（审计）
    MarkFailed,
}

/// [agent] 段：状态推进上限、上下文窗口、工具超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// 单轮最多推进次数
    pub max_self_transitions: usize,
    /// 发给 LLM 的最近记录条数
    pub context_window: usize,
    /// 默认工具超时（毫秒），工具规格可单独覆盖
    pub tool_timeout_ms: u64,
    pub failed_exchange: FailedExchangePolicy,
    pub system_prompt: Option<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_self_transitions: crate::flow::DEFAULT_MAX_SELF_TRANSITIONS,
            context_window: 20,
            tool_timeout_ms: 10_000,
            failed_exchange: FailedExchangePolicy::Rollback,
            system_prompt: None,
        }
    }
}

impl AgentSection {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }
}

/// [tools] 段：传输方式（local / http）与重试策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub transport: String,
    pub retry: RetryPolicy,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            transport: "local".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

/// [storage] 段：持久化后端（file / sqlite / memory）与路径
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub backend: String,
    pub path: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: "file".to_string(),
            path: PathBuf::from("data/sessions"),
        }
    }
}

/// 从 config 目录加载配置，环境变量 ARK__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ARK__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ARK")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
