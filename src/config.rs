//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SWARM__*` 覆盖（双下划线表示嵌套，如 `SWARM__LLM__PROVIDER=openai`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub engine: EngineSection,
    pub retry: RetrySection,
    pub tools: ToolsSection,
    pub sandbox: SandboxSection,
    pub checkpoint: CheckpointSection,
    pub routing: RoutingSection,
    pub specialists: Vec<SpecialistSection>,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock；没有 API Key 时退回 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    pub temperature: Option<f32>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            temperature: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [engine] 段：单轮上限与根智能体的 system prompt
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    /// 一轮内最多调用模型的次数
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            system_prompt: default_system_prompt(),
        }
    }
}

fn default_max_steps() -> usize {
    20
}

fn default_system_prompt() -> String {
    "You are a helpful operations assistant. Use the available tools when they help, \
     delegate to specialists for their domains, and answer concisely."
        .to_string()
}

/// [retry] 段：模型与工具两套预算
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_model_max_attempts")]
    pub model_max_attempts: u32,
    #[serde(default = "default_tool_max_attempts")]
    pub tool_max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            model_max_attempts: default_model_max_attempts(),
            tool_max_attempts: default_tool_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_model_max_attempts() -> u32 {
    3
}

fn default_tool_max_attempts() -> u32 {
    2
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8000
}

/// [tools] 段：工具超时与需要人工审批的工具名
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// 调用前必须人工审批的工具
    #[serde(default)]
    pub approval_required: Vec<String>,
    /// 是否注册 code_exec 工具
    #[serde(default = "default_true")]
    pub code_exec: bool,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            approval_required: Vec::new(),
            code_exec: true,
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// [sandbox] 段：代码执行环境
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxSection {
    /// 沙箱模板名（本地后端仅用于日志）
    #[serde(default = "default_image")]
    pub image: String,
    /// 从创建起算的固定存活时间（秒）
    #[serde(default = "default_lifetime_secs")]
    pub lifetime_secs: u64,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            image: default_image(),
            lifetime_secs: default_lifetime_secs(),
        }
    }
}

fn default_image() -> String {
    "local".to_string()
}

fn default_lifetime_secs() -> u64 {
    600
}

/// [checkpoint] 段：后端与保留期
#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointSection {
    /// memory / file / sqlite
    #[serde(default = "default_backend")]
    pub backend: String,
    /// file 后端为目录，sqlite 后端为数据库文件
    pub path: Option<PathBuf>,
    /// 超过该天数未更新的检查点会被清理
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: None,
            retention_days: default_retention_days(),
        }
    }
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_retention_days() -> u64 {
    30
}

/// [routing] 段：频道 -> 智能体
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingSection {
    #[serde(default = "default_agent")]
    pub default_agent: String,
    #[serde(default)]
    pub channels: HashMap<String, String>,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            default_agent: default_agent(),
            channels: HashMap::new(),
        }
    }
}

fn default_agent() -> String {
    "assistant".to_string()
}

/// [[specialists]]：每个专家是一个独立检查点作用域的嵌套引擎
#[derive(Debug, Clone, Deserialize)]
pub struct SpecialistSection {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// prompt 模板，`{key}` 由 params 与上下文替换
    pub prompt: String,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    #[serde(default)]
    pub params: HashMap<String, String>,
    /// 可用的工具名（来自根注册表，不含其它专家）
    #[serde(default)]
    pub tools: Vec<String>,
    pub max_steps: Option<usize>,
}

/// 从 config 目录加载配置，环境变量 SWARM__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SWARM__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("SWARM")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
