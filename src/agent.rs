//! Headless 运行时装配
//!
//! 从 AppConfig 构建：LLM 客户端、检查点存储、沙箱管理器、根工具集、专家、各智能体引擎，
//! 最后组装成 TriggerRouter，供 main 或任意平台适配器调用。

use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, CheckpointSection};
use crate::core::{AgentError, Orchestrator, RetryPolicy};
use crate::gateway::{AgentRoutes, TriggerRouter};
use crate::llm::{create_deepseek_client, LlmClient, MockLlmClient, OpenAiClient};
use crate::memory::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, ScopedCheckpointStore};
use crate::react::Planner;
use crate::sandbox::{LocalProcessProvider, SandboxManager};
use crate::tools::{
    render_prompt, CodeExecTool, EchoTool, Specialist, SpecialistConfig, ToolDispatcher, ToolRegistry,
};

/// 组装好的运行时
pub struct Runtime {
    pub router: TriggerRouter,
    pub store: Arc<dyn CheckpointStore>,
    pub sandboxes: Arc<SandboxManager>,
    pub retention: Duration,
}

/// 按配置与环境变量选择后端；model / temperature 可覆盖（专家使用）
pub fn create_llm(cfg: &AppConfig, model: Option<&str>, temperature: Option<f32>) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let timeout = Duration::from_secs(cfg.llm.timeouts.request);
    let temperature = temperature.or(cfg.llm.temperature);

    if provider == "mock" {
        return Arc::new(MockLlmClient);
    }

    // 有 DeepSeek Key 或（配置为 deepseek 且仅有 OpenAI Key 时也走 DeepSeek 兼容端点）
    let use_deepseek = std::env::var("DEEPSEEK_API_KEY").is_ok()
        || (provider == "deepseek" && std::env::var("OPENAI_API_KEY").is_ok());
    let use_openai = std::env::var("OPENAI_API_KEY").is_ok() && provider != "deepseek";

    if use_deepseek {
        let model = model.unwrap_or(&cfg.llm.model);
        tracing::info!("Using DeepSeek LLM ({})", model);
        Arc::new(
            create_deepseek_client(Some(model))
                .with_temperature(temperature)
                .with_request_timeout(timeout),
        )
    } else if use_openai {
        let model = model.unwrap_or(&cfg.llm.model);
        tracing::info!("Using OpenAI LLM ({})", model);
        Arc::new(
            OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                model,
                std::env::var("OPENAI_API_KEY").ok().as_deref(),
            )
            .with_temperature(temperature)
            .with_request_timeout(timeout),
        )
    } else {
        tracing::warn!("No API key set or provider unknown, using Mock LLM");
        Arc::new(MockLlmClient)
    }
}

pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    create_llm(cfg, None, None)
}

/// 按 [checkpoint].backend 创建存储
pub async fn create_checkpoint_store(cfg: &CheckpointSection) -> Result<Arc<dyn CheckpointStore>, AgentError> {
    match cfg.backend.to_lowercase().as_str() {
        "memory" => Ok(Arc::new(MemoryCheckpointStore::new())),
        "file" => {
            let root = cfg
                .path
                .clone()
                .unwrap_or_else(|| "data/checkpoints".into());
            tracing::info!(root = %root.display(), "using file checkpoint store");
            Ok(Arc::new(FileCheckpointStore::new(root)))
        }
        #[cfg(feature = "async-sqlite")]
        "sqlite" => {
            let path = cfg
                .path
                .clone()
                .unwrap_or_else(|| "data/checkpoints.db".into());
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AgentError::Checkpoint(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
            tracing::info!(path = %path.display(), "using sqlite checkpoint store");
            let store = crate::memory::SqliteCheckpointStore::new(&path)
                .await
                .map_err(|e| AgentError::Checkpoint(e.to_string()))?;
            Ok(Arc::new(store))
        }
        other => Err(AgentError::ConfigError(format!(
            "unknown checkpoint backend '{}' (expected memory, file{})",
            other,
            if cfg!(feature = "async-sqlite") { " or sqlite" } else { "; sqlite needs the async-sqlite feature" }
        ))),
    }
}

/// 根工具集：echo、code_exec，并标记需要审批的工具
pub fn base_tools(cfg: &AppConfig, sandboxes: &Arc<SandboxManager>) -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register(EchoTool);
    if cfg.tools.code_exec {
        tools.register(CodeExecTool::new(sandboxes.clone()));
    }
    for name in &cfg.tools.approval_required {
        tools.require_approval(name.clone());
    }
    tools
}

fn dispatcher(cfg: &AppConfig, tools: ToolRegistry) -> ToolDispatcher {
    ToolDispatcher::new(tools, cfg.tools.tool_timeout_secs).with_retry(RetryPolicy::for_tools(&cfg.retry))
}

/// 专家的引擎：独立 LLM 参数、base 的工具子集、`<name>` 检查点作用域
fn specialist_engine(
    cfg: &AppConfig,
    spec: &SpecialistConfig,
    system_prompt: String,
    base: &ToolRegistry,
    store: &Arc<dyn CheckpointStore>,
) -> Orchestrator {
    let llm = create_llm(cfg, spec.model.as_deref(), spec.temperature);
    let scoped: Arc<dyn CheckpointStore> =
        Arc::new(ScopedCheckpointStore::new(store.clone(), spec.name.clone()));
    Orchestrator::new(
        Planner::new(llm, system_prompt).with_retry(RetryPolicy::for_model(&cfg.retry)),
        dispatcher(cfg, base.subset(&spec.tools)),
        scoped,
    )
    .with_name(spec.name.clone())
    .with_max_steps(spec.max_steps.unwrap_or(cfg.engine.max_steps))
}

/// 专家一次委派的时长上限：每步一次模型请求加一次工具调用
fn specialist_timeout(cfg: &AppConfig, spec: &SpecialistConfig) -> Duration {
    let steps = spec.max_steps.unwrap_or(cfg.engine.max_steps).max(1) as u64;
    Duration::from_secs(steps * (cfg.llm.timeouts.request + cfg.tools.tool_timeout_secs))
}

/// 由配置构建专家工具（prompt 每次调用时渲染）
pub fn build_specialist(
    cfg: &AppConfig,
    mut spec: SpecialistConfig,
    base: &ToolRegistry,
    store: &Arc<dyn CheckpointStore>,
    sandboxes: &Arc<SandboxManager>,
) -> Specialist {
    spec.timeout = Some(specialist_timeout(cfg, &spec));
    let engine = specialist_engine(cfg, &spec, spec.prompt_template.clone(), base, store);
    Specialist::from_engine(spec, engine).with_sandboxes(sandboxes.clone())
}

/// 组装完整运行时：根智能体（可调用全部专家）+ 每个专家各自作为可路由的智能体
pub async fn build_runtime(cfg: &AppConfig) -> Result<Runtime, AgentError> {
    let store = create_checkpoint_store(&cfg.checkpoint).await?;
    let sandboxes = Arc::new(SandboxManager::new(
        Arc::new(LocalProcessProvider),
        cfg.sandbox.image.clone(),
        Duration::from_secs(cfg.sandbox.lifetime_secs),
    ));
    let base = base_tools(cfg, &sandboxes);
    let retention = Duration::from_secs(cfg.checkpoint.retention_days * 24 * 3600);

    let mut root_tools = base.clone();
    let mut router = TriggerRouter::new(AgentRoutes::from_config(&cfg.routing)).with_retention(retention);

    for section in &cfg.specialists {
        let spec = SpecialistConfig::from(section);

        // 频道直接路由到专家时，prompt 只用静态参数渲染一次
        let system = render_prompt(&spec.prompt_template, &spec.params);
        let direct = specialist_engine(cfg, &spec, system, &base, &store).with_sandboxes(sandboxes.clone());
        router.register_agent(Arc::new(direct));

        tracing::info!(specialist = %spec.name, tools = ?spec.tools, "specialist registered");
        root_tools.register(build_specialist(cfg, spec, &base, &store, &sandboxes));
    }

    let root = Orchestrator::new(
        Planner::new(create_llm_from_config(cfg), cfg.engine.system_prompt.clone())
            .with_retry(RetryPolicy::for_model(&cfg.retry)),
        dispatcher(cfg, root_tools),
        store.clone(),
    )
    .with_name(cfg.routing.default_agent.clone())
    .with_max_steps(cfg.engine.max_steps)
    .with_sandboxes(sandboxes.clone());
    router.register_agent(Arc::new(root));

    Ok(Runtime {
        router,
        store,
        sandboxes,
        retention,
    })
}
