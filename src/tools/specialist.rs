//! 专家委派
//!
//! Specialist 把一个完整的 Orchestrator（独立 prompt、独立工具集、独立检查点作用域）包装成工具，
//! 父智能体像调用普通工具一样调用它：`{"request": "..."}` -> 专家的最终回复。
//! 每次调用使用新的 thread（`<name>-<uuid>`）；专家内部的审批中断以工具错误的形式返回给父智能体。
//! 专家整轮有自己的时间预算（不受父分发器的单次工具超时约束），且失败后不会被父智能体自动重跑。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::SpecialistSection;
use crate::core::{AgentError, Orchestrator, TurnOutcome};
use crate::llm::LlmClient;
use crate::memory::{CheckpointStore, ScopedCheckpointStore};
use crate::react::{Planner, MAX_REACT_STEPS};
use crate::sandbox::SandboxManager;
use crate::tools::{Tool, ToolContext, ToolDispatcher, ToolRegistry};

/// 专家配置
#[derive(Debug, Clone, Default)]
pub struct SpecialistConfig {
    pub name: String,
    pub description: String,
    /// `{key}` 占位符由 params、上下文与 `{request}` 替换
    pub prompt_template: String,
    pub params: HashMap<String, String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    /// 可用工具名
    pub tools: Vec<String>,
    pub max_steps: Option<usize>,
    /// 一次委派的总时长上限；None 时按步数估算
    pub timeout: Option<Duration>,
}

/// 未配置 timeout 时每步（一次模型调用加工具）的预算
const STEP_BUDGET: Duration = Duration::from_secs(90);

impl SpecialistConfig {
    /// 一次委派的时间预算
    pub fn budget(&self) -> Duration {
        self.timeout.unwrap_or_else(|| {
            let steps = self.max_steps.unwrap_or(MAX_REACT_STEPS).max(1) as u32;
            STEP_BUDGET * steps
        })
    }
}

impl From<&SpecialistSection> for SpecialistConfig {
    fn from(s: &SpecialistSection) -> Self {
        Self {
            name: s.name.clone(),
            description: s.description.clone(),
            prompt_template: s.prompt.clone(),
            params: s.params.clone(),
            model: s.model.clone(),
            temperature: s.temperature,
            tools: s.tools.clone(),
            max_steps: s.max_steps,
            timeout: None,
        }
    }
}

/// 每次调用前为 prompt 提供额外变量（如账户信息、当前日期）
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn context(&self, request: &str) -> Result<HashMap<String, String>, String>;
}

/// 替换模板中的 `{key}`；没有值的占位符原样保留
pub fn render_prompt(template: &str, values: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) if is_placeholder(&after[..end]) => {
                let key = &after[..end];
                match values.get(key) {
                    Some(v) => out.push_str(v),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_placeholder(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// 以工具形式暴露的嵌套引擎
pub struct Specialist {
    config: SpecialistConfig,
    engine: Orchestrator,
    context: Option<Arc<dyn ContextProvider>>,
    sandboxes: Option<Arc<SandboxManager>>,
}

impl Specialist {
    /// 用默认设置构建专家引擎：检查点放在 store 的 `<name>` 作用域下
    pub fn new(
        config: SpecialistConfig,
        llm: Arc<dyn LlmClient>,
        tools: ToolRegistry,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        let scoped: Arc<dyn CheckpointStore> =
            Arc::new(ScopedCheckpointStore::new(store, config.name.clone()));
        let mut engine = Orchestrator::new(
            Planner::new(llm, config.prompt_template.clone()),
            ToolDispatcher::new(tools, 30),
            scoped,
        )
        .with_name(config.name.clone());
        if let Some(max_steps) = config.max_steps {
            engine = engine.with_max_steps(max_steps);
        }
        Self::from_engine(config, engine)
    }

    /// 使用已构建好的引擎
    pub fn from_engine(config: SpecialistConfig, engine: Orchestrator) -> Self {
        Self {
            config,
            engine,
            context: None,
            sandboxes: None,
        }
    }

    pub fn with_context_provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.context = Some(provider);
        self
    }

    /// 每次委派结束后回收该 thread 的沙箱
    pub fn with_sandboxes(mut self, sandboxes: Arc<SandboxManager>) -> Self {
        self.sandboxes = Some(sandboxes);
        self
    }

    pub fn config(&self) -> &SpecialistConfig {
        &self.config
    }

    pub fn engine(&self) -> &Orchestrator {
        &self.engine
    }

    /// 渲染本次调用的 system prompt
    pub async fn render(&self, request: &str) -> Result<String, AgentError> {
        let mut values = self.config.params.clone();
        if let Some(provider) = &self.context {
            let extra = provider
                .context(request)
                .await
                .map_err(AgentError::ToolExecutionFailed)?;
            values.extend(extra);
        }
        values.insert("request".to_string(), request.to_string());
        Ok(render_prompt(&self.config.prompt_template, &values))
    }

    /// 在新 thread 上跑完整的一轮，返回最终回复
    pub async fn invoke(&self, request: &str) -> Result<String, AgentError> {
        let system = self.render(request).await?;
        let thread_id = format!("{}-{}", self.config.name, uuid::Uuid::new_v4().simple());
        tracing::info!(specialist = %self.config.name, thread_id = %thread_id, "delegating request");
        let outcome = self.engine.run_with_system(&thread_id, request, Some(&system)).await;
        if let Some(sandboxes) = &self.sandboxes {
            sandboxes.terminate(&thread_id).await;
        }
        match outcome? {
            TurnOutcome::Completed { output } => Ok(output),
            TurnOutcome::Interrupted { interrupt } => Err(AgentError::ToolExecutionFailed(format!(
                "specialist '{}' stopped waiting for approval of '{}'",
                self.config.name, interrupt.tool_name
            ))),
        }
    }
}

#[async_trait]
impl Tool for Specialist {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn description(&self) -> &str {
        if self.config.description.is_empty() {
            "Delegate a request to a specialist agent."
        } else {
            &self.config.description
        }
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.config.budget())
    }

    fn retryable(&self) -> bool {
        false
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "request": {
                    "type": "string",
                    "description": "What the specialist should do, with all needed details"
                }
            },
            "required": ["request"]
        })
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> Result<String, String> {
        let request = args
            .get("request")
            .and_then(|v| v.as_str())
            .ok_or("Missing required parameter: request")?;
        self.invoke(request).await.map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmResponse, ScriptedLlmClient};
    use crate::core::RetryPolicy;
    use crate::memory::{MemoryCheckpointStore, Role, ToolCall};
    use std::collections::BTreeMap;

    struct AccountContext;

    #[async_trait]
    impl ContextProvider for AccountContext {
        async fn context(&self, _request: &str) -> Result<HashMap<String, String>, String> {
            Ok(HashMap::from([("plan".to_string(), "pro".to_string())]))
        }
    }

    fn config(name: &str, template: &str) -> SpecialistConfig {
        SpecialistConfig {
            name: name.to_string(),
            description: format!("{name} specialist"),
            prompt_template: template.to_string(),
            params: HashMap::from([("company".to_string(), "Acme".to_string())]),
            ..Default::default()
        }
    }

    #[test]
    fn test_render_prompt() {
        let values = HashMap::from([("name".to_string(), "Ada".to_string())]);
        assert_eq!(render_prompt("Hi {name}!", &values), "Hi Ada!");
        assert_eq!(render_prompt("{missing} {name}", &values), "{missing} Ada");
        assert_eq!(render_prompt("json {\"a\": 1}", &values), "json {\"a\": 1}");
    }

    #[tokio::test]
    async fn test_invoke_renders_prompt_with_context() {
        let client = Arc::new(ScriptedLlmClient::replies(vec![LlmResponse::text("refund issued")]));
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let specialist = Specialist::new(
            config("billing", "You do billing for {company} on the {plan} plan."),
            client.clone(),
            ToolRegistry::new(),
            store,
        )
        .with_context_provider(Arc::new(AccountContext));

        let out = specialist
            .execute(&ToolContext::new("parent"), json!({"request": "refund order 7"}))
            .await
            .unwrap();
        assert_eq!(out, "refund issued");
        let seen = client.seen_messages();
        assert_eq!(seen[0][0].content, "You do billing for Acme on the pro plan.");
        assert_eq!(seen[0][1].content, "refund order 7");
    }

    #[tokio::test]
    async fn test_specialists_nest() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());

        let inner_llm = Arc::new(ScriptedLlmClient::replies(vec![LlmResponse::text("ledger ok")]));
        let inner = Specialist::new(config("ledger", "ledger"), inner_llm, ToolRegistry::new(), store.clone());

        let middle_llm = Arc::new(ScriptedLlmClient::replies(vec![
            LlmResponse::with_tool_calls(
                "",
                vec![ToolCall::new("c1", "ledger", json!({"request": "check"}))],
            ),
            LlmResponse::text("billing says: ledger ok"),
        ]));
        let mut middle_tools = ToolRegistry::new();
        middle_tools.register(inner);
        let middle = Specialist::new(config("billing", "billing"), middle_llm, middle_tools, store);

        let out = middle.invoke("audit").await.unwrap();
        assert_eq!(out, "billing says: ledger ok");
    }

    #[tokio::test]
    async fn test_missing_request_is_tool_error() {
        let client = Arc::new(ScriptedLlmClient::replies(vec![]));
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let specialist = Specialist::new(config("x", "x"), client, ToolRegistry::new(), store);
        let err = specialist
            .execute(&ToolContext::new("p"), json!({}))
            .await
            .unwrap_err();
        assert!(err.contains("request"));
    }

    #[test]
    fn test_budget_scales_with_steps() {
        let mut cfg = config("x", "x");
        assert_eq!(cfg.budget(), STEP_BUDGET * MAX_REACT_STEPS as u32);
        cfg.max_steps = Some(4);
        assert_eq!(cfg.budget(), Duration::from_secs(360));
        cfg.timeout = Some(Duration::from_secs(5));
        assert_eq!(cfg.budget(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_slow_specialist_outlives_parent_tool_timeout() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let llm = Arc::new(
            ScriptedLlmClient::replies(vec![LlmResponse::text("invoice paid")])
                .with_delay(Duration::from_millis(300)),
        );
        let specialist = Specialist::new(config("billing", "billing"), llm.clone(), ToolRegistry::new(), store);

        let mut registry = ToolRegistry::new();
        registry.register(specialist);
        let parent = ToolDispatcher::new(registry, 0)
            .with_timeout(Duration::from_millis(100))
            .with_retry(RetryPolicy::immediate(2));
        let calls = vec![ToolCall::new("c1", "billing", json!({"request": "is it paid?"}))];

        let outcome = parent
            .dispatch(&ToolContext::new("parent"), &calls, &[], &BTreeMap::new())
            .await;
        let crate::tools::DispatchOutcome::Completed(results) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(results[0].content, "invoice paid");
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_timed_out_specialist_is_not_rerun() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let llm = Arc::new(
            ScriptedLlmClient::replies(vec![LlmResponse::text("late")]).with_delay(Duration::from_millis(300)),
        );
        let mut cfg = config("billing", "billing");
        cfg.timeout = Some(Duration::from_millis(50));
        let specialist = Specialist::new(cfg, llm.clone(), ToolRegistry::new(), store);

        let mut registry = ToolRegistry::new();
        registry.register(specialist);
        let parent = ToolDispatcher::new(registry, 5).with_retry(RetryPolicy::immediate(3));
        let calls = vec![ToolCall::new("c1", "billing", json!({"request": "is it paid?"}))];

        let outcome = parent
            .dispatch(&ToolContext::new("parent"), &calls, &[], &BTreeMap::new())
            .await;
        let crate::tools::DispatchOutcome::Completed(results) = outcome else {
            panic!("expected completion");
        };
        assert!(results[0].content.starts_with("Error: Tool timeout: billing"));
        assert_eq!(results[0].role, Role::Tool);
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_invoke_releases_thread_sandbox() {
        let sandboxes = Arc::new(SandboxManager::local(Duration::from_secs(60)));
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let llm = Arc::new(ScriptedLlmClient::replies(vec![
            LlmResponse::with_tool_calls("", vec![ToolCall::new("c1", "code_exec", json!({"argv": ["true"]}))]),
            LlmResponse::text("ran"),
        ]));
        let mut tools = ToolRegistry::new();
        tools.register(crate::tools::CodeExecTool::new(sandboxes.clone()));
        let specialist = Specialist::new(config("coder", "coder"), llm, tools, store)
            .with_sandboxes(sandboxes.clone());

        assert_eq!(specialist.invoke("run it").await.unwrap(), "ran");
        assert_eq!(sandboxes.live_count().await, 0);
    }
}
