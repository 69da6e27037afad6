//! 触发路由：把外部会话的一条消息 / 一个审批决定变成一次引擎调用
//!
//! - 频道到智能体的映射（AgentRoutes），运行时可改
//! - 同一 thread 的轮次串行执行（每个 thread 一把 tokio Mutex），不同 thread 并发
//! - 旁白消息（`!aside ...` / `(aside) ...`）直接忽略
//! - 挂起渲染为审批请求，错误渲染为通用的失败文本

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use tokio::sync::Mutex;

use crate::config::RoutingSection;
use crate::core::{AgentError, Decision, Interrupt, Orchestrator, TurnOutcome};

/// 回给外部会话的内容
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text(String),
    /// 需要人工批准 / 拒绝
    ApprovalRequest { thread_id: String, interrupt: Interrupt },
    /// 不需要回复（旁白、空消息）
    Ignored,
}

/// 频道 -> 智能体名；未配置的频道使用 default_agent
#[derive(Debug)]
pub struct AgentRoutes {
    default_agent: String,
    channels: RwLock<HashMap<String, String>>,
}

impl AgentRoutes {
    pub fn new(default_agent: impl Into<String>) -> Self {
        Self {
            default_agent: default_agent.into(),
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(cfg: &RoutingSection) -> Self {
        Self {
            default_agent: cfg.default_agent.clone(),
            channels: RwLock::new(cfg.channels.clone()),
        }
    }

    pub fn default_agent(&self) -> &str {
        &self.default_agent
    }

    pub fn agent_for(&self, channel: &str) -> String {
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(channel)
            .cloned()
            .unwrap_or_else(|| self.default_agent.clone())
    }

    pub fn set_route(&self, channel: impl Into<String>, agent: impl Into<String>) {
        self.channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(channel.into(), agent.into());
    }

    pub fn remove_route(&self, channel: &str) -> Option<String> {
        self.channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(channel)
    }
}

/// 旁白：不希望智能体回应的消息
pub fn is_aside(text: &str) -> bool {
    let lower = text.trim_start().to_lowercase();
    lower.starts_with("!aside")
        || lower
            .strip_prefix("(aside")
            .is_some_and(|rest| rest.trim_start().starts_with(')'))
}

/// 触发路由
pub struct TriggerRouter {
    agents: HashMap<String, Arc<Orchestrator>>,
    routes: AgentRoutes,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    retention: Duration,
}

impl TriggerRouter {
    pub fn new(routes: AgentRoutes) -> Self {
        Self {
            agents: HashMap::new(),
            routes,
            locks: StdMutex::new(HashMap::new()),
            retention: Duration::from_secs(30 * 24 * 3600),
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// 按引擎名注册
    pub fn register_agent(&mut self, agent: Arc<Orchestrator>) {
        self.agents.insert(agent.name().to_string(), agent);
    }

    pub fn routes(&self) -> &AgentRoutes {
        &self.routes
    }

    pub fn agent_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }

    fn agent(&self, channel: &str) -> Result<&Arc<Orchestrator>, AgentError> {
        let name = self.routes.agent_for(channel);
        self.agents
            .get(&name)
            .or_else(|| self.agents.get(self.routes.default_agent()))
            .ok_or_else(|| AgentError::ConfigError(format!("no agent registered for '{}'", name)))
    }

    fn thread_lock(&self, thread_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(thread_id.to_string()).or_default().clone()
    }

    /// 处理一条入站消息
    pub async fn handle_message(&self, channel: &str, thread_id: &str, text: &str) -> Reply {
        if text.trim().is_empty() || is_aside(text) {
            return Reply::Ignored;
        }
        let agent = match self.agent(channel) {
            Ok(a) => a,
            Err(e) => return render_error(thread_id, e),
        };
        let lock = self.thread_lock(thread_id);
        let _guard = lock.lock().await;
        match agent.run(thread_id, text).await {
            Ok(outcome) => render_outcome(thread_id, outcome),
            Err(e) => render_error(thread_id, e),
        }
    }

    /// 处理审批按钮
    pub async fn handle_decision(&self, channel: &str, thread_id: &str, decision: Decision) -> Reply {
        let agent = match self.agent(channel) {
            Ok(a) => a,
            Err(e) => return render_error(thread_id, e),
        };
        let lock = self.thread_lock(thread_id);
        let _guard = lock.lock().await;
        match agent.resolve(thread_id, decision).await {
            Ok(outcome) => render_outcome(thread_id, outcome),
            Err(e) => render_error(thread_id, e),
        }
    }

    /// 按保留期清理所有智能体的过期检查点
    pub async fn prune_stale(&self) -> Result<usize, AgentError> {
        let mut removed = 0;
        for agent in self.agents.values() {
            removed += agent.prune(self.retention).await?;
        }
        // 释放空闲 thread 的锁（只有这里持有引用时）
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, lock| Arc::strong_count(lock) > 1);
        if removed > 0 {
            tracing::info!(removed, "stale checkpoints pruned");
        }
        Ok(removed)
    }
}

fn render_outcome(thread_id: &str, outcome: TurnOutcome) -> Reply {
    match outcome {
        TurnOutcome::Completed { output } => Reply::Text(output),
        TurnOutcome::Interrupted { interrupt } => Reply::ApprovalRequest {
            thread_id: thread_id.to_string(),
            interrupt,
        },
    }
}

fn render_error(thread_id: &str, e: AgentError) -> Reply {
    if e.is_user_facing() {
        return Reply::Text(e.to_string());
    }
    tracing::error!(thread_id, error = %e, "turn failed");
    Reply::Text(format!("Error: {}", e))
}
