//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找；
//! 注册时可声明该工具需要人工审批，ToolDispatcher 据此决定是否挂起。

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::ToolSpec;

/// 一次调用的上下文：所属 thread（沙箱等按 thread 隔离的资源用它做键）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolContext {
    pub thread_id: String,
}

impl ToolContext {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
        }
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（用于 JSON 中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认空对象，表示参数格式不限
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 单次调用的超时；None 使用分发器的默认值
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// 失败后能否自动重试；重放会重复副作用的工具返回 false
    fn retryable(&self) -> bool {
        true
    }

    /// 执行工具；Err 为工具自身的失败，会被折叠为 "Error: ..." 文本回给模型
    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<String, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>，另记需要审批的工具名
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    gated: HashSet<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// 注册并要求每次调用前人工审批
    pub fn register_gated(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.register(tool);
        self.gated.insert(name);
    }

    /// 把已注册（或稍后注册）的工具标记为需要审批
    pub fn require_approval(&mut self, name: impl Into<String>) {
        self.gated.insert(name.into());
    }

    pub fn requires_approval(&self, name: &str) -> bool {
        self.gated.contains(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 只保留 names 中列出的工具（专家的受限工具集）
    pub fn subset(&self, names: &[String]) -> Self {
        let tools = self
            .tools
            .iter()
            .filter(|(name, _)| names.iter().any(|n| n == *name))
            .map(|(name, tool)| (name.clone(), tool.clone()))
            .collect();
        let gated = self
            .gated
            .iter()
            .filter(|name| names.iter().any(|n| n == *name))
            .cloned()
            .collect();
        Self { tools, gated }
    }

    /// 暴露给模型的工具描述（按名称排序，保证 prompt 稳定）
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .values()
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }
}
