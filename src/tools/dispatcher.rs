//! 工具分发器
//!
//! 持有 ToolRegistry、单次调用超时与工具重试预算。dispatch 处理模型一步内的全部调用：
//! 已有结果的调用直接复用，未知工具、被拒绝的调用直接生成文本结果，其余并发执行后按原顺序合并；
//! 第一个尚无审批决定的受限调用使本步挂起。每次执行输出结构化审计日志（JSON）。
//! 审批通过的调用只执行一次，不走重试预算；工具可以声明自己的超时与是否可重试。

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::time::timeout;

use crate::core::retry::{with_retry, RetryPolicy};
use crate::core::{AgentError, Decision};
use crate::llm::ToolSpec;
use crate::memory::{Message, ToolCall};
use crate::tools::{ToolContext, ToolRegistry};

/// 一步工具调用的结果
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// 全部调用都有结果（tool 消息，顺序与调用一致）
    Completed(Vec<Message>),
    /// 遇到需要审批的调用；completed 为本步已拿到的结果
    Interrupted {
        call: ToolCall,
        completed: Vec<Message>,
    },
}

/// 拒绝时回给模型的文本
pub fn rejection_message(tool_name: &str, reason: Option<&str>) -> String {
    format!(
        "Tool '{}' was rejected by the reviewer: {}",
        tool_name,
        reason.filter(|r| !r.trim().is_empty()).unwrap_or("no reason given")
    )
}

enum Slot {
    Ready(String),
    Run(usize),
    Deferred,
}

/// 待执行的调用；approved 表示经过人工审批
struct Pending<'a> {
    call: &'a ToolCall,
    approved: bool,
}

/// 工具分发器
#[derive(Clone)]
pub struct ToolDispatcher {
    registry: ToolRegistry,
    timeout: Duration,
    retry: RetryPolicy,
}

impl ToolDispatcher {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
            retry: RetryPolicy::new(2),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.registry.specs()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    /// 分发一步内的调用。completed 中按 tool_call_id 已有结果的调用不会再次执行；
    /// decisions 为受限调用的审批结果（call id -> Decision）。
    pub async fn dispatch(
        &self,
        ctx: &ToolContext,
        calls: &[ToolCall],
        completed: &[Message],
        decisions: &BTreeMap<String, Decision>,
    ) -> DispatchOutcome {
        let mut slots = Vec::with_capacity(calls.len());
        let mut to_run: Vec<Pending> = Vec::new();
        let mut gated: Option<&ToolCall> = None;

        for call in calls {
            if let Some(done) = completed
                .iter()
                .find(|m| m.tool_call_id.as_deref() == Some(call.id.as_str()))
            {
                slots.push(Slot::Ready(done.content.clone()));
                continue;
            }
            if self.registry.get(&call.name).is_none() {
                tracing::warn!(tool = %call.name, "model requested unknown tool");
                slots.push(Slot::Ready(format!("Unknown tool: {}", call.name)));
                continue;
            }
            let mut approved = false;
            if self.registry.requires_approval(&call.name) {
                match decisions.get(&call.id) {
                    Some(d) if !d.approved => {
                        slots.push(Slot::Ready(rejection_message(&call.name, d.reason.as_deref())));
                        continue;
                    }
                    Some(_) => approved = true,
                    None => {
                        if gated.is_none() {
                            gated = Some(call);
                        }
                        slots.push(Slot::Deferred);
                        continue;
                    }
                }
            }
            slots.push(Slot::Run(to_run.len()));
            to_run.push(Pending { call, approved });
        }

        let mut outputs: Vec<Option<String>> =
            join_all(to_run.iter().map(|p| self.execute_call(ctx, p.call, p.approved)))
                .await
                .into_iter()
                .map(Some)
                .collect();

        let mut results = Vec::with_capacity(calls.len());
        for (call, slot) in calls.iter().zip(slots) {
            let content = match slot {
                Slot::Ready(content) => content,
                Slot::Run(i) => outputs[i].take().unwrap_or_default(),
                Slot::Deferred => continue,
            };
            results.push(Message::tool_result(&call.id, content));
        }

        match gated {
            Some(call) => DispatchOutcome::Interrupted {
                call: call.clone(),
                completed: results,
            },
            None => DispatchOutcome::Completed(results),
        }
    }

    /// 执行单个调用；失败折叠为 "Error: ..." 文本。
    /// 审批通过的调用与声明不可重试的工具只执行一次，其余按工具重试预算重试瞬时错误。
    async fn execute_call(&self, ctx: &ToolContext, call: &ToolCall, approved: bool) -> String {
        let retryable = !approved && self.registry.get(&call.name).is_some_and(|t| t.retryable());
        let result = if retryable {
            with_retry(&self.retry, AgentError::is_transient, || self.execute_once(ctx, call)).await
        } else {
            self.execute_once(ctx, call).await
        };
        match result {
            Ok(content) => content,
            Err(AgentError::ToolExecutionFailed(msg)) => format!("Error: {}", msg),
            Err(e) => format!("Error: {}", e),
        }
    }

    /// 单次执行：超时返回 ToolTimeout，工具返回 Err 转为 ToolExecutionFailed；输出 JSON 审计日志
    async fn execute_once(&self, ctx: &ToolContext, call: &ToolCall) -> Result<String, AgentError> {
        let tool = self
            .registry
            .get(&call.name)
            .ok_or_else(|| AgentError::ToolExecutionFailed(format!("Unknown tool: {}", call.name)))?;

        let limit = tool.timeout().unwrap_or(self.timeout);
        let start = Instant::now();
        let result = timeout(limit, tool.execute(ctx, call.arguments.clone())).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "thread_id": ctx.thread_id,
            "call_id": call.id,
            "tool": call.name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&call.arguments),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(e)) => Err(AgentError::ToolExecutionFailed(e)),
            Err(_) => Err(AgentError::ToolTimeout(format!(
                "{} did not finish within {:?}",
                call.name, limit
            ))),
        }
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
