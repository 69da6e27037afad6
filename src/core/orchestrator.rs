//! 编排引擎
//!
//! 一个 Orchestrator 驱动一个智能体：按 thread_id 读取检查点、追加输入、运行 ReAct 循环，
//! 在本轮完成或挂起时写回检查点。轮次失败时不写入，检查点保持本轮之前的状态。
//! 同一 thread 的轮次由调用层串行化（见 gateway::TriggerRouter）。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::core::{AgentError, ApprovalGate, Decision, Interrupt};
use crate::llm::ToolSpec;
use crate::memory::{Checkpoint, CheckpointStore, Message};
use crate::react::{react_loop, resume_loop, Planner, ReactEvent, ReactSession, TurnEnd, MAX_REACT_STEPS};
use crate::sandbox::SandboxManager;
use crate::tools::{ToolContext, ToolDispatcher};

/// EXIT 之后的固定回复
pub const EXIT_MESSAGE: &str = "Session ended. Conversation history cleared.";

/// 一轮的对外结果
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed { output: String },
    Interrupted { interrupt: Interrupt },
}

impl TurnOutcome {
    pub fn output(&self) -> Option<&str> {
        match self {
            TurnOutcome::Completed { output } => Some(output),
            TurnOutcome::Interrupted { .. } => None,
        }
    }

    pub fn interrupt(&self) -> Option<&Interrupt> {
        match self {
            TurnOutcome::Interrupted { interrupt } => Some(interrupt),
            TurnOutcome::Completed { .. } => None,
        }
    }
}

/// EXIT / TERMINATE（忽略大小写与首尾空白）
pub fn is_exit_command(input: &str) -> bool {
    let t = input.trim();
    t.eq_ignore_ascii_case("EXIT") || t.eq_ignore_ascii_case("TERMINATE")
}

/// 编排引擎：Planner + ToolDispatcher + 检查点
pub struct Orchestrator {
    name: String,
    planner: Planner,
    dispatcher: ToolDispatcher,
    store: Arc<dyn CheckpointStore>,
    gate: ApprovalGate,
    max_steps: usize,
    event_tx: Option<UnboundedSender<ReactEvent>>,
    sandboxes: Option<Arc<SandboxManager>>,
}

impl Orchestrator {
    pub fn new(planner: Planner, dispatcher: ToolDispatcher, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            name: "assistant".to_string(),
            planner,
            dispatcher,
            gate: ApprovalGate::new(store.clone()),
            store,
            max_steps: MAX_REACT_STEPS,
            event_tx: None,
            sandboxes: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<ReactEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// EXIT 时一并终止该 thread 的沙箱
    pub fn with_sandboxes(mut self, sandboxes: Arc<SandboxManager>) -> Self {
        self.sandboxes = Some(sandboxes);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.dispatcher.specs()
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    fn session<'a>(&'a self, system: Option<&'a str>) -> ReactSession<'a> {
        ReactSession::new(&self.planner, &self.dispatcher)
            .with_max_steps(self.max_steps)
            .with_event_tx(self.event_tx.as_ref())
            .with_system_prompt(system)
    }

    /// 处理一条输入
    pub async fn run(&self, thread_id: &str, input: &str) -> Result<TurnOutcome, AgentError> {
        self.run_with_system(thread_id, input, None).await
    }

    /// 处理一条输入，本轮使用指定的 system prompt
    pub async fn run_with_system(
        &self,
        thread_id: &str,
        input: &str,
        system: Option<&str>,
    ) -> Result<TurnOutcome, AgentError> {
        if is_exit_command(input) {
            return self.exit(thread_id).await;
        }

        let checkpoint = self.store.load(thread_id).await?;
        if checkpoint.as_ref().is_some_and(|c| c.pending_interrupt.is_some()) {
            return Err(AgentError::InterruptPending(thread_id.to_string()));
        }
        let mut messages = checkpoint.map(|c| c.messages).unwrap_or_default();
        messages.push(Message::user(input));

        tracing::info!(agent = %self.name, thread_id, history = messages.len(), "turn started");
        let ctx = ToolContext::new(thread_id);
        let end = react_loop(&self.session(system), &ctx, messages).await?;
        self.finish(thread_id, end).await
    }

    /// 对挂起的审批作出决定并继续本轮；没有挂起时返回 NoPendingInterrupt
    pub async fn resolve(&self, thread_id: &str, decision: Decision) -> Result<TurnOutcome, AgentError> {
        let (messages, pending) = self.gate.take(thread_id, decision).await?;
        let ctx = ToolContext::new(thread_id);
        let end = resume_loop(&self.session(None), &ctx, messages, pending).await?;
        self.finish(thread_id, end).await
    }

    /// 清除 thread 的全部状态
    pub async fn exit(&self, thread_id: &str) -> Result<TurnOutcome, AgentError> {
        self.store.clear(thread_id).await?;
        if let Some(sandboxes) = &self.sandboxes {
            sandboxes.terminate(thread_id).await;
        }
        tracing::info!(agent = %self.name, thread_id, "thread cleared");
        Ok(TurnOutcome::Completed {
            output: EXIT_MESSAGE.to_string(),
        })
    }

    async fn finish(&self, thread_id: &str, end: TurnEnd) -> Result<TurnOutcome, AgentError> {
        match end {
            TurnEnd::Done { messages, response } => {
                self.store.save(&Checkpoint::new(thread_id, messages)).await?;
                let (prompt_tokens, completion_tokens, total_tokens) = self.planner.token_usage();
                tracing::info!(
                    agent = %self.name,
                    thread_id,
                    prompt_tokens,
                    completion_tokens,
                    total_tokens,
                    "turn completed"
                );
                Ok(TurnOutcome::Completed { output: response })
            }
            TurnEnd::Suspended { messages, pending } => {
                let interrupt = self.gate.raise(thread_id, messages, pending).await?;
                Ok(TurnOutcome::Interrupted { interrupt })
            }
        }
    }

    /// 已持久化的历史
    pub async fn history(&self, thread_id: &str) -> Result<Vec<Message>, AgentError> {
        Ok(self
            .store
            .load(thread_id)
            .await?
            .map(|c| c.messages)
            .unwrap_or_default())
    }

    /// 当前待审批的中断
    pub async fn pending(&self, thread_id: &str) -> Result<Option<Interrupt>, AgentError> {
        self.gate.pending(thread_id).await
    }

    /// 保留策略：删除超过 max_age 未更新的检查点
    pub async fn prune(&self, max_age: Duration) -> Result<usize, AgentError> {
        self.store.prune_older_than(max_age).await
    }
}
