//! 中断 / 审批闸门
//!
//! 挂起不是内存中的阻塞：待审批的中断作为检查点的一部分落盘，
//! 因此 resolve 可以在任意时间（包括进程重启之后）由任意引擎实例完成，
//! 并从 ExecutingTools 阶段继续，而不会重新调用模型。

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;
use crate::memory::{Checkpoint, CheckpointStore, Message};

/// 中断类型（目前只有工具审批）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptKind {
    ToolApproval,
}

/// 对外的中断形态：`{type: "tool_approval", toolName, toolArgs}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interrupt {
    #[serde(rename = "type")]
    pub kind: InterruptKind,
    pub tool_name: String,
    pub tool_args: Value,
}

impl Interrupt {
    pub fn tool_approval(tool_name: impl Into<String>, tool_args: Value) -> Self {
        Self {
            kind: InterruptKind::ToolApproval,
            tool_name: tool_name.into(),
            tool_args,
        }
    }
}

/// 人工审批结果：`{approved, reason?}`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Decision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            reason: None,
        }
    }

    pub fn reject(reason: Option<String>) -> Self {
        Self {
            approved: false,
            reason,
        }
    }
}

/// 落盘的挂起状态：恢复所需的一切，不依赖进程内存
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingInterrupt {
    pub interrupt: Interrupt,
    /// 触发本轮工具调用的 assistant 消息（含全部 tool_calls）
    pub assistant: Message,
    /// 被拦下的调用 id
    pub gated_call_id: String,
    /// 挂起前已经拿到的工具结果（按 tool_call_id 复用，不会重复执行）
    #[serde(default)]
    pub completed: Vec<Message>,
    /// 本轮已作出的审批决定（call id -> Decision）
    #[serde(default)]
    pub decisions: BTreeMap<String, Decision>,
    /// 挂起前本轮已消耗的模型调用次数
    #[serde(default)]
    pub steps: usize,
}

/// 审批闸门：负责把挂起写入检查点，以及在 resolve 时取回
#[derive(Clone)]
pub struct ApprovalGate {
    store: Arc<dyn CheckpointStore>,
}

impl ApprovalGate {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    /// 持久化挂起；返回对外的 Interrupt
    pub async fn raise(
        &self,
        thread_id: &str,
        messages: Vec<Message>,
        pending: PendingInterrupt,
    ) -> Result<Interrupt, AgentError> {
        let interrupt = pending.interrupt.clone();
        let mut checkpoint = Checkpoint::new(thread_id, messages);
        checkpoint.pending_interrupt = Some(pending);
        self.store.save(&checkpoint).await?;
        tracing::info!(
            thread_id,
            tool = %interrupt.tool_name,
            "turn suspended awaiting approval"
        );
        Ok(interrupt)
    }

    /// 取出挂起并记录本次决定；线程没有挂起时返回 NoPendingInterrupt。
    /// 检查点本身不在此处改写，由引擎在本轮结束（完成或再次挂起）时统一写入。
    pub async fn take(
        &self,
        thread_id: &str,
        decision: Decision,
    ) -> Result<(Vec<Message>, PendingInterrupt), AgentError> {
        let checkpoint = self
            .store
            .load(thread_id)
            .await?
            .ok_or_else(|| AgentError::NoPendingInterrupt(thread_id.to_string()))?;
        let Checkpoint {
            messages,
            pending_interrupt,
            ..
        } = checkpoint;
        let mut pending =
            pending_interrupt.ok_or_else(|| AgentError::NoPendingInterrupt(thread_id.to_string()))?;
        tracing::info!(
            thread_id,
            tool = %pending.interrupt.tool_name,
            approved = decision.approved,
            "approval decision received"
        );
        pending
            .decisions
            .insert(pending.gated_call_id.clone(), decision);
        Ok((messages, pending))
    }

    /// 当前挂起（不修改状态）
    pub async fn pending(&self, thread_id: &str) -> Result<Option<Interrupt>, AgentError> {
        Ok(self
            .store
            .load(thread_id)
            .await?
            .and_then(|c| c.pending_interrupt)
            .map(|p| p.interrupt))
    }
}
