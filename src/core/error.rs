//! Agent 错误类型
//!
//! 只有基础设施层错误（检查点不可用、模型重试耗尽、配置错误）会越过编排引擎边界；
//! 工具侧的失败在分发器内被折叠为 tool 消息，不会以 AgentError 的形式冒泡。

use thiserror::Error;

use crate::core::retry::looks_transient;
use crate::llm::LlmError;

/// Agent 运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    LlmError(#[from] LlmError),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    /// 检查点存储不可读写
    #[error("Checkpoint store error: {0}")]
    Checkpoint(String),

    /// 线程仍有待审批的中断，必须先 resolve
    #[error("Thread '{0}' is waiting for an approval decision")]
    InterruptPending(String),

    #[error("Thread '{0}' has no pending approval")]
    NoPendingInterrupt(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl AgentError {
    /// 默认的重试分类：限流、网络抖动、工具超时视为瞬时错误
    pub fn is_transient(&self) -> bool {
        match self {
            AgentError::LlmError(e) => e.is_transient(),
            AgentError::ToolTimeout(_) => true,
            AgentError::ToolExecutionFailed(msg) => looks_transient(msg),
            _ => false,
        }
    }

    /// 调用方可以直接展示给用户、无需视为系统故障的错误
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            AgentError::InterruptPending(_) | AgentError::NoPendingInterrupt(_)
        )
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Checkpoint(format!("serialization failed: {e}"))
    }
}
