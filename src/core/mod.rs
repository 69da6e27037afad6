//! 核心编排层：错误、重试、审批中断与编排引擎

pub mod error;
pub mod interrupt;
pub mod orchestrator;
pub mod retry;

pub use error::AgentError;
pub use interrupt::{ApprovalGate, Decision, Interrupt, InterruptKind, PendingInterrupt};
pub use orchestrator::{is_exit_command, Orchestrator, TurnOutcome, EXIT_MESSAGE};
pub use retry::{looks_transient, with_retry, RetryPolicy};
