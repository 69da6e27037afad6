//! Swarm - 可持久化、可恢复的多智能体编排引擎
//!
//! 模块划分：
//! - **agent**: 运行时装配（由配置构建 LLM、存储、沙箱、专家与路由）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误、重试、审批中断、编排引擎
//! - **gateway**: 外部会话边界（频道路由、thread 串行化、回复渲染）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **memory**: 消息模型与检查点存储（内存 / 文件 / SQLite）
//! - **react**: Planner 与 ReAct 主循环
//! - **sandbox**: 按 thread 管理的代码执行沙箱
//! - **tools**: Tool trait、分发器、内置工具与专家委派

pub mod agent;
pub mod config;
pub mod core;
pub mod gateway;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod sandbox;
pub mod tools;

pub use crate::core::{AgentError, Decision, Interrupt, Orchestrator, TurnOutcome};
