//! 网关：外部会话（聊天平台、命令行）与编排引擎之间的边界
//!
//! 平台适配器负责收发与渲染，这里只负责：选智能体、按 thread 串行化、
//! 识别旁白、把结果与错误转成 Reply。

mod router;

pub use router::{is_aside, AgentRoutes, Reply, TriggerRouter};
