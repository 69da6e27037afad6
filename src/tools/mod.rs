//! 工具层：Tool trait 与注册表、分发器、内置工具（echo / code_exec）与专家委派

pub mod code_exec;
pub mod dispatcher;
pub mod echo;
pub mod registry;
pub mod schema;
pub mod specialist;

pub use code_exec::CodeExecTool;
pub use dispatcher::{rejection_message, DispatchOutcome, ToolDispatcher};
pub use echo::EchoTool;
pub use registry::{Tool, ToolContext, ToolRegistry};
pub use schema::{tool_call_schema_json, tool_protocol_prompt};
pub use specialist::{render_prompt, ContextProvider, Specialist, SpecialistConfig};
