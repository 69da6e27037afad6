//! 工具调用 JSON Schema 生成（schemars）
//!
//! 用于将「合法 tool call」的 JSON 结构注入 system prompt，减少 LLM 输出格式错误。
//! 只会输出文本的后端依赖这段协议说明，解析见 react::planner::parse_llm_output。

use std::collections::HashMap;

use schemars::{schema_for, JsonSchema};

use crate::llm::ToolSpec;

/// 单个调用：`{"tool": "...", "args": {...}}`（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 工具名，必须是 Available tools 中的一个
    pub tool: String,
    /// 工具参数，结构见对应工具的 parameters
    pub args: HashMap<String, serde_json::Value>,
}

/// 同一步并行发起多个调用：`{"tool_calls": [...]}`
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallsFormat {
    pub tool_calls: Vec<ToolCallFormat>,
}

/// 返回工具调用的 JSON Schema 字符串，可拼入 system prompt
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallsFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 生成文本协议说明：可用工具列表 + 输出格式
pub fn tool_protocol_prompt(tools: &[ToolSpec]) -> String {
    let listing = serde_json::to_string_pretty(tools).unwrap_or_else(|_| "[]".to_string());
    format!(
        "## Available tools\n{listing}\n\n\
         ## Calling tools\n\
         To call one tool, reply with a JSON object {{\"tool\": \"<name>\", \"args\": {{...}}}}.\n\
         To call several tools in the same step, reply with {{\"tool_calls\": [{{\"tool\": ..., \"args\": ...}}, ...]}}.\n\
         The calls must match this schema:\n{schema}\n\
         Tool results come back as messages starting with \"Observation [<call id>]:\".\n\
         When no tool is needed, answer in plain text without any JSON.",
        listing = listing,
        schema = tool_call_schema_json(),
    )
}
