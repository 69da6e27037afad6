//! ReAct 过程事件：用于流式展示思考、工具调用、观察、挂起与回复

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReactEvent {
    /// ReAct 步数更新（当前第几次调用模型）
    StepUpdate {
        thread_id: String,
        step: usize,
        max_steps: usize,
    },
    /// 正在调用 LLM 思考
    Thinking { thread_id: String },
    /// 模型在发起工具调用前给出的文字
    ThinkingContent { thread_id: String, text: String },
    /// 调用工具
    ToolCall {
        thread_id: String,
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    Observation {
        thread_id: String,
        call_id: String,
        preview: String,
    },
    /// 等待人工审批
    Interrupted {
        thread_id: String,
        tool: String,
        args: serde_json::Value,
    },
    /// 最终回复
    MessageDone { thread_id: String, text: String },
}
