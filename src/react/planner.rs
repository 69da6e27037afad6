//! Planner：调用模型与 Tool Call 解析
//!
//! Planner 把 system prompt 拼到历史前面后调用 LLM，外层套模型重试预算；
//! parse_llm_output 用于只会输出文本的后端：从文本中提取 JSON 并解析为一个或多个 ToolCall。

use std::sync::Arc;

use serde::Deserialize;

use crate::core::retry::{with_retry, RetryPolicy};
use crate::core::AgentError;
use crate::llm::{LlmClient, LlmError, LlmResponse, ToolSpec};
use crate::memory::{Message, ToolCall};

/// 文本协议中的单个调用：{"tool": "cat", "args": {...}, "id"?: "..."}
#[derive(Debug, Clone, Deserialize)]
struct TextToolCall {
    #[serde(default)]
    id: Option<String>,
    tool: String,
    #[serde(default)]
    args: serde_json::Value,
}

/// 多个调用：{"tool_calls": [...]}
#[derive(Debug, Clone, Deserialize)]
struct TextToolCalls {
    tool_calls: Vec<TextToolCall>,
}

fn new_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

fn into_tool_calls(calls: Vec<TextToolCall>) -> Vec<ToolCall> {
    calls
        .into_iter()
        .filter(|c| !c.tool.is_empty())
        .map(|c| ToolCall::new(c.id.unwrap_or_else(new_call_id), c.tool, c.args))
        .collect()
}

/// 解析 LLM 文本输出：含有效 JSON 调用则返回 tool_calls（JSON 之前的文字保留为 text），否则整段为回复
pub fn parse_llm_output(output: &str) -> Result<LlmResponse, LlmError> {
    let trimmed = output.trim();

    // 尝试提取 JSON 块（```json ... ``` 或纯 JSON）
    let (prefix, json_str) = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        let body = rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim());
        (&trimmed[..start], body)
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end <= start {
            return Ok(LlmResponse::text(trimmed));
        }
        (&trimmed[..start], &trimmed[start..=end])
    } else {
        return Ok(LlmResponse::text(trimmed));
    };

    let value: serde_json::Value = serde_json::from_str(json_str)
        .map_err(|e| LlmError::InvalidResponse(format!("{}: {}", e, json_str)))?;

    let calls = if value.get("tool_calls").is_some() {
        let parsed: TextToolCalls = serde_json::from_value(value)
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        into_tool_calls(parsed.tool_calls)
    } else if value.get("tool").is_some() {
        let parsed: TextToolCall = serde_json::from_value(value)
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        into_tool_calls(vec![parsed])
    } else {
        Vec::new()
    };

    if calls.is_empty() {
        Ok(LlmResponse::text(trimmed))
    } else {
        Ok(LlmResponse::with_tool_calls(prefix.trim(), calls))
    }
}

type RetryClassifier = Arc<dyn Fn(&LlmError) -> bool + Send + Sync>;

/// Planner：持有 LLM、system prompt 与模型重试预算
#[derive(Clone)]
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
    retry: RetryPolicy,
    retry_on: RetryClassifier,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
            retry: RetryPolicy::default(),
            retry_on: Arc::new(LlmError::is_transient),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// 自定义瞬时错误判定（默认 LlmError::is_transient）
    pub fn with_retry_on(mut self, retry_on: impl Fn(&LlmError) -> bool + Send + Sync + 'static) -> Self {
        self.retry_on = Arc::new(retry_on);
        self
    }

    pub fn base_system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    /// 使用指定 system（如专家按上下文渲染出的 prompt）；重试耗尽后原样返回最后一次 LlmError
    pub async fn plan_with_system(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        system: &str,
    ) -> Result<LlmResponse, AgentError> {
        let mut full_messages = Vec::with_capacity(messages.len() + 1);
        if !system.is_empty() {
            full_messages.push(Message::system(system.to_string()));
        }
        full_messages.extend_from_slice(messages);

        let llm = &self.llm;
        let full_messages = &full_messages;
        with_retry(&self.retry, |e: &LlmError| (self.retry_on)(e), || async move {
            llm.complete(full_messages, tools).await
        })
        .await
        .map_err(AgentError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_text() {
        let r = parse_llm_output("The answer is 4.").unwrap();
        assert_eq!(r.text, "The answer is 4.");
        assert!(r.tool_calls.is_empty());
    }

    #[test]
    fn test_parse_single_call_with_thought() {
        let r = parse_llm_output(r#"Let me check. {"tool": "echo", "args": {"text": "hi"}}"#).unwrap();
        assert_eq!(r.text, "Let me check.");
        assert_eq!(r.tool_calls.len(), 1);
        assert_eq!(r.tool_calls[0].name, "echo");
        assert!(r.tool_calls[0].id.starts_with("call_"));
    }

    #[test]
    fn test_parse_multiple_calls_in_fence() {
        let out = "```json\n{\"tool_calls\": [{\"tool\": \"a\", \"args\": {}}, {\"id\": \"x\", \"tool\": \"b\"}]}\n```";
        let r = parse_llm_output(out).unwrap();
        let names: Vec<_> = r.tool_calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(r.tool_calls[1].id, "x");
    }

    #[test]
    fn test_parse_json_without_tool_is_text() {
        let r = parse_llm_output(r#"{"answer": 42}"#).unwrap();
        assert!(r.tool_calls.is_empty());
    }

    #[test]
    fn test_parse_broken_json_is_error() {
        assert!(matches!(
            parse_llm_output(r#"{"tool": "echo", "args": }"#),
            Err(LlmError::InvalidResponse(_))
        ));
    }
}
