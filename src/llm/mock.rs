//! Mock LLM 客户端（用于测试，无需 API）
//!
//! MockLlmClient：对最后一条 User 消息发起一次 echo 工具调用，拿到工具结果后给出最终回复，
//! 便于本地跑通完整的工具回路。ScriptedLlmClient：按预设脚本逐条返回，用于测试。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::llm::{LlmClient, LlmError, LlmResponse, ToolSpec};
use crate::memory::{Message, Role, ToolCall};

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<LlmResponse, LlmError> {
        if let Some(last) = messages.last() {
            if last.role == Role::Tool {
                return Ok(LlmResponse::text(last.content.clone()));
            }
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        if !tools.iter().any(|t| t.name == "echo") {
            return Ok(LlmResponse::text(format!("Echo from Mock: {}", last_user)));
        }

        Ok(LlmResponse::with_tool_calls(
            "",
            vec![ToolCall::new(
                format!("call_{}", uuid::Uuid::new_v4().simple()),
                "echo",
                json!({ "text": format!("Echo from Mock: {}", last_user) }),
            )],
        ))
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

/// 一条脚本：回复或错误，可带人为延迟
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Reply(LlmResponse),
    Fail(LlmError),
}

/// 按脚本回复的客户端；脚本耗尽后重复 fallback（默认返回 "done"）
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<ScriptStep>>,
    fallback: ScriptStep,
    delay: Duration,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            fallback: ScriptStep::Reply(LlmResponse::text("done")),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// 只返回回复的脚本
    pub fn replies(responses: impl IntoIterator<Item = LlmResponse>) -> Self {
        Self::new(responses.into_iter().map(ScriptStep::Reply))
    }

    /// 每次调用都返回同一个错误
    pub fn always_failing(error: LlmError) -> Self {
        let mut client = Self::new(Vec::new());
        client.fallback = ScriptStep::Fail(error);
        client
    }

    pub fn with_fallback(mut self, fallback: ScriptStep) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// complete 被调用的次数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 每次调用时收到的完整消息列表
    pub fn seen_messages(&self) -> Vec<Vec<Message>> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message], _tools: &[ToolSpec]) -> Result<LlmResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(messages.to_vec());
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let step = self
            .script
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .unwrap_or_else(|| self.fallback.clone());
        match step {
            ScriptStep::Reply(r) => Ok(r),
            ScriptStep::Fail(e) => Err(e),
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}
