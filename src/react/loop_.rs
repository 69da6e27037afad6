//! ReAct 主循环
//!
//! Plan -> Act (Tool) -> Observe -> 下一轮 Plan，直到模型不再请求工具或到达最大步数。
//! 受限工具没有审批决定时返回 Suspended，由调用方持久化；resume_loop 从挂起的那一步继续，
//! 不重新调用模型，也不会重复执行已拿到结果的调用。
//! 可选 event_tx：向前端推送 Thinking / ToolCall / Observation / Interrupted / MessageDone。

use std::collections::BTreeMap;

use tokio::sync::mpsc::UnboundedSender;

use crate::core::{AgentError, Decision, Interrupt, PendingInterrupt};
use crate::memory::Message;
use crate::react::{Planner, ReactEvent};
use crate::tools::{DispatchOutcome, ToolContext, ToolDispatcher};

/// 单轮默认最大 ReAct 步数，防止死循环
pub const MAX_REACT_STEPS: usize = 20;
/// 模型最终回复为空时使用的文本
pub const NO_RESPONSE: &str = "No response generated.";
/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;

/// 一轮的结局
#[derive(Debug)]
pub enum TurnEnd {
    /// 模型给出最终回复；messages 已包含该回复
    Done {
        messages: Vec<Message>,
        response: String,
    },
    /// 等待审批；messages 不含挂起那一步的 assistant 消息（在 pending 中）
    Suspended {
        messages: Vec<Message>,
        pending: PendingInterrupt,
    },
}

/// ReAct 会话配置
pub struct ReactSession<'a> {
    pub planner: &'a Planner,
    pub dispatcher: &'a ToolDispatcher,
    pub max_steps: usize,
    /// 可选：事件推送通道
    pub event_tx: Option<&'a UnboundedSender<ReactEvent>>,
    /// 可选：覆盖系统提示词（专家按上下文渲染的 prompt）
    pub system_prompt_override: Option<&'a str>,
}

impl<'a> ReactSession<'a> {
    pub fn new(planner: &'a Planner, dispatcher: &'a ToolDispatcher) -> Self {
        Self {
            planner,
            dispatcher,
            max_steps: MAX_REACT_STEPS,
            event_tx: None,
            system_prompt_override: None,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn with_event_tx(mut self, tx: Option<&'a UnboundedSender<ReactEvent>>) -> Self {
        self.event_tx = tx;
        self
    }

    pub fn with_system_prompt(mut self, prompt: Option<&'a str>) -> Self {
        self.system_prompt_override = prompt;
        self
    }

    fn send(&self, ev: ReactEvent) {
        if let Some(tx) = self.event_tx {
            let _ = tx.send(ev);
        }
    }
}

fn preview(s: &str) -> String {
    if s.chars().count() > OBSERVATION_PREVIEW_CHARS {
        format!("{}...", s.chars().take(OBSERVATION_PREVIEW_CHARS).collect::<String>())
    } else {
        s.to_string()
    }
}

/// 新的一轮：messages 末尾应已是本轮的 user 消息
pub async fn react_loop(
    session: &ReactSession<'_>,
    ctx: &ToolContext,
    messages: Vec<Message>,
) -> Result<TurnEnd, AgentError> {
    drive(session, ctx, messages, None).await
}

/// 从挂起处继续：pending.decisions 中应已记录对 gated_call_id 的决定
pub async fn resume_loop(
    session: &ReactSession<'_>,
    ctx: &ToolContext,
    messages: Vec<Message>,
    pending: PendingInterrupt,
) -> Result<TurnEnd, AgentError> {
    drive(session, ctx, messages, Some(pending)).await
}

async fn drive(
    session: &ReactSession<'_>,
    ctx: &ToolContext,
    mut messages: Vec<Message>,
    mut resume: Option<PendingInterrupt>,
) -> Result<TurnEnd, AgentError> {
    let thread_id = ctx.thread_id.clone();
    let specs = session.dispatcher.specs();
    let system = session
        .system_prompt_override
        .unwrap_or_else(|| session.planner.base_system_prompt());
    let mut steps = resume.as_ref().map(|p| p.steps).unwrap_or(0);

    loop {
        let (assistant, completed, decisions): (Message, Vec<Message>, BTreeMap<String, Decision>) =
            match resume.take() {
                Some(p) => (p.assistant, p.completed, p.decisions),
                None => {
                    if steps >= session.max_steps {
                        tracing::warn!(thread_id = %thread_id, steps, "step limit reached");
                        let response = format!(
                            "Stopped after reaching the step limit ({} model calls) without a final answer.",
                            session.max_steps
                        );
                        messages.push(Message::assistant(response.clone()));
                        return Ok(TurnEnd::Done { messages, response });
                    }
                    steps += 1;
                    session.send(ReactEvent::StepUpdate {
                        thread_id: thread_id.clone(),
                        step: steps,
                        max_steps: session.max_steps,
                    });
                    session.send(ReactEvent::Thinking {
                        thread_id: thread_id.clone(),
                    });

                    let reply = session.planner.plan_with_system(&messages, &specs, system).await?;

                    if reply.tool_calls.is_empty() {
                        let response = if reply.text.trim().is_empty() {
                            NO_RESPONSE.to_string()
                        } else {
                            reply.text
                        };
                        messages.push(Message::assistant(response.clone()));
                        session.send(ReactEvent::MessageDone {
                            thread_id: thread_id.clone(),
                            text: response.clone(),
                        });
                        return Ok(TurnEnd::Done { messages, response });
                    }

                    if !reply.text.trim().is_empty() {
                        session.send(ReactEvent::ThinkingContent {
                            thread_id: thread_id.clone(),
                            text: reply.text.clone(),
                        });
                    }
                    for call in &reply.tool_calls {
                        session.send(ReactEvent::ToolCall {
                            thread_id: thread_id.clone(),
                            tool: call.name.clone(),
                            args: call.arguments.clone(),
                        });
                    }
                    (
                        Message::assistant_with_tools(reply.text, reply.tool_calls),
                        Vec::new(),
                        BTreeMap::new(),
                    )
                }
            };

        match session
            .dispatcher
            .dispatch(ctx, &assistant.tool_calls, &completed, &decisions)
            .await
        {
            DispatchOutcome::Completed(results) => {
                for r in &results {
                    session.send(ReactEvent::Observation {
                        thread_id: thread_id.clone(),
                        call_id: r.tool_call_id.clone().unwrap_or_default(),
                        preview: preview(&r.content),
                    });
                }
                messages.push(assistant);
                messages.extend(results);
            }
            DispatchOutcome::Interrupted { call, completed } => {
                session.send(ReactEvent::Interrupted {
                    thread_id: thread_id.clone(),
                    tool: call.name.clone(),
                    args: call.arguments.clone(),
                });
                let pending = PendingInterrupt {
                    interrupt: Interrupt::tool_approval(call.name, call.arguments),
                    assistant,
                    gated_call_id: call.id,
                    completed,
                    decisions,
                    steps,
                };
                return Ok(TurnEnd::Suspended { messages, pending });
            }
        }
    }
}
