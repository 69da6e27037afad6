//! 引擎端到端测试：审批挂起与恢复、拒绝、EXIT、重试预算、工具顺序、沙箱唯一性

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use swarm::core::{AgentError, Decision, Orchestrator, RetryPolicy, EXIT_MESSAGE};
use swarm::gateway::{AgentRoutes, Reply, TriggerRouter};
use swarm::llm::{LlmError, LlmResponse, MockLlmClient, ScriptedLlmClient};
use swarm::memory::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, Role, ToolCall};
use swarm::react::Planner;
use swarm::sandbox::{ExecResult, SandboxBackend, SandboxManager, SandboxProvider};
use swarm::tools::{EchoTool, Specialist, SpecialistConfig, Tool, ToolContext, ToolDispatcher, ToolRegistry};

/// 记录执行次数的工具
struct CountingTool {
    name: &'static str,
    delay: Duration,
    runs: Arc<AtomicUsize>,
}

impl CountingTool {
    fn new(name: &'static str, delay_ms: u64) -> (Self, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        (
            Self {
                name,
                delay: Duration::from_millis(delay_ms),
                runs: runs.clone(),
            },
            runs,
        )
    }
}

#[async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Counts its executions"
    }

    async fn execute(&self, _ctx: &ToolContext, _args: Value) -> Result<String, String> {
        tokio::time::sleep(self.delay).await;
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{} finished", self.name))
    }
}

fn engine_with(llm: Arc<dyn swarm::llm::LlmClient>, registry: ToolRegistry, store: Arc<dyn CheckpointStore>) -> Orchestrator {
    Orchestrator::new(
        Planner::new(llm, "You are a test agent.").with_retry(RetryPolicy::immediate(3)),
        ToolDispatcher::new(registry, 5).with_retry(RetryPolicy::immediate(1)),
        store,
    )
}

fn gated_echo() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register_gated(EchoTool);
    registry
}

#[tokio::test]
async fn test_resume_after_restart_matches_immediate_approval() {
    // 立即批准
    let memory: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
    let direct = engine_with(Arc::new(MockLlmClient), gated_echo(), memory);
    let first = direct.run("t-direct", "hi").await.unwrap();
    assert!(first.interrupt().is_some());
    let expected = direct.resolve("t-direct", Decision::approve()).await.unwrap();

    // 挂起后换一个全新的引擎（模拟进程重启），共享同一个文件存储
    let dir = TempDir::new().unwrap();
    let before: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(dir.path()));
    let engine = engine_with(Arc::new(MockLlmClient), gated_echo(), before);
    let interrupted = engine.run("t-restart", "hi").await.unwrap();
    let interrupt = interrupted.interrupt().cloned().unwrap();
    assert_eq!(interrupt.tool_name, "echo");
    assert_eq!(interrupt.tool_args, json!({"text": "Echo from Mock: hi"}));
    drop(engine);

    let after: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(dir.path()));
    let restarted = engine_with(Arc::new(MockLlmClient), gated_echo(), after);
    assert_eq!(restarted.pending("t-restart").await.unwrap(), Some(interrupt));
    let resumed = restarted.resolve("t-restart", Decision::approve()).await.unwrap();

    assert_eq!(resumed, expected);
    assert_eq!(resumed.output(), Some("Echo from Mock: hi"));
    assert!(restarted.pending("t-restart").await.unwrap().is_none());
}

#[tokio::test]
async fn test_rejected_call_has_no_side_effect_and_loop_continues() {
    let (refund, runs) = CountingTool::new("refund", 0);
    let mut registry = ToolRegistry::new();
    registry.register_gated(refund);

    let llm = Arc::new(ScriptedLlmClient::replies(vec![
        LlmResponse::with_tool_calls("", vec![ToolCall::new("c1", "refund", json!({"order": 7}))]),
        LlmResponse::text("I could not issue the refund."),
        LlmResponse::with_tool_calls("", vec![ToolCall::new("c2", "refund", json!({"order": 8}))]),
        LlmResponse::text("Still no refund."),
    ]));
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
    let engine = engine_with(llm.clone(), registry, store);

    engine.run("t", "refund order 7").await.unwrap();
    let out = engine
        .resolve("t", Decision::reject(Some("not eligible".into())))
        .await
        .unwrap();
    assert_eq!(out.output(), Some("I could not issue the refund."));
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    let seen = llm.seen_messages();
    let observation = seen[1].last().unwrap();
    assert_eq!(observation.role, Role::Tool);
    assert_eq!(observation.tool_call_id.as_deref(), Some("c1"));
    assert!(observation.content.contains("rejected"));
    assert!(observation.content.contains("not eligible"));

    // 不给理由时使用默认说明
    engine.run("t", "refund order 8").await.unwrap();
    engine.resolve("t", Decision::reject(None)).await.unwrap();
    let seen = llm.seen_messages();
    assert!(seen[3].last().unwrap().content.contains("no reason given"));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_exit_then_new_message_starts_fresh_history() {
    let llm = Arc::new(ScriptedLlmClient::replies(vec![
        LlmResponse::text("first answer"),
        LlmResponse::text("fresh answer"),
    ]));
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
    let engine = engine_with(llm.clone(), ToolRegistry::new(), store);

    engine.run("t", "remember 42").await.unwrap();
    let exit = engine.run("t", "TERMINATE").await.unwrap();
    assert_eq!(exit.output(), Some(EXIT_MESSAGE));

    engine.run("t", "what did I say?").await.unwrap();
    let history = engine.history("t").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content, "what did I say?");
    assert_eq!(history[1].content, "fresh answer");
    // 新一轮模型只看到 system + 新消息
    assert_eq!(llm.seen_messages()[1].len(), 2);
}

#[tokio::test]
async fn test_transient_model_failure_uses_exact_attempt_budget() {
    let failure = LlmError::Network("connection reset".into());
    let llm = Arc::new(ScriptedLlmClient::always_failing(failure.clone()));
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
    let engine = engine_with(llm.clone(), ToolRegistry::new(), store);

    let err = engine.run("t", "hello").await.unwrap_err();
    assert_eq!(llm.calls(), 3);
    assert!(matches!(err, AgentError::LlmError(ref e) if *e == failure));
    assert!(engine.history("t").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_permanent_model_failure_is_not_retried() {
    let llm = Arc::new(ScriptedLlmClient::always_failing(LlmError::Api("invalid api key".into())));
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
    let engine = engine_with(llm.clone(), ToolRegistry::new(), store);

    assert!(engine.run("t", "hello").await.is_err());
    assert_eq!(llm.calls(), 1);
}

#[tokio::test]
async fn test_parallel_tool_results_keep_request_order() {
    let mut registry = ToolRegistry::new();
    let (a, _) = CountingTool::new("a", 10);
    let (b, _) = CountingTool::new("b", 200);
    let (c, _) = CountingTool::new("c", 100);
    registry.register(a);
    registry.register(b);
    registry.register(c);

    let llm = Arc::new(ScriptedLlmClient::replies(vec![
        LlmResponse::with_tool_calls(
            "",
            vec![
                ToolCall::new("ca", "a", json!({})),
                ToolCall::new("cb", "b", json!({})),
                ToolCall::new("cc", "c", json!({})),
            ],
        ),
        LlmResponse::text("all done"),
    ]));
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
    let engine = engine_with(llm, registry, store);

    let out = engine.run("t", "run all").await.unwrap();
    assert_eq!(out.output(), Some("all done"));

    let history = engine.history("t").await.unwrap();
    let ids: Vec<_> = history
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.tool_call_id.clone())
        .collect();
    assert_eq!(ids, vec!["ca", "cb", "cc"]);
}

struct NoopBackend;

#[async_trait]
impl SandboxBackend for NoopBackend {
    async fn exec(&self, _argv: &[String], _limit: Duration) -> ExecResult {
        ExecResult {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            success: true,
        }
    }
}

struct SlowProvider {
    provisioned: Arc<AtomicUsize>,
}

#[async_trait]
impl SandboxProvider for SlowProvider {
    async fn provision(&self, _image: &str) -> Result<Box<dyn SandboxBackend>, AgentError> {
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.provisioned.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(NoopBackend))
    }
}

#[tokio::test]
async fn test_concurrent_requests_share_one_sandbox_per_thread() {
    let provisioned = Arc::new(AtomicUsize::new(0));
    let manager = Arc::new(SandboxManager::new(
        Arc::new(SlowProvider {
            provisioned: provisioned.clone(),
        }),
        "test-image",
        Duration::from_secs(60),
    ));

    let mut handles = Vec::new();
    for i in 0..8 {
        let manager = manager.clone();
        let thread_id = if i % 2 == 0 { "t1" } else { "t2" };
        handles.push(tokio::spawn(async move {
            manager.get_or_create(thread_id).await.unwrap().id().to_string()
        }));
    }
    let mut ids = Vec::new();
    for h in handles {
        ids.push(h.await.unwrap());
    }

    assert_eq!(provisioned.load(Ordering::SeqCst), 2);
    assert_eq!(manager.live_count().await, 2);
    assert!((0..8).step_by(2).all(|i| ids[i] == ids[0]));
    assert!((1..8).step_by(2).all(|i| ids[i] == ids[1]));
    assert_ne!(ids[0], ids[1]);
}

#[tokio::test]
async fn test_router_delegates_to_specialist_tool() {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());

    let specialist_llm = Arc::new(ScriptedLlmClient::replies(vec![LlmResponse::text("invoice #12 is paid")]));
    let specialist = Specialist::new(
        SpecialistConfig {
            name: "billing".into(),
            description: "Billing questions".into(),
            prompt_template: "You handle billing for {company}. Request: {request}".into(),
            params: HashMap::from([("company".to_string(), "Acme".to_string())]),
            ..Default::default()
        },
        specialist_llm.clone(),
        ToolRegistry::new(),
        store.clone(),
    );

    let mut root_tools = ToolRegistry::new();
    root_tools.register(specialist);
    let root_llm = Arc::new(ScriptedLlmClient::replies(vec![
        LlmResponse::with_tool_calls(
            "",
            vec![ToolCall::new("c1", "billing", json!({"request": "is invoice 12 paid?"}))],
        ),
        LlmResponse::text("Yes, invoice 12 is paid."),
    ]));
    let root = engine_with(root_llm.clone(), root_tools, store);

    let mut router = TriggerRouter::new(AgentRoutes::new("assistant"));
    router.register_agent(Arc::new(root));

    let reply = router.handle_message("support", "thread-9", "is invoice 12 paid?").await;
    assert_eq!(reply, Reply::Text("Yes, invoice 12 is paid.".into()));

    let system = &specialist_llm.seen_messages()[0][0];
    assert_eq!(system.content, "You handle billing for Acme. Request: is invoice 12 paid?");
    let observation = root_llm.seen_messages()[1].last().cloned().unwrap();
    assert_eq!(observation.content, "invoice #12 is paid");
}

#[tokio::test]
async fn test_router_renders_interrupt_as_approval_request() {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
    let engine = engine_with(Arc::new(MockLlmClient), gated_echo(), store);
    let mut router = TriggerRouter::new(AgentRoutes::new("assistant"));
    router.register_agent(Arc::new(engine));

    let reply = router.handle_message("cli", "t", "ping").await;
    let Reply::ApprovalRequest { thread_id, interrupt } = reply else {
        panic!("expected approval request, got {:?}", reply);
    };
    assert_eq!(thread_id, "t");
    assert_eq!(
        serde_json::to_value(&interrupt).unwrap(),
        json!({"type": "tool_approval", "toolName": "echo", "toolArgs": {"text": "Echo from Mock: ping"}})
    );

    // 挂起期间新消息被拒绝，给出可读提示
    let busy = router.handle_message("cli", "t", "hello?").await;
    assert!(matches!(busy, Reply::Text(_)));

    let done = router.handle_decision("cli", "t", Decision::approve()).await;
    assert_eq!(done, Reply::Text("Echo from Mock: ping".into()));
    assert!(matches!(
        router.handle_decision("cli", "t", Decision::approve()).await,
        Reply::Text(_)
    ));
}

/// 有副作用的受限工具：每次执行都计数，失败文本看起来像网络错误
struct TransferTool {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for TransferTool {
    fn name(&self) -> &str {
        "transfer"
    }

    fn description(&self) -> &str {
        "Moves money between accounts"
    }

    async fn execute(&self, _ctx: &ToolContext, _args: Value) -> Result<String, String> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Err("connection reset after transfer was sent".into())
    }
}

#[tokio::test]
async fn test_approved_call_is_executed_exactly_once() {
    let runs = Arc::new(AtomicUsize::new(0));
    let mut registry = ToolRegistry::new();
    registry.register_gated(TransferTool { runs: runs.clone() });

    let llm = Arc::new(ScriptedLlmClient::replies(vec![
        LlmResponse::with_tool_calls("", vec![ToolCall::new("c1", "transfer", json!({"amount": 500}))]),
        LlmResponse::text("The transfer reported an error."),
    ]));
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
    let engine = Orchestrator::new(
        Planner::new(llm.clone(), "You are a test agent."),
        ToolDispatcher::new(registry, 5).with_retry(RetryPolicy::immediate(3)),
        store,
    );

    assert!(engine.run("t", "send 500").await.unwrap().interrupt().is_some());
    let out = engine.resolve("t", Decision::approve()).await.unwrap();
    assert_eq!(out.output(), Some("The transfer reported an error."));
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let observation = llm.seen_messages()[1].last().cloned().unwrap();
    assert_eq!(observation.content, "Error: connection reset after transfer was sent");
}

#[tokio::test]
async fn test_specialist_slower_than_parent_tool_timeout_completes_once() {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
    let specialist_llm = Arc::new(
        ScriptedLlmClient::replies(vec![LlmResponse::text("refund approved")])
            .with_delay(Duration::from_millis(300)),
    );
    let specialist = Specialist::new(
        SpecialistConfig {
            name: "billing".into(),
            prompt_template: "You handle billing.".into(),
            ..Default::default()
        },
        specialist_llm.clone(),
        ToolRegistry::new(),
        store.clone(),
    );

    let mut root_tools = ToolRegistry::new();
    root_tools.register(specialist);
    let root_llm = Arc::new(ScriptedLlmClient::replies(vec![
        LlmResponse::with_tool_calls("", vec![ToolCall::new("c1", "billing", json!({"request": "refund #4"}))]),
        LlmResponse::text("Billing approved the refund."),
    ]));
    let root = Orchestrator::new(
        Planner::new(root_llm.clone(), "You are a test agent."),
        ToolDispatcher::new(root_tools, 0)
            .with_timeout(Duration::from_millis(100))
            .with_retry(RetryPolicy::immediate(2)),
        store,
    );

    let out = root.run("t", "refund #4 please").await.unwrap();
    assert_eq!(out.output(), Some("Billing approved the refund."));
    assert_eq!(specialist_llm.calls(), 1);
    assert_eq!(root_llm.seen_messages()[1].last().unwrap().content, "refund approved");
}

#[tokio::test]
async fn test_gated_call_inside_specialist_surfaces_as_tool_error() {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
    let runs = Arc::new(AtomicUsize::new(0));
    let mut specialist_tools = ToolRegistry::new();
    specialist_tools.register_gated(TransferTool { runs: runs.clone() });
    let specialist_llm = Arc::new(ScriptedLlmClient::replies(vec![LlmResponse::with_tool_calls(
        "",
        vec![ToolCall::new("s1", "transfer", json!({"amount": 1}))],
    )]));
    let specialist = Specialist::new(
        SpecialistConfig {
            name: "treasury".into(),
            prompt_template: "You move money.".into(),
            ..Default::default()
        },
        specialist_llm,
        specialist_tools,
        store.clone(),
    );

    let mut root_tools = ToolRegistry::new();
    root_tools.register(specialist);
    let root_llm = Arc::new(ScriptedLlmClient::replies(vec![
        LlmResponse::with_tool_calls("", vec![ToolCall::new("c1", "treasury", json!({"request": "pay 1"}))]),
        LlmResponse::text("Treasury needs approval first."),
    ]));
    let root = engine_with(root_llm.clone(), root_tools, store);

    let out = root.run("t", "pay 1").await.unwrap();
    assert_eq!(out.output(), Some("Treasury needs approval first."));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    let observation = root_llm.seen_messages()[1].last().cloned().unwrap();
    assert!(observation.content.starts_with("Error: "));
    assert!(observation.content.contains("waiting for approval of 'transfer'"));
}
