//! Swarm - 多智能体编排引擎的命令行驱动
//!
//! 从标准输入读取：
//! - `<thread>: <message>`        在 thread 上发送一条消息
//! - `/approve <thread> [reason]` 批准挂起的工具调用
//! - `/reject <thread> [reason]`  拒绝挂起的工具调用

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use swarm::agent::{build_runtime, Runtime};
use swarm::config::load_config;
use swarm::core::Decision;
use swarm::gateway::Reply;
use tokio::io::{AsyncBufReadExt, BufReader};

const CHANNEL: &str = "cli";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    swarm::observability::init();

    let cfg = load_config(None).context("Failed to load config")?;
    let runtime = Arc::new(build_runtime(&cfg).await.context("Failed to build runtime")?);
    tracing::info!(agents = ?runtime.router.agent_names(), "swarm ready");

    spawn_retention(runtime.clone());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (thread_id, reply) = match parse_command(line) {
            Some(Command::Message { thread_id, text }) => {
                let reply = runtime.router.handle_message(CHANNEL, thread_id, text).await;
                (thread_id, reply)
            }
            Some(Command::Decide { thread_id, decision }) => {
                let reply = runtime.router.handle_decision(CHANNEL, thread_id, decision).await;
                (thread_id, reply)
            }
            None => {
                eprintln!("usage: <thread>: <message> | /approve <thread> [reason] | /reject <thread> [reason]");
                continue;
            }
        };
        print_reply(thread_id, &reply);
    }

    Ok(())
}

/// 定期清理过期检查点与超时沙箱
fn spawn_retention(runtime: Arc<Runtime>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        loop {
            ticker.tick().await;
            if let Err(e) = runtime.router.prune_stale().await {
                tracing::warn!(error = %e, "checkpoint pruning failed");
            }
            let reaped = runtime.sandboxes.reap_expired().await;
            if reaped > 0 {
                tracing::info!(reaped, "expired sandboxes terminated");
            }
        }
    });
}

enum Command<'a> {
    Message { thread_id: &'a str, text: &'a str },
    Decide { thread_id: &'a str, decision: Decision },
}

fn parse_command(line: &str) -> Option<Command<'_>> {
    if let Some(rest) = line.strip_prefix('/') {
        let mut parts = rest.splitn(3, char::is_whitespace);
        let verb = parts.next()?;
        let thread_id = parts.next().filter(|t| !t.is_empty())?;
        let reason = parts.next().map(str::trim).filter(|r| !r.is_empty());
        let decision = match verb {
            "approve" => Decision::approve(),
            "reject" => Decision::reject(reason.map(str::to_string)),
            _ => return None,
        };
        return Some(Command::Decide { thread_id, decision });
    }
    let (thread_id, text) = line.split_once(':')?;
    let thread_id = thread_id.trim();
    if thread_id.is_empty() {
        return None;
    }
    Some(Command::Message {
        thread_id,
        text: text.trim(),
    })
}

fn print_reply(thread_id: &str, reply: &Reply) {
    match reply {
        Reply::Text(text) => println!("[{}] {}", thread_id, text),
        Reply::ApprovalRequest { thread_id, interrupt } => {
            let args = serde_json::to_string(&interrupt.tool_args).unwrap_or_default();
            println!("[{}] approval needed: {} {}", thread_id, interrupt.tool_name, args);
            println!("  /approve {}  |  /reject {} <reason>", thread_id, thread_id);
        }
        Reply::Ignored => {}
    }
}
