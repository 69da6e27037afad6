//! 本地进程沙箱：每个沙箱一个临时工作目录，命令作为子进程在其中运行

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tokio::time::timeout;

use crate::core::AgentError;
use crate::sandbox::{ExecResult, SandboxBackend, SandboxProvider};

const MAX_OUTPUT_CHARS: usize = 10_000;

/// 本地进程提供方；image 仅用于日志
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalProcessProvider;

#[async_trait]
impl SandboxProvider for LocalProcessProvider {
    async fn provision(&self, image: &str) -> Result<Box<dyn SandboxBackend>, AgentError> {
        let workdir = tempfile::Builder::new()
            .prefix("swarm-sbx-")
            .tempdir()
            .map_err(|e| AgentError::Sandbox(format!("failed to create sandbox workdir: {e}")))?;
        tracing::debug!(image, workdir = %workdir.path().display(), "local sandbox provisioned");
        Ok(Box::new(LocalSandbox { workdir }))
    }
}

/// 临时目录随沙箱一起释放
pub struct LocalSandbox {
    workdir: TempDir,
}

fn truncate(s: &str) -> String {
    if s.chars().count() > MAX_OUTPUT_CHARS {
        format!("{}...[truncated]", s.chars().take(MAX_OUTPUT_CHARS).collect::<String>())
    } else {
        s.to_string()
    }
}

#[async_trait]
impl SandboxBackend for LocalSandbox {
    async fn exec(&self, argv: &[String], limit: Duration) -> ExecResult {
        let Some((program, args)) = argv.split_first() else {
            return ExecResult::failed("empty command");
        };

        let child = Command::new(program)
            .args(args)
            .current_dir(self.workdir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match timeout(limit, child).await {
            Ok(Ok(output)) => ExecResult {
                stdout: truncate(&String::from_utf8_lossy(&output.stdout)),
                stderr: truncate(&String::from_utf8_lossy(&output.stderr)),
                exit_code: output.status.code().unwrap_or(-1),
                success: output.status.success(),
            },
            Ok(Err(e)) => ExecResult::failed(format!("failed to start '{}': {}", program, e)),
            Err(_) => ExecResult::failed(format!(
                "command exceeded the sandbox lifetime ({}ms remaining) and was killed",
                limit.as_millis()
            )),
        }
    }
}
