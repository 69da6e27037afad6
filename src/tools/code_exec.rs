//! 代码执行工具：在当前 thread 的沙箱中运行命令或代码片段
//!
//! 参数二选一：`{"argv": ["python3", "-c", "print(1)"]}` 或 `{"code": "...", "language": "python|sh|node"}`。
//! 返回 ExecResult 的 JSON；进程层面的失败也是正常结果，只有参数错误与沙箱无法创建才返回 Err。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::sandbox::SandboxManager;
use crate::tools::{Tool, ToolContext};

pub struct CodeExecTool {
    sandboxes: Arc<SandboxManager>,
}

impl CodeExecTool {
    pub fn new(sandboxes: Arc<SandboxManager>) -> Self {
        Self { sandboxes }
    }
}

fn argv_from_args(args: &Value) -> Result<Vec<String>, String> {
    if let Some(argv) = args.get("argv").and_then(|v| v.as_array()) {
        let argv: Vec<String> = argv
            .iter()
            .map(|v| v.as_str().map(String::from).ok_or("argv entries must be strings"))
            .collect::<Result<_, _>>()?;
        if argv.is_empty() {
            return Err("argv must not be empty".into());
        }
        return Ok(argv);
    }

    let code = args
        .get("code")
        .and_then(|v| v.as_str())
        .ok_or("Missing required parameter: argv or code")?;
    let language = args
        .get("language")
        .and_then(|v| v.as_str())
        .unwrap_or("sh");
    let (program, flag) = match language {
        "python" | "python3" => ("python3", "-c"),
        "node" | "javascript" | "js" => ("node", "-e"),
        "sh" | "shell" | "bash" => ("sh", "-c"),
        other => return Err(format!("Unsupported language: {}", other)),
    };
    Ok(vec![program.to_string(), flag.to_string(), code.to_string()])
}

#[async_trait]
impl Tool for CodeExecTool {
    fn name(&self) -> &str {
        "code_exec"
    }

    fn description(&self) -> &str {
        "Run a command or a code snippet in this conversation's sandbox. \
         Files written by earlier commands are still there while the sandbox lives. \
         Returns stdout, stderr, exit_code and success."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "argv": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Command and arguments"
                },
                "code": { "type": "string", "description": "Code to run" },
                "language": {
                    "type": "string",
                    "enum": ["python", "node", "sh"]
                }
            }
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<String, String> {
        let argv = argv_from_args(&args)?;
        let sandbox = self
            .sandboxes
            .get_or_create(&ctx.thread_id)
            .await
            .map_err(|e| e.to_string())?;
        let result = sandbox.exec(&argv).await;
        serde_json::to_string(&result).map_err(|e| e.to_string())
    }
}
