//! 代码执行沙箱
//!
//! 每个 thread 至多一个存活的沙箱：首次需要时创建，存活期内复用，过期后丢弃并在下次请求时重建。
//! 存活期从创建起算且固定；单条命令的执行时间以沙箱剩余存活期为上限，超出即被终止并以失败结果返回。
//! 执行失败（无法启动、非零退出、超时）都体现在 ExecResult 中，不作为错误抛出。

pub mod local;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::core::AgentError;

pub use local::LocalProcessProvider;

/// 一次命令执行的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub success: bool,
}

impl ExecResult {
    /// 命令未能正常运行（启动失败、被终止）
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: -1,
            success: false,
        }
    }
}

/// 已就绪的执行环境（由 provider 创建）
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// 执行 argv，最多运行 limit
    async fn exec(&self, argv: &[String], limit: Duration) -> ExecResult;

    /// 释放资源；默认依赖 Drop
    async fn shutdown(&self) {}
}

/// 沙箱提供方（本地进程、容器、远程服务……）
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn provision(&self, image: &str) -> Result<Box<dyn SandboxBackend>, AgentError>;
}

/// 一个存活期固定的沙箱
pub struct Sandbox {
    id: String,
    thread_id: String,
    created_at: Instant,
    lifetime: Duration,
    backend: Box<dyn SandboxBackend>,
}

impl Sandbox {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn remaining(&self) -> Duration {
        self.lifetime.saturating_sub(self.created_at.elapsed())
    }

    pub fn is_alive(&self) -> bool {
        !self.remaining().is_zero()
    }

    pub async fn exec(&self, argv: &[String]) -> ExecResult {
        let remaining = self.remaining();
        if remaining.is_zero() {
            return ExecResult::failed("sandbox lifetime expired before the command started");
        }
        tracing::debug!(sandbox = %self.id, thread_id = %self.thread_id, ?argv, "sandbox exec");
        self.backend.exec(argv, remaining).await
    }
}

type Slot = Arc<Mutex<Option<Arc<Sandbox>>>>;

/// 按 thread 管理沙箱；同一 thread 的 get_or_create 串行，不同 thread 互不阻塞
pub struct SandboxManager {
    provider: Arc<dyn SandboxProvider>,
    image: String,
    lifetime: Duration,
    slots: StdMutex<HashMap<String, Slot>>,
}

impl SandboxManager {
    pub fn new(provider: Arc<dyn SandboxProvider>, image: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            provider,
            image: image.into(),
            lifetime,
            slots: StdMutex::new(HashMap::new()),
        }
    }

    /// 本地进程后端
    pub fn local(lifetime: Duration) -> Self {
        Self::new(Arc::new(LocalProcessProvider), "local", lifetime)
    }

    fn slot(&self, thread_id: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(thread_id.to_string()).or_default().clone()
    }

    fn existing_slots(&self) -> Vec<(String, Slot)> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// 返回 thread 的存活沙箱，不存在或已过期时新建
    pub async fn get_or_create(&self, thread_id: &str) -> Result<Arc<Sandbox>, AgentError> {
        let slot = self.slot(thread_id);
        let mut current = slot.lock().await;

        if let Some(existing) = current.as_ref() {
            if existing.is_alive() {
                return Ok(existing.clone());
            }
            tracing::info!(thread_id, sandbox = %existing.id, "sandbox expired, replacing");
            existing.backend.shutdown().await;
            *current = None;
        }

        let backend = self.provider.provision(&self.image).await?;
        let sandbox = Arc::new(Sandbox {
            id: format!("sbx-{}", uuid::Uuid::new_v4().simple()),
            thread_id: thread_id.to_string(),
            created_at: Instant::now(),
            lifetime: self.lifetime,
            backend,
        });
        tracing::info!(
            thread_id,
            sandbox = %sandbox.id,
            image = %self.image,
            lifetime_secs = self.lifetime.as_secs(),
            "sandbox created"
        );
        *current = Some(sandbox.clone());
        Ok(sandbox)
    }

    /// 当前存活的沙箱（不创建）
    pub async fn live_sandbox(&self, thread_id: &str) -> Option<Arc<Sandbox>> {
        let slot = {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.get(thread_id).cloned()
        }?;
        let current = slot.lock().await;
        current.as_ref().filter(|s| s.is_alive()).cloned()
    }

    /// 终止 thread 的沙箱；没有时什么也不做
    pub async fn terminate(&self, thread_id: &str) {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.remove(thread_id)
        };
        if let Some(slot) = slot {
            if let Some(sandbox) = slot.lock().await.take() {
                sandbox.backend.shutdown().await;
                tracing::info!(thread_id, sandbox = %sandbox.id, "sandbox terminated");
            }
        }
    }

    /// 存活沙箱数量
    pub async fn live_count(&self) -> usize {
        let mut n = 0;
        for (_, slot) in self.existing_slots() {
            if slot.lock().await.as_ref().is_some_and(|s| s.is_alive()) {
                n += 1;
            }
        }
        n
    }

    /// 回收所有已过期的沙箱，返回回收数量
    pub async fn reap_expired(&self) -> usize {
        let mut reaped = 0;
        for (thread_id, slot) in self.existing_slots() {
            let mut current = slot.lock().await;
            if current.as_ref().is_some_and(|s| !s.is_alive()) {
                if let Some(sandbox) = current.take() {
                    sandbox.backend.shutdown().await;
                    tracing::debug!(thread_id = %thread_id, sandbox = %sandbox.id, "expired sandbox reaped");
                    reaped += 1;
                }
            }
        }
        // 删除已空且无人持有的槽位（只有 map 持有引用时）
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, slot| {
                Arc::strong_count(slot) > 1 || slot.try_lock().map_or(true, |current| current.is_some())
            });
        reaped
    }
}
