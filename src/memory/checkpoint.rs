//! 检查点存储
//!
//! 每个 thread 一个检查点：最新消息历史 + 可能存在的待审批中断。
//! 只有编排引擎写入，且每个完成或挂起的轮次最多写一次；clear 幂等，仅用于 EXIT。
//! 不同 thread_id 之间的并发读写互不干扰；同一 thread 的串行化由调用层保证。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::{AgentError, PendingInterrupt};
use crate::memory::Message;

/// 持久化快照：`{thread_id, messages, pending_interrupt?, updated_at}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_interrupt: Option<PendingInterrupt>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(thread_id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            thread_id: thread_id.into(),
            messages,
            pending_interrupt: None,
            updated_at: Utc::now(),
        }
    }

    /// 最后一次写入距今是否超过 max_age
    pub fn is_older_than(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(max_age) {
            Ok(age) => self.updated_at < now - age,
            Err(_) => false,
        }
    }
}

/// 检查点存储接口
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// 读取检查点；不存在时返回 None
    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>, AgentError>;

    /// 覆盖写入（整段历史）
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), AgentError>;

    /// 删除检查点，重复调用不报错
    async fn clear(&self, thread_id: &str) -> Result<(), AgentError>;

    /// 保留策略：删除超过 max_age 未更新的检查点，返回删除数量
    async fn prune_older_than(&self, max_age: Duration) -> Result<usize, AgentError>;
}

/// 内存检查点存储（测试 / 单进程部署）
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.checkpoints.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.checkpoints.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>, AgentError> {
        Ok(self.checkpoints.read().await.get(thread_id).cloned())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), AgentError> {
        self.checkpoints
            .write()
            .await
            .insert(checkpoint.thread_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn clear(&self, thread_id: &str) -> Result<(), AgentError> {
        self.checkpoints.write().await.remove(thread_id);
        Ok(())
    }

    async fn prune_older_than(&self, max_age: Duration) -> Result<usize, AgentError> {
        let now = Utc::now();
        let mut map = self.checkpoints.write().await;
        let before = map.len();
        map.retain(|_, c| !c.is_older_than(max_age, now));
        Ok(before - map.len())
    }
}

/// 作用域隔离：同一后端上为每个专家 / 智能体划出独立命名空间（键为 `scope/thread_id`）
pub struct ScopedCheckpointStore {
    inner: Arc<dyn CheckpointStore>,
    scope: String,
}

impl ScopedCheckpointStore {
    pub fn new(inner: Arc<dyn CheckpointStore>, scope: impl Into<String>) -> Self {
        Self {
            inner,
            scope: scope.into(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    fn key(&self, thread_id: &str) -> String {
        format!("{}/{}", self.scope, thread_id)
    }
}

#[async_trait]
impl CheckpointStore for ScopedCheckpointStore {
    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>, AgentError> {
        Ok(self.inner.load(&self.key(thread_id)).await?.map(|mut c| {
            c.thread_id = thread_id.to_string();
            c
        }))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), AgentError> {
        let mut scoped = checkpoint.clone();
        scoped.thread_id = self.key(&checkpoint.thread_id);
        self.inner.save(&scoped).await
    }

    async fn clear(&self, thread_id: &str) -> Result<(), AgentError> {
        self.inner.clear(&self.key(thread_id)).await
    }

    /// 保留策略作用于整个后端（所有作用域共享同一保留期）
    async fn prune_older_than(&self, max_age: Duration) -> Result<usize, AgentError> {
        self.inner.prune_older_than(max_age).await
    }
}
