//! 文件检查点存储
//!
//! 每个 thread 一个 JSON 文件，跨进程重启恢复。写入先落到临时文件再 rename，
//! 保证读者看不到写了一半的检查点。

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::core::AgentError;
use crate::memory::{Checkpoint, CheckpointStore};

/// 目录下的 JSON 文件存储：`<root>/<hex(thread_id)>.json`
#[derive(Debug)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// thread_id 是外部系统给的不透明字符串，编码成十六进制避免路径注入
    fn path_for(&self, thread_id: &str) -> PathBuf {
        let encoded: String = thread_id.bytes().map(|b| format!("{:02x}", b)).collect();
        self.root.join(format!("{}.json", encoded))
    }

    async fn read_checkpoint(path: &Path) -> anyhow::Result<Option<Checkpoint>> {
        let data = match tokio::fs::read_to_string(path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&data)?))
    }

    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path_for(&checkpoint.thread_id);
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, serde_json::to_string_pretty(checkpoint)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

fn store_err(e: anyhow::Error) -> AgentError {
    AgentError::Checkpoint(format!("{:#}", e))
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>, AgentError> {
        Self::read_checkpoint(&self.path_for(thread_id))
            .await
            .map_err(store_err)
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), AgentError> {
        self.write_checkpoint(checkpoint).await.map_err(store_err)
    }

    async fn clear(&self, thread_id: &str) -> Result<(), AgentError> {
        match tokio::fs::remove_file(self.path_for(thread_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AgentError::Checkpoint(e.to_string())),
        }
    }

    async fn prune_older_than(&self, max_age: Duration) -> Result<usize, AgentError> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(AgentError::Checkpoint(e.to_string())),
        };
        let now = Utc::now();
        let mut removed = 0;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| AgentError::Checkpoint(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_checkpoint(&path).await {
                Ok(Some(c)) if c.is_older_than(max_age, now) => {
                    if tokio::fs::remove_file(&path).await.is_ok() {
                        removed += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(path = %path.display(), "skipping unreadable checkpoint: {:#}", e),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Message;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_store_survives_new_instance() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store
            .save(&Checkpoint::new("C01/1712.0001", vec![Message::user("hello")]))
            .await
            .unwrap();

        let reopened = FileCheckpointStore::new(dir.path());
        let loaded = reopened.load("C01/1712.0001").await.unwrap().unwrap();
        assert_eq!(loaded.thread_id, "C01/1712.0001");
        assert_eq!(loaded.messages[0].content, "hello");
    }

    #[tokio::test]
    async fn test_file_store_clear_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.save(&Checkpoint::new("t", vec![])).await.unwrap();
        store.clear("t").await.unwrap();
        store.clear("t").await.unwrap();
        assert!(store.load("t").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_prune() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let mut old = Checkpoint::new("old", vec![]);
        old.updated_at = Utc::now() - chrono::Duration::days(3);
        store.save(&old).await.unwrap();
        store.save(&Checkpoint::new("new", vec![])).await.unwrap();

        let removed = store
            .prune_older_than(Duration::from_secs(24 * 3600))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.load("new").await.unwrap().is_some());
    }
}
