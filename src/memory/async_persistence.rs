//! 异步 SQLite 检查点存储（sqlx）
//!
//! 需要启用 `async-sqlite` feature。单表 `checkpoints`，每个 thread 一行，
//! 状态以 JSON 文本存放；INSERT OR REPLACE 保证一次写入是原子的。

#![cfg(feature = "async-sqlite")]

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::core::AgentError;
use crate::memory::{Checkpoint, CheckpointStore};

fn db_err(e: sqlx::Error) -> AgentError {
    AgentError::Checkpoint(e.to_string())
}

/// SQLite 检查点存储
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    /// 打开（必要时创建）数据库文件
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    /// 从连接池创建
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, sqlx::Error> {
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                thread_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_checkpoints_updated ON checkpoints(updated_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>, AgentError> {
        let row = sqlx::query("SELECT state FROM checkpoints WHERE thread_id = ?")
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        match row {
            Some(row) => {
                let state: String = row.get("state");
                Ok(Some(serde_json::from_str(&state)?))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), AgentError> {
        let state = serde_json::to_string(checkpoint)?;
        sqlx::query("INSERT OR REPLACE INTO checkpoints (thread_id, state, updated_at) VALUES (?, ?, ?)")
            .bind(&checkpoint.thread_id)
            .bind(&state)
            .bind(checkpoint.updated_at.to_rfc3339_opts(SecondsFormat::Millis, true))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn clear(&self, thread_id: &str) -> Result<(), AgentError> {
        sqlx::query("DELETE FROM checkpoints WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn prune_older_than(&self, max_age: Duration) -> Result<usize, AgentError> {
        let age = chrono::Duration::from_std(max_age)
            .map_err(|e| AgentError::Checkpoint(e.to_string()))?;
        let cutoff: DateTime<Utc> = Utc::now() - age;
        let result = sqlx::query("DELETE FROM checkpoints WHERE updated_at < ?")
            .bind(cutoff.to_rfc3339_opts(SecondsFormat::Millis, true))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() as usize)
    }
}
