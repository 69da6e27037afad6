//! 记忆层：对话消息模型与检查点持久化（内存 / 文件 / SQLite）

pub mod async_persistence;
pub mod checkpoint;
pub mod conversation;
pub mod persistence;

#[cfg(feature = "async-sqlite")]
pub use async_persistence::SqliteCheckpointStore;
pub use checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpointStore, ScopedCheckpointStore};
pub use conversation::{Message, Role, ToolCall};
pub use persistence::FileCheckpointStore;
