//! SortedSetStore port - 時刻順キューのストレージ（Redis / InMemory）
//!
//! タスク名ごとに 1 つの sorted set。member = payload、score = due time (ms)。
//! member はキーごとに一意で、既存 member の add は score を上書きする。

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{DueAt, QueueItem};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store command {command} failed: {message}")]
    Command {
        command: &'static str,
        message: String,
    },

    #[error("unexpected store reply to {command}: {message}")]
    Decode {
        command: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn command(command: &'static str, message: impl Into<String>) -> Self {
        Self::Command {
            command,
            message: message.into(),
        }
    }
}

/// Remote sorted associative structure used as the delay queue.
///
/// Every operation is a single round-trip; callers bound it with a timeout.
#[async_trait]
pub trait SortedSetStore: Send + Sync {
    /// ZADD: insert `member` or overwrite its score.
    async fn add(&self, key: &str, member: &str, score: DueAt) -> Result<(), StoreError>;

    /// ZRANGEBYSCORE key -inf +inf WITHSCORES LIMIT 0 1
    async fn first(&self, key: &str) -> Result<Option<QueueItem>, StoreError>;

    /// ZREM: `true` if the member was present.
    async fn remove(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// ZSCORE: `None` when the member is absent.
    async fn score(&self, key: &str, member: &str) -> Result<Option<DueAt>, StoreError>;

    /// ZRANK: `None` when the member is absent.
    async fn rank(&self, key: &str, member: &str) -> Result<Option<u64>, StoreError>;
}
