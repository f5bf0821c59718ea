//! AttemptLedger port - 配信失敗回数の台帳
//!
//! `DeliveryPolicy::Requeue` の試行回数を (タスク名, payload) 単位で数える。
//! 複数プロセスで同じキューを処理する場合は台帳も共有すること
//! （Redis では `attempts/<name>` の hash）。

use async_trait::async_trait;

use super::sorted_set::StoreError;

/// Failure counts per queued payload, shared by every process that claims it.
///
/// `key` is `TaskName::attempts_key()`, `member` the payload.
#[async_trait]
pub trait AttemptLedger: Send + Sync {
    /// Count one more failed delivery; returns the total including this one.
    async fn record_failure(&self, key: &str, member: &str) -> Result<u32, StoreError>;

    /// Forget the count (delivered, or given up on).
    async fn clear(&self, key: &str, member: &str) -> Result<(), StoreError>;
}
