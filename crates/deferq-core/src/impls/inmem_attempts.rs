//! InMemoryAttemptLedger - プロセス内の試行回数台帳
//!
//! clone 同士は同じ台帳を共有する。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::ports::{AttemptLedger, StoreError};

/// Shared by cloning, like `InMemorySortedSet`.
#[derive(Clone, Default)]
pub struct InMemoryAttemptLedger {
    counts: Arc<Mutex<HashMap<(String, String), u32>>>,
}

impl InMemoryAttemptLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of payloads with a recorded failure.
    pub async fn len(&self) -> usize {
        self.counts.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl AttemptLedger for InMemoryAttemptLedger {
    async fn record_failure(&self, key: &str, member: &str) -> Result<u32, StoreError> {
        let mut counts = self.counts.lock().await;
        let n = counts
            .entry((key.to_string(), member.to_string()))
            .or_insert(0);
        *n = n.saturating_add(1);
        Ok(*n)
    }

    async fn clear(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut counts = self.counts.lock().await;
        counts.remove(&(key.to_string(), member.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_per_payload() {
        let ledger = InMemoryAttemptLedger::new();
        assert_eq!(ledger.record_failure("attempts/email", "a").await.unwrap(), 1);
        assert_eq!(ledger.record_failure("attempts/email", "a").await.unwrap(), 2);
        assert_eq!(ledger.record_failure("attempts/email", "b").await.unwrap(), 1);
        assert_eq!(ledger.record_failure("attempts/sms", "a").await.unwrap(), 1);

        ledger.clear("attempts/email", "a").await.unwrap();
        assert_eq!(ledger.record_failure("attempts/email", "a").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn clones_share_counts() {
        let ledger = InMemoryAttemptLedger::new();
        let peer = ledger.clone();
        ledger.record_failure("k", "m").await.unwrap();
        assert_eq!(peer.record_failure("k", "m").await.unwrap(), 2);

        peer.clear("k", "m").await.unwrap();
        assert!(ledger.is_empty().await);
    }
}
