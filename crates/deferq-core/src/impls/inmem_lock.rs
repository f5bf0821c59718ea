//! InMemoryLock - 分散ロックのプロセス内版
//!
//! Redis ロックと同じ契約: ノンブロッキング取得、TTL 失効、owner のみ解放。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::ports::lock::fresh_token;
use crate::ports::{DistributedLock, LockError, LockGuard};

#[derive(Debug)]
struct Held {
    token: String,
    expires_at: Instant,
}

/// InMemoryLock is shared by cloning; every clone sees the same lock table.
#[derive(Clone, Default)]
pub struct InMemoryLock {
    held: Arc<Mutex<HashMap<String, Held>>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `name` is currently held (and not expired).
    pub async fn is_locked(&self, name: &str) -> bool {
        let held = self.held.lock().await;
        held.get(name).is_some_and(|h| h.expires_at > Instant::now())
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn try_lock(&self, name: &str, ttl: Duration) -> Result<Option<LockGuard>, LockError> {
        let mut held = self.held.lock().await;
        let now = Instant::now();

        if let Some(current) = held.get(name)
            && current.expires_at > now
        {
            return Ok(None);
        }

        let token = fresh_token();
        held.insert(
            name.to_string(),
            Held {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(Some(LockGuard::new(name, token)))
    }

    async fn unlock(&self, guard: &LockGuard) -> Result<bool, LockError> {
        let mut held = self.held.lock().await;
        let owned = held
            .get(guard.name())
            .is_some_and(|h| h.token == guard.token() && h.expires_at > Instant::now());
        if owned {
            held.remove(guard.name());
        }
        Ok(owned)
    }
}
