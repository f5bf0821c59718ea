//! DistributedLock port - クラスタ全体で効く TTL 付きの名前付き mutex

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock service connection error: {0}")]
    Connection(String),

    #[error("lock operation {op} failed for {name}: {message}")]
    Operation {
        op: &'static str,
        name: String,
        message: String,
    },
}

/// Proof of ownership returned by a successful `try_lock`.
///
/// The token is unique per acquisition; only its holder can release the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    name: String,
    token: String,
}

impl LockGuard {
    pub fn new(name: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: token.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Fresh owner token: ULID with the current time and a random tail.
pub fn fresh_token() -> String {
    let timestamp_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
    Ulid::from_parts(timestamp_ms, rand::random()).to_string()
}

/// Non-blocking distributed mutual exclusion.
///
/// Contention is `Ok(None)`, never an error.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try once to take `name` for at most `ttl`.
    async fn try_lock(&self, name: &str, ttl: Duration) -> Result<Option<LockGuard>, LockError>;

    /// Release; `false` if the lock had already expired or changed owner.
    async fn unlock(&self, guard: &LockGuard) -> Result<bool, LockError>;
}
