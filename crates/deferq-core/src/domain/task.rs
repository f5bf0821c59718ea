//! Task - タスク名・due time・キュー要素

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Prefix of the per-name distributed lock.
pub const LOCK_PREFIX: &str = "mutex/";

/// Prefix of the per-name attempt ledger (Requeue のみ使用).
pub const ATTEMPTS_PREFIX: &str = "attempts/";

/// Partition key of the delay queue: one independent time-ordered queue per name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskName(String);

impl TaskName {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the distributed lock guarding claims for this task name.
    pub fn lock_key(&self) -> String {
        format!("{LOCK_PREFIX}{}", self.0)
    }

    /// Key of the failure counts kept for this task name's payloads.
    pub fn attempts_key(&self) -> String {
        format!("{ATTEMPTS_PREFIX}{}", self.0)
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Due time in epoch milliseconds. Stored as the sorted-set score.
///
/// An absent item is `Option::<DueAt>::None`, so `DueAt(0)` is a real timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DueAt(i64);

impl DueAt {
    pub fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    /// `self + delay`, saturating at `i64::MAX`.
    pub fn after(self, delay: Duration) -> Self {
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(delay_ms))
    }

    /// Whether an item with this due time may fire at `now`.
    pub fn is_due(&self, now: DueAt) -> bool {
        self.0 <= now.0
    }
}

impl fmt::Display for DueAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A scheduled payload as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub member: String,
    pub due_at: DueAt,
}

impl QueueItem {
    pub fn new(member: impl Into<String>, due_at: DueAt) -> Self {
        Self {
            member: member.into(),
            due_at,
        }
    }
}
