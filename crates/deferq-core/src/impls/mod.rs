//! Impls - ポートのプロセス内実装
//!
//! - **InMemorySortedSet**: テスト・単一プロセス用の sorted-set ストア
//! - **InMemoryLock**: owner token 付き TTL ロック
//! - **InMemoryAttemptLedger**: Requeue の試行回数台帳
//!
//! Redis 実装は `deferq-redis` crate にある。

pub mod inmem_attempts;
pub mod inmem_lock;
pub mod inmem_sorted_set;

pub use self::inmem_attempts::InMemoryAttemptLedger;
pub use self::inmem_lock::InMemoryLock;
pub use self::inmem_sorted_set::InMemorySortedSet;
