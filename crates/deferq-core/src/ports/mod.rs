//! Ports - dispatcher が使うが自前では実装しない能力
//!
//! - `SortedSetStore`: 共有の時刻順キュー（本番は Redis sorted set）
//! - `DistributedLock`: タスク名ごとの claim ロック（本番は Redis `SET NX PX`）
//! - `AttemptLedger`: Requeue の試行回数（本番は Redis hash）
//! - `Clock`: due time 計算用の現在時刻

pub mod attempts;
pub mod clock;
pub mod lock;
pub mod sorted_set;

pub use self::attempts::AttemptLedger;
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::lock::{DistributedLock, LockError, LockGuard, fresh_token};
pub use self::sorted_set::{SortedSetStore, StoreError};
