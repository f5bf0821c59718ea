//! deferq-core
//!
//! 共有 sorted-set ストアと分散ロックの上で動く遅延タスク dispatcher。
//!
//! # モジュール構成
//! - **domain**: タスク名、due time、キュー要素、handler エラー
//! - **ports**: `SortedSetStore`, `DistributedLock`, `AttemptLedger`, `Clock`
//! - **impls**: ポートの in-memory 実装
//! - **app**: `DelayQueue`（登録 + ライフサイクル）、poller、options
//! - **error**: `DelayError`
//! - **observability**: tracing の初期化
//!
//! 既定の配信は at-most-once: handler 実行前にキューから外すので、
//! handler 途中でクラッシュするとその要素は失われる。

pub mod app;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;

pub use app::{
    DelayQueue, DeliveryPolicy, FnHandler, Options, OptionsBuilder, PollSettings, PollerCounts,
    TaskHandler, handler_fn,
};
pub use domain::{DueAt, ErrorKind, HandlerError, QueueItem, TaskName};
pub use error::DelayError;
