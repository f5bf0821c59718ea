//! App - ポートの上に組んだ dispatcher
//!
//! # 主要コンポーネント
//! - **DelayQueue**: handler 登録、bind/run/stop、投入と問い合わせ
//! - **Poller**: タスク名ごとの claim ループ（lock → 先頭を読む → remove → dispatch → unlock）
//! - **Options**: store/lock/clock/台帳と poll 設定・配信ポリシー
//! - **Status**: poller のカウンタ

pub mod handler;
pub mod options;
mod poller;
pub mod registry;
pub mod status;

pub use self::handler::{FnHandler, TaskHandler, handler_fn};
pub use self::options::{DeliveryPolicy, Options, OptionsBuilder, PollSettings};
pub use self::registry::DelayQueue;
pub use self::status::PollerCounts;
