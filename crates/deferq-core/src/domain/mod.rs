//! Domain - タスク名・due time・キュー要素・handler エラー

pub mod errors;
pub mod task;

pub use self::errors::{ErrorKind, HandlerError};
pub use self::task::{ATTEMPTS_PREFIX, DueAt, LOCK_PREFIX, QueueItem, TaskName};
