//! Error - 公開 API のエラー型

use std::time::Duration;

use thiserror::Error;

use crate::ports::{LockError, StoreError};

/// Error surfaced by the public `DelayQueue` API.
#[derive(Debug, Error)]
pub enum DelayError {
    #[error("delay queue is not bound; call bind() first")]
    NotBound,

    #[error("delay queue is already bound")]
    AlreadyBound,

    #[error("every registered task already has a running poller")]
    AlreadyRunning,

    #[error("delay queue was stopped")]
    Stopped,

    #[error("no tokio runtime available to spawn pollers")]
    NoRuntime,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),
}
