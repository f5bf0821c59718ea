//! Handler - タスク名ごとの handler trait と closure アダプタ

use std::future::Future;

use async_trait::async_trait;

use super::options::Options;
use crate::domain::HandlerError;

/// A handler for one task name.
///
/// Receives the claimed payload and the process-wide `Options`, so it can
/// schedule follow-up work through the same store.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, payload: String, options: Options) -> Result<(), HandlerError>;
}

/// Adapts an async closure into a `TaskHandler`.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap `f` as a handler.
///
/// ```ignore
/// queue.assign("email", handler_fn(|payload, _options| async move {
///     send_mail(&payload).await.map_err(|e| HandlerError::new(e.to_string()))
/// }));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(String, Options) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(String, Options) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, payload: String, options: Options) -> Result<(), HandlerError> {
        (self.f)(payload, options).await
    }
}
