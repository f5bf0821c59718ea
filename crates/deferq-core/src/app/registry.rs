//! Registry - handler 登録と poller のライフサイクル
//!
//! bind は一度だけ。run はタスク名ごとに poller を 1 本だけ起動する。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::handler::TaskHandler;
use super::options::Options;
use super::poller::{HandlerTable, Poller, bounded, lock_unpoisoned};
use super::status::{PollerCounts, PollerStats};
use crate::domain::{DueAt, TaskName};
use crate::error::DelayError;

#[derive(Default)]
struct Pollers {
    running: HashSet<TaskName>,
    joins: Vec<JoinHandle<()>>,
}

struct Inner {
    options: OnceLock<Options>,
    handlers: Arc<HandlerTable>,
    pollers: Mutex<Pollers>,
    shutdown_tx: watch::Sender<bool>,
    stats: Arc<PollerStats>,
}

/// Registry of delayed-task handlers plus the lifecycle of their pollers.
///
/// Construct one per process (or several in tests); clones share state.
///
/// Design:
/// - `bind` installs `Options` exactly once.
/// - `assign` may be called any time; a name only gets a poller on the next `run`.
/// - `run` starts at most one poller per name; `stop` signals all of them.
#[derive(Clone)]
pub struct DelayQueue {
    inner: Arc<Inner>,
}

impl Default for DelayQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayQueue {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                options: OnceLock::new(),
                handlers: Arc::new(Mutex::new(HashMap::new())),
                pollers: Mutex::new(Pollers::default()),
                shutdown_tx,
                stats: Arc::new(PollerStats::default()),
            }),
        }
    }

    /// Install configuration; optionally start pollers for every assigned name.
    ///
    /// Fails with `AlreadyBound` on a second call. With `auto_start`, a queue
    /// that could not start (`Stopped`, `NoRuntime`) stays unbound.
    pub fn bind(&self, options: Options, auto_start: bool) -> Result<(), DelayError> {
        if auto_start {
            self.startable()?;
        }
        self.inner
            .options
            .set(options)
            .map_err(|_| DelayError::AlreadyBound)?;
        info!(auto_start, "delay queue bound");

        if auto_start {
            self.run()?;
        }
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        self.inner.options.get().is_some()
    }

    /// Register the handler for `name`; returns `true` if one was replaced.
    pub fn assign(&self, name: impl Into<TaskName>, handler: impl TaskHandler + 'static) -> bool {
        self.assign_arc(name, Arc::new(handler))
    }

    pub fn assign_arc(&self, name: impl Into<TaskName>, handler: Arc<dyn TaskHandler>) -> bool {
        let name = name.into();
        let replaced = lock_unpoisoned(&self.inner.handlers)
            .insert(name.clone(), handler)
            .is_some();
        debug!(task = %name, replaced, "handler assigned");
        replaced
    }

    /// Names with a registered handler, sorted.
    pub fn task_names(&self) -> Vec<TaskName> {
        let mut names: Vec<TaskName> = lock_unpoisoned(&self.inner.handlers)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Names with a running poller, sorted.
    pub fn running_tasks(&self) -> Vec<TaskName> {
        let mut names: Vec<TaskName> = lock_unpoisoned(&self.inner.pollers)
            .running
            .iter()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Start one poller per assigned name that doesn't have one yet.
    ///
    /// Returns how many were started. Must be called inside a tokio runtime.
    pub fn run(&self) -> Result<usize, DelayError> {
        let options = self.options()?.clone();
        let runtime = self.startable()?;

        let names = self.task_names();
        let mut pollers = lock_unpoisoned(&self.inner.pollers);
        let mut started = 0;
        for name in names {
            if pollers.running.contains(&name) {
                continue;
            }
            let poller = Poller::new(
                name.clone(),
                Arc::clone(&self.inner.handlers),
                options.clone(),
                Arc::clone(&self.inner.stats),
            );
            let join = runtime.spawn(poller.run(self.inner.shutdown_tx.subscribe()));
            pollers.running.insert(name);
            pollers.joins.push(join);
            started += 1;
        }

        if started == 0 && !pollers.running.is_empty() {
            return Err(DelayError::AlreadyRunning);
        }
        info!(started, total = pollers.running.len(), "pollers running");
        Ok(started)
    }

    /// poller を起動できる状態か（stop 前かつ tokio runtime 上）.
    fn startable(&self) -> Result<Handle, DelayError> {
        if self.is_stopped() {
            return Err(DelayError::Stopped);
        }
        Handle::try_current().map_err(|_| DelayError::NoRuntime)
    }

    /// Signal every poller to exit at its next iteration boundary.
    ///
    /// Does not wait and does not cancel handlers already dispatched.
    pub fn stop(&self) {
        let was_stopped = self.inner.shutdown_tx.send_replace(true);
        if !was_stopped {
            info!("stop requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }

    /// Wait for every poller task started so far to exit.
    ///
    /// Only returns once `stop` has been called (or the tasks were aborted).
    pub async fn join_pollers(&self) {
        let joins = std::mem::take(&mut lock_unpoisoned(&self.inner.pollers).joins);
        for join in joins {
            let _ = join.await;
        }
    }

    /// `stop` followed by `join_pollers`.
    pub async fn shutdown_and_join(&self) {
        self.stop();
        self.join_pollers().await;
    }

    /// Schedule `payload` under `name` to fire `delay` from now.
    ///
    /// Re-joining a payload already scheduled under `name` moves its due time;
    /// it never creates a second entry.
    pub async fn join(
        &self,
        name: impl Into<TaskName>,
        delay: Duration,
        payload: impl Into<String>,
    ) -> Result<DueAt, DelayError> {
        let options = self.options()?;
        let name = name.into();
        let payload = payload.into();
        let due_at = options.clock().now_millis().after(delay);

        let add = options.store().add(name.as_str(), &payload, due_at);
        bounded("ZADD", options.call_timeout(), add).await?;
        debug!(task = %name, payload = %payload, %due_at, "scheduled");
        Ok(due_at)
    }

    /// Due time of a scheduled payload, `None` if it isn't scheduled.
    pub async fn timestamp(
        &self,
        name: impl Into<TaskName>,
        payload: &str,
    ) -> Result<Option<DueAt>, DelayError> {
        let options = self.options()?;
        let name = name.into();
        let score = options.store().score(name.as_str(), payload);
        bounded("ZSCORE", options.call_timeout(), score).await
    }

    /// Whether `payload` is still waiting under `name`.
    pub async fn exist(
        &self,
        name: impl Into<TaskName>,
        payload: &str,
    ) -> Result<bool, DelayError> {
        let options = self.options()?;
        let name = name.into();
        let rank = options.store().rank(name.as_str(), payload);
        Ok(bounded("ZRANK", options.call_timeout(), rank).await?.is_some())
    }

    /// Unschedule `payload`; `true` if it was still waiting.
    pub async fn cancel(
        &self,
        name: impl Into<TaskName>,
        payload: &str,
    ) -> Result<bool, DelayError> {
        let options = self.options()?;
        let name = name.into();
        let remove = options.store().remove(name.as_str(), payload);
        let removed = bounded("ZREM", options.call_timeout(), remove).await?;
        debug!(task = %name, payload, removed, "cancel");
        Ok(removed)
    }

    pub fn counts(&self) -> PollerCounts {
        self.inner.stats.snapshot()
    }

    pub fn options(&self) -> Result<&Options, DelayError> {
        self.inner.options.get().ok_or(DelayError::NotBound)
    }
}
