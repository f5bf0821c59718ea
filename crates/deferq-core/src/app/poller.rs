//! Poller - タスク名ごとの claim ループ
//!
//! # フロー
//! 1. stop シグナルを確認
//! 2. poll_interval だけ待つ（stop で即起床）
//! 3. try_lock("mutex/" + name)、取れなければスキップ
//! 4. 最も早い要素を読み、due なら remove してから handler を dispatch
//! 5. unlock（結果に関わらず）

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, instrument, trace, warn};

use super::handler::TaskHandler;
use super::options::{DeliveryPolicy, Options};
use super::status::PollerStats;
use crate::domain::{DueAt, QueueItem, TaskName};
use crate::error::DelayError;

pub(crate) type HandlerTable = Mutex<HashMap<TaskName, Arc<dyn TaskHandler>>>;

pub(crate) fn lock_unpoisoned<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run one remote call under the configured timeout budget.
pub(crate) async fn bounded<T, E, F>(
    op: &'static str,
    after: Duration,
    fut: F,
) -> Result<T, DelayError>
where
    F: Future<Output = Result<T, E>>,
    DelayError: From<E>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result.map_err(DelayError::from),
        Err(_) => Err(DelayError::Timeout { op, after }),
    }
}

/// Outcome of one iteration that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Tick {
    Contended,
    Idle,
    NotDue(DueAt),
    Dispatched(QueueItem),
    /// Item vanished between read and remove (cancelled by a producer).
    Lost,
}

pub(crate) struct Poller {
    name: TaskName,
    handlers: Arc<HandlerTable>,
    options: Options,
    stats: Arc<PollerStats>,
}

impl Poller {
    pub(crate) fn new(
        name: TaskName,
        handlers: Arc<HandlerTable>,
        options: Options,
        stats: Arc<PollerStats>,
    ) -> Self {
        Self {
            name,
            handlers,
            options,
            stats,
        }
    }

    pub(crate) async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(task = %self.name, "poller started");
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    // sender gone means the owning DelayQueue was dropped
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = tokio::time::sleep(self.options.poll_interval()) => {}
            }

            PollerStats::bump(&self.stats.iterations);
            match self.tick().await {
                Ok(tick) => self.record(tick),
                Err(err) => {
                    PollerStats::bump(&self.stats.iteration_errors);
                    warn!(task = %self.name, error = %err, "poll iteration failed");
                }
            }
        }
        info!(task = %self.name, "poller stopped");
    }

    fn record(&self, tick: Tick) {
        match tick {
            Tick::Contended => {
                PollerStats::bump(&self.stats.contended);
                trace!(task = %self.name, "lock held elsewhere");
            }
            Tick::Idle => PollerStats::bump(&self.stats.idle),
            Tick::NotDue(due_at) => {
                PollerStats::bump(&self.stats.not_due);
                trace!(task = %self.name, %due_at, "earliest item not due yet");
            }
            Tick::Dispatched(item) => {
                PollerStats::bump(&self.stats.dispatched);
                debug!(
                    task = %self.name,
                    payload = %item.member,
                    due_at = %item.due_at,
                    "dispatched"
                );
            }
            Tick::Lost => {
                PollerStats::bump(&self.stats.lost);
                debug!(task = %self.name, "item removed by someone else");
            }
        }
    }

    /// One claim attempt under the per-name lock.
    #[instrument(level = "trace", skip(self), fields(task = %self.name))]
    pub(crate) async fn tick(&self) -> Result<Tick, DelayError> {
        let lock_key = self.name.lock_key();
        let timeout = self.options.call_timeout();
        let lock = self.options.lock();

        let acquire = lock.try_lock(&lock_key, self.options.lock_ttl());
        let Some(guard) = bounded("try_lock", timeout, acquire).await? else {
            return Ok(Tick::Contended);
        };

        let result = self.claim().await;

        // claim の成否に関わらず解放する
        match bounded("unlock", timeout, lock.unlock(&guard)).await {
            Ok(true) => {}
            Ok(false) => debug!(task = %self.name, "lock expired before release"),
            Err(err) => warn!(task = %self.name, error = %err, "lock release failed"),
        }

        result
    }

    async fn claim(&self) -> Result<Tick, DelayError> {
        let store = self.options.store();
        let key = self.name.as_str();
        let timeout = self.options.call_timeout();

        let Some(item) = bounded("ZRANGEBYSCORE", timeout, store.first(key)).await? else {
            return Ok(Tick::Idle);
        };

        let now = self.options.clock().now_millis();
        if !item.due_at.is_due(now) {
            return Ok(Tick::NotDue(item.due_at));
        }

        let handler = {
            let handlers = lock_unpoisoned(&self.handlers);
            handlers.get(&self.name).cloned()
        };
        let Some(handler) = handler else {
            // handler を持つ別プロセスに任せる
            return Ok(Tick::Idle);
        };

        // remove が先: ZREM が失敗・空振りなら dispatch しない
        if !bounded("ZREM", timeout, store.remove(key, &item.member)).await? {
            return Ok(Tick::Lost);
        }

        self.dispatch(handler, item.clone());
        Ok(Tick::Dispatched(item))
    }

    /// Fire-and-forget: the handler runs on its own task and the poller moves on.
    fn dispatch(&self, handler: Arc<dyn TaskHandler>, item: QueueItem) {
        let name = self.name.clone();
        let options = self.options.clone();
        let stats = Arc::clone(&self.stats);

        tokio::spawn(async move {
            let payload = item.member;
            // panic は内側 task の JoinError として受け取る
            let run = tokio::spawn({
                let handler = Arc::clone(&handler);
                let payload = payload.clone();
                let options = options.clone();
                async move { handler.handle(payload, options).await }
            });

            let retryable = match run.await {
                Ok(Ok(())) => {
                    if matches!(options.delivery(), DeliveryPolicy::Requeue { .. }) {
                        forget_attempts(&name, &payload, &options).await;
                    }
                    return;
                }
                Ok(Err(err)) => {
                    PollerStats::bump(&stats.handler_failures);
                    warn!(task = %name, payload = %payload, error = %err, "handler failed");
                    err.is_retryable()
                }
                Err(join_err) => {
                    PollerStats::bump(&stats.handler_panics);
                    error!(task = %name, payload = %payload, error = %join_err, "handler panicked");
                    true
                }
            };

            after_failure(&name, payload, &options, &stats, retryable).await;
        });
    }
}

async fn after_failure(
    name: &TaskName,
    payload: String,
    options: &Options,
    stats: &PollerStats,
    retryable: bool,
) {
    let DeliveryPolicy::Requeue { delay, max_attempts } = options.delivery() else {
        PollerStats::bump(&stats.dropped);
        return;
    };

    let key = name.attempts_key();
    let record = options.attempts().record_failure(&key, &payload);
    let delivered = match bounded("HINCRBY", options.call_timeout(), record).await {
        Ok(n) => n,
        Err(err) => {
            // 回数が分からないまま戻すと上限を超えうる
            PollerStats::bump(&stats.dropped);
            warn!(
                task = %name,
                payload = %payload,
                error = %err,
                "attempt count unavailable, payload dropped"
            );
            return;
        }
    };

    if !retryable || delivered >= max_attempts {
        forget_attempts(name, &payload, options).await;
        PollerStats::bump(&stats.dropped);
        warn!(task = %name, payload = %payload, delivered, "giving up on payload");
        return;
    }

    let due_at = options.clock().now_millis().after(delay);
    let add = options.store().add(name.as_str(), &payload, due_at);
    match bounded("ZADD", options.call_timeout(), add).await {
        Ok(()) => {
            PollerStats::bump(&stats.requeued);
            debug!(
                task = %name,
                payload = %payload,
                %due_at,
                delivered,
                "requeued after failure"
            );
        }
        Err(err) => {
            forget_attempts(name, &payload, options).await;
            PollerStats::bump(&stats.dropped);
            warn!(task = %name, payload = %payload, error = %err, "requeue failed, payload lost");
        }
    }
}

async fn forget_attempts(name: &TaskName, payload: &str, options: &Options) {
    let key = name.attempts_key();
    let clear = options.attempts().clear(&key, payload);
    if let Err(err) = bounded("HDEL", options.call_timeout(), clear).await {
        warn!(task = %name, payload, error = %err, "attempt count not cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::handler::handler_fn;
    use crate::app::options::OptionsBuilder;
    use crate::domain::HandlerError;
    use crate::impls::{InMemoryAttemptLedger, InMemoryLock, InMemorySortedSet};
    use crate::ports::{Clock, DistributedLock, ManualClock, SortedSetStore, StoreError};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manual_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ))
    }

    fn builder(
        store: Arc<dyn SortedSetStore>,
        lock: &InMemoryLock,
        clock: &Arc<ManualClock>,
    ) -> OptionsBuilder {
        Options::builder(store, Arc::new(lock.clone())).clock(clock.clone())
    }

    fn poller(options: Options, handler: Arc<dyn TaskHandler>) -> (Poller, Arc<PollerStats>) {
        let name = TaskName::new("email");
        let handlers: Arc<HandlerTable> =
            Arc::new(Mutex::new(HashMap::from([(name.clone(), handler)])));
        let stats = Arc::new(PollerStats::default());
        (Poller::new(name, handlers, options, Arc::clone(&stats)), stats)
    }

    struct Fixture {
        store: InMemorySortedSet,
        lock: InMemoryLock,
        clock: Arc<ManualClock>,
        poller: Poller,
    }

    fn fixture(handler: Arc<dyn TaskHandler>) -> Fixture {
        let store = InMemorySortedSet::new();
        let lock = InMemoryLock::new();
        let clock = manual_clock();
        let options = builder(Arc::new(store.clone()), &lock, &clock)
            .build()
            .unwrap();
        let (poller, _) = poller(options, handler);
        Fixture {
            store,
            lock,
            clock,
            poller,
        }
    }

    fn noop() -> Arc<dyn TaskHandler> {
        Arc::new(handler_fn(|_payload, _options| async { Ok::<(), HandlerError>(()) }))
    }

    /// Counts calls; fails the first `failures` of them.
    fn flaky(calls: Arc<AtomicUsize>, failures: usize) -> Arc<dyn TaskHandler> {
        Arc::new(handler_fn(move |_payload, _options| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < failures {
                    Err::<(), HandlerError>(HandlerError::new("smtp unavailable"))
                } else {
                    Ok(())
                }
            }
        }))
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    /// The earliest item is cancelled right after it is read.
    struct CancelAfterRead {
        inner: InMemorySortedSet,
    }

    #[async_trait]
    impl SortedSetStore for CancelAfterRead {
        async fn add(&self, key: &str, member: &str, score: DueAt) -> Result<(), StoreError> {
            self.inner.add(key, member, score).await
        }

        async fn first(&self, key: &str) -> Result<Option<QueueItem>, StoreError> {
            let item = self.inner.first(key).await?;
            if let Some(item) = &item {
                self.inner.remove(key, &item.member).await?;
            }
            Ok(item)
        }

        async fn remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
            self.inner.remove(key, member).await
        }

        async fn score(&self, key: &str, member: &str) -> Result<Option<DueAt>, StoreError> {
            self.inner.score(key, member).await
        }

        async fn rank(&self, key: &str, member: &str) -> Result<Option<u64>, StoreError> {
            self.inner.rank(key, member).await
        }
    }

    /// Reads and removes work; every ZADD is rejected.
    struct ReadOnly {
        inner: InMemorySortedSet,
    }

    #[async_trait]
    impl SortedSetStore for ReadOnly {
        async fn add(&self, _key: &str, _member: &str, _score: DueAt) -> Result<(), StoreError> {
            Err(StoreError::command("ZADD", "READONLY replica"))
        }

        async fn first(&self, key: &str) -> Result<Option<QueueItem>, StoreError> {
            self.inner.first(key).await
        }

        async fn remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
            self.inner.remove(key, member).await
        }

        async fn score(&self, key: &str, member: &str) -> Result<Option<DueAt>, StoreError> {
            self.inner.score(key, member).await
        }

        async fn rank(&self, key: &str, member: &str) -> Result<Option<u64>, StoreError> {
            self.inner.rank(key, member).await
        }
    }

    #[tokio::test]
    async fn empty_queue_is_idle() {
        let f = fixture(noop());
        assert_eq!(f.poller.tick().await.unwrap(), Tick::Idle);
    }

    #[tokio::test]
    async fn future_item_is_not_claimed_until_due() {
        let f = fixture(noop());
        let due = f.clock.now_millis().after(Duration::from_secs(10));
        f.store.add("email", "user1", due).await.unwrap();

        assert_eq!(f.poller.tick().await.unwrap(), Tick::NotDue(due));
        assert_eq!(f.store.len("email").await, 1);

        f.clock.set_millis(due.as_millis());
        assert_eq!(
            f.poller.tick().await.unwrap(),
            Tick::Dispatched(QueueItem::new("user1", due))
        );
    }

    #[tokio::test]
    async fn due_item_is_removed_and_dispatched() {
        let f = fixture(noop());
        let due = f.clock.now_millis();
        f.store.add("email", "user1", due).await.unwrap();

        let tick = f.poller.tick().await.unwrap();
        assert_eq!(tick, Tick::Dispatched(QueueItem::new("user1", due)));
        assert!(f.store.is_empty("email").await);
        // claim 後にロックは解放済み
        assert!(!f.lock.is_locked("mutex/email").await);
    }

    #[tokio::test]
    async fn held_lock_means_contended() {
        let f = fixture(noop());
        f.store
            .add("email", "user1", f.clock.now_millis())
            .await
            .unwrap();
        let _held = f
            .lock
            .try_lock("mutex/email", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(f.poller.tick().await.unwrap(), Tick::Contended);
        assert_eq!(f.store.len("email").await, 1);
    }

    #[tokio::test]
    async fn earliest_due_item_goes_first() {
        let f = fixture(noop());
        let now = f.clock.now_millis().as_millis();
        f.store.add("email", "second", DueAt::from_millis(now - 10)).await.unwrap();
        f.store.add("email", "first", DueAt::from_millis(now - 20)).await.unwrap();

        let Tick::Dispatched(item) = f.poller.tick().await.unwrap() else {
            panic!("expected a dispatch");
        };
        assert_eq!(item.member, "first");
        f.clock.advance(Duration::from_millis(1));
        let Tick::Dispatched(item) = f.poller.tick().await.unwrap() else {
            panic!("expected a dispatch");
        };
        assert_eq!(item.member, "second");
    }

    #[tokio::test]
    async fn item_cancelled_between_read_and_remove_is_not_dispatched() {
        let inner = InMemorySortedSet::new();
        let lock = InMemoryLock::new();
        let clock = manual_clock();
        let calls = Arc::new(AtomicUsize::new(0));
        let store = CancelAfterRead {
            inner: inner.clone(),
        };
        let options = builder(Arc::new(store), &lock, &clock).build().unwrap();
        let (poller, stats) = poller(options, flaky(calls.clone(), 0));

        inner.add("email", "user1", clock.now_millis()).await.unwrap();
        let tick = poller.tick().await.unwrap();
        assert_eq!(tick, Tick::Lost);
        poller.record(tick);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let counts = stats.snapshot();
        assert_eq!(counts.lost, 1);
        assert_eq!(counts.dispatched, 0);
        assert!(!lock.is_locked("mutex/email").await);
    }

    #[tokio::test]
    async fn failed_requeue_drops_payload_and_clears_count() {
        let inner = InMemorySortedSet::new();
        let lock = InMemoryLock::new();
        let clock = manual_clock();
        let ledger = InMemoryAttemptLedger::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = builder(Arc::new(ReadOnly { inner: inner.clone() }), &lock, &clock)
            .attempt_ledger(Arc::new(ledger.clone()))
            .delivery(DeliveryPolicy::Requeue {
                delay: Duration::ZERO,
                max_attempts: 3,
            })
            .build()
            .unwrap();
        let (poller, stats) = poller(options, flaky(calls.clone(), usize::MAX));

        inner.add("email", "user1", clock.now_millis()).await.unwrap();
        assert!(matches!(poller.tick().await.unwrap(), Tick::Dispatched(_)));

        wait_for(|| stats.snapshot().dropped == 1).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.snapshot().requeued, 0);
        assert!(inner.is_empty("email").await);
        assert!(ledger.is_empty().await);
    }

    #[tokio::test]
    async fn attempt_budget_is_shared_between_pollers() {
        let store = InMemorySortedSet::new();
        let lock = InMemoryLock::new();
        let clock = manual_clock();
        let ledger = InMemoryAttemptLedger::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = DeliveryPolicy::Requeue {
            delay: Duration::ZERO,
            max_attempts: 2,
        };
        let process = || {
            let options = builder(Arc::new(store.clone()), &lock, &clock)
                .attempt_ledger(Arc::new(ledger.clone()))
                .delivery(policy)
                .build()
                .unwrap();
            poller(options, flaky(calls.clone(), usize::MAX))
        };
        let (a, a_stats) = process();
        let (b, b_stats) = process();

        store.add("email", "user1", clock.now_millis()).await.unwrap();

        assert!(matches!(a.tick().await.unwrap(), Tick::Dispatched(_)));
        wait_for(|| a_stats.snapshot().requeued == 1).await;

        // 2 回目の配信は別プロセスだが、回数は共有台帳で数える
        assert!(matches!(b.tick().await.unwrap(), Tick::Dispatched(_)));
        wait_for(|| b_stats.snapshot().dropped == 1).await;

        assert_eq!(a.tick().await.unwrap(), Tick::Idle);
        assert_eq!(b.tick().await.unwrap(), Tick::Idle);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(ledger.is_empty().await);
    }

    #[tokio::test]
    async fn success_after_requeue_clears_count() {
        let store = InMemorySortedSet::new();
        let lock = InMemoryLock::new();
        let clock = manual_clock();
        let ledger = InMemoryAttemptLedger::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = builder(Arc::new(store.clone()), &lock, &clock)
            .attempt_ledger(Arc::new(ledger.clone()))
            .delivery(DeliveryPolicy::Requeue {
                delay: Duration::ZERO,
                max_attempts: 3,
            })
            .build()
            .unwrap();
        let (poller, stats) = poller(options, flaky(calls.clone(), 1));

        store.add("email", "user1", clock.now_millis()).await.unwrap();
        poller.tick().await.unwrap();
        wait_for(|| stats.snapshot().requeued == 1).await;
        assert_eq!(ledger.len().await, 1);

        poller.tick().await.unwrap();
        wait_for(|| calls.load(Ordering::SeqCst) == 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ledger.is_empty().await);
        assert_eq!(stats.snapshot().dropped, 0);
    }

    #[tokio::test]
    async fn bounded_maps_timeouts() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<(), StoreError>(())
        };
        let err = bounded("ZADD", Duration::from_millis(10), slow).await.unwrap_err();
        assert!(matches!(err, DelayError::Timeout { op: "ZADD", .. }));
    }
}
