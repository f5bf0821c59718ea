//! Options - poller と handler に渡すプロセス共通の設定
//!
//! `Options::builder(store, lock)` で一度だけ組み立て、build 時に検証する
//! （fail-fast: 設定ミスの poller は起動しない）。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DelayError;
use crate::impls::InMemoryAttemptLedger;
use crate::ports::{AttemptLedger, Clock, DistributedLock, SortedSetStore, SystemClock};

pub const ENV_POLL_INTERVAL_MS: &str = "DEFERQ_POLL_INTERVAL_MS";
pub const ENV_LOCK_TTL_MS: &str = "DEFERQ_LOCK_TTL_MS";
pub const ENV_CALL_TIMEOUT_MS: &str = "DEFERQ_CALL_TIMEOUT_MS";

/// Poller tunables.
///
/// `poll_interval_ms` is the latency/load trade-off: shorter means earlier
/// dispatch and more lock/store round-trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub poll_interval_ms: u64,
    pub lock_ttl_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            lock_ttl_ms: 5_000,
            call_timeout_ms: 2_000,
        }
    }
}

impl PollSettings {
    /// Defaults overridden by `DEFERQ_*` environment variables when present.
    pub fn from_env() -> Result<Self, DelayError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, DelayError> {
        let mut settings = Self::default();
        let parse = |key: &str, slot: &mut u64| -> Result<(), DelayError> {
            if let Some(raw) = lookup(key) {
                *slot = raw.trim().parse().map_err(|e| {
                    DelayError::InvalidConfig(format!("{key}={raw:?}: {e}"))
                })?;
            }
            Ok(())
        };
        parse(ENV_POLL_INTERVAL_MS, &mut settings.poll_interval_ms)?;
        parse(ENV_LOCK_TTL_MS, &mut settings.lock_ttl_ms)?;
        parse(ENV_CALL_TIMEOUT_MS, &mut settings.call_timeout_ms)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), DelayError> {
        if self.poll_interval_ms == 0 {
            return Err(DelayError::InvalidConfig(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        if self.call_timeout_ms == 0 {
            return Err(DelayError::InvalidConfig(
                "call timeout must be greater than zero".to_string(),
            ));
        }
        // ロック保持中に read と remove の 2 回 bounded call がある
        if self.lock_ttl_ms <= self.call_timeout_ms.saturating_mul(2) {
            return Err(DelayError::InvalidConfig(format!(
                "lock ttl ({}ms) must exceed twice the call timeout ({}ms)",
                self.lock_ttl_ms, self.call_timeout_ms
            )));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// What happens to a payload whose handler fails.
///
/// The item has already left the queue when the handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryPolicy {
    /// Log and drop. Fire-and-forget, at most one delivery.
    #[default]
    AtMostOnce,
    /// Put the payload back with score `now + delay` after a transient
    /// failure or panic, up to `max_attempts` deliveries in total.
    ///
    /// Attempts are counted in the `AttemptLedger` of `Options`. The budget is
    /// cluster-wide only when every process shares that ledger
    /// (既定の in-memory 台帳はプロセス単位).
    Requeue { delay: Duration, max_attempts: u32 },
}

/// Configuration shared by every poller and passed to every handler.
///
/// Cheap to clone: all capabilities are behind `Arc`.
#[derive(Clone)]
pub struct Options {
    store: Arc<dyn SortedSetStore>,
    lock: Arc<dyn DistributedLock>,
    clock: Arc<dyn Clock>,
    attempts: Arc<dyn AttemptLedger>,
    settings: PollSettings,
    delivery: DeliveryPolicy,
}

impl Options {
    pub fn builder(
        store: Arc<dyn SortedSetStore>,
        lock: Arc<dyn DistributedLock>,
    ) -> OptionsBuilder {
        OptionsBuilder::new(store, lock)
    }

    pub fn store(&self) -> &Arc<dyn SortedSetStore> {
        &self.store
    }

    pub fn lock(&self) -> &Arc<dyn DistributedLock> {
        &self.lock
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn attempts(&self) -> &Arc<dyn AttemptLedger> {
        &self.attempts
    }

    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    pub fn delivery(&self) -> DeliveryPolicy {
        self.delivery
    }

    pub fn poll_interval(&self) -> Duration {
        self.settings.poll_interval()
    }

    pub fn lock_ttl(&self) -> Duration {
        self.settings.lock_ttl()
    }

    pub fn call_timeout(&self) -> Duration {
        self.settings.call_timeout()
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("settings", &self.settings)
            .field("delivery", &self.delivery)
            .finish_non_exhaustive()
    }
}

/// OptionsBuilder assembles `Options`.
///
/// # 使用例
/// ```ignore
/// let options = Options::builder(store, lock)
///     .poll_interval(Duration::from_millis(50))
///     .delivery(DeliveryPolicy::Requeue { delay: Duration::from_secs(1), max_attempts: 3 })
///     .build()?;
/// ```
pub struct OptionsBuilder {
    store: Arc<dyn SortedSetStore>,
    lock: Arc<dyn DistributedLock>,
    clock: Arc<dyn Clock>,
    attempts: Option<Arc<dyn AttemptLedger>>,
    settings: PollSettings,
    delivery: DeliveryPolicy,
}

impl OptionsBuilder {
    pub fn new(store: Arc<dyn SortedSetStore>, lock: Arc<dyn DistributedLock>) -> Self {
        Self {
            store,
            lock,
            clock: Arc::new(SystemClock),
            attempts: None,
            settings: PollSettings::default(),
            delivery: DeliveryPolicy::default(),
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Ledger for `DeliveryPolicy::Requeue`. Defaults to a process-local one.
    pub fn attempt_ledger(mut self, ledger: Arc<dyn AttemptLedger>) -> Self {
        self.attempts = Some(ledger);
        self
    }

    pub fn settings(mut self, settings: PollSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.settings.poll_interval_ms = millis(interval);
        self
    }

    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.settings.lock_ttl_ms = millis(ttl);
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.settings.call_timeout_ms = millis(timeout);
        self
    }

    pub fn delivery(mut self, delivery: DeliveryPolicy) -> Self {
        self.delivery = delivery;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<Options, DelayError> {
        self.settings.validate()?;
        if let DeliveryPolicy::Requeue { max_attempts, .. } = self.delivery
            && max_attempts == 0
        {
            return Err(DelayError::InvalidConfig(
                "requeue policy needs max_attempts >= 1".to_string(),
            ));
        }
        Ok(Options {
            store: self.store,
            lock: self.lock,
            clock: self.clock,
            attempts: self
                .attempts
                .unwrap_or_else(|| Arc::new(InMemoryAttemptLedger::new())),
            settings: self.settings,
            delivery: self.delivery,
        })
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
