use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::{Duration, sleep};
use tracing::{info, warn};

use deferq_core::impls::{InMemoryAttemptLedger, InMemoryLock, InMemorySortedSet};
use deferq_core::observability::init_tracing;
use deferq_core::ports::{AttemptLedger, DistributedLock, SortedSetStore};
use deferq_core::{DelayQueue, DeliveryPolicy, HandlerError, Options, PollSettings, TaskHandler};

type DynError = Box<dyn std::error::Error>;

/// store / lock / 試行回数台帳
struct Backends {
    store: Arc<dyn SortedSetStore>,
    lock: Arc<dyn DistributedLock>,
    attempts: Arc<dyn AttemptLedger>,
}

#[derive(Debug, Deserialize)]
struct EmailPayload {
    to: String,
    subject: String,
}

/// 最初の数回はわざと失敗する（Requeue の動きを見るため）
struct EmailHandler {
    remaining_failures: AtomicU32,
}

impl EmailHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl TaskHandler for EmailHandler {
    async fn handle(&self, payload: String, _options: Options) -> Result<(), HandlerError> {
        let p: EmailPayload = serde_json::from_str(&payload)
            .map_err(|e| HandlerError::permanent(format!("json decode: {e}")))?;

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::new(format!(
                "intentional failure (left={left})"
            )));
        }

        info!(to = %p.to, subject = %p.subject, "email sent");
        Ok(())
    }
}

/// REDIS_URL があれば Redis、なければ in-memory
async fn backends() -> Result<Backends, DynError> {
    match std::env::var("REDIS_URL") {
        Ok(url) => {
            let redis = deferq_redis::connect(&url).await?;
            info!(%url, "using redis backends");
            Ok(Backends {
                store: Arc::new(redis.store),
                lock: Arc::new(redis.lock),
                attempts: Arc::new(redis.attempts),
            })
        }
        Err(_) => {
            info!("REDIS_URL not set, using in-memory backends");
            Ok(Backends {
                store: Arc::new(InMemorySortedSet::new()),
                lock: Arc::new(InMemoryLock::new()),
                attempts: Arc::new(InMemoryAttemptLedger::new()),
            })
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), DynError> {
    init_tracing();

    // (A) ストアとロックを用意して Options を組み立てる
    let backends = backends().await?;
    let options = Options::builder(backends.store, backends.lock)
        .attempt_ledger(backends.attempts)
        .settings(PollSettings::from_env()?)
        .delivery(DeliveryPolicy::Requeue {
            delay: Duration::from_millis(200),
            max_attempts: 3,
        })
        .build()?;
    info!(settings = ?options.settings(), "options built");

    // (B) handler を登録して bind（auto_start で poller も起動）
    let queue = DelayQueue::new();
    queue.assign("email", EmailHandler::new(1));
    queue.bind(options, true)?;

    // (C) 遅延タスク投入
    for (i, delay_ms) in [300u64, 100, 200].into_iter().enumerate() {
        let payload = serde_json::json!({
            "to": format!("user{i}@example.com"),
            "subject": "welcome",
        })
        .to_string();
        let due_at = queue
            .join("email", Duration::from_millis(delay_ms), payload)
            .await?;
        info!(%due_at, delay_ms, "joined");
    }

    // (D) すべて配信されるまで待つ
    for _ in 0..50 {
        let counts = queue.counts();
        if counts.dispatched >= 4 {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }

    let counts = queue.counts();
    if counts.handler_failures > 1 {
        warn!(failures = counts.handler_failures, "unexpected failures");
    }
    println!("counts: {}", serde_json::to_string_pretty(&counts)?);

    // (E) poller を止めて終了を待つ
    queue.shutdown_and_join().await;
    Ok(())
}
