//! deferq-redis
//!
//! `deferq-core` のポートの Redis 実装:
//!
//! - **RedisSortedSetStore**: タスク名ごとの sorted set に
//!   `ZADD` / `ZRANGEBYSCORE` / `ZREM` / `ZSCORE` / `ZRANK`
//! - **RedisLock**: 取得は `SET key token NX PX ttl`、解放は Lua の compare-and-delete
//! - **RedisAttemptLedger**: `attempts/<name>` hash に `HINCRBY` / `HDEL`
//!
//! いずれも multiplexed の非同期接続を共有し、自由に clone できる。

mod attempts;
mod lock;
mod store;

pub use attempts::RedisAttemptLedger;
pub use lock::RedisLock;
pub use store::RedisSortedSetStore;

/// Every Redis-backed capability over one multiplexed connection.
#[derive(Clone)]
pub struct RedisBackends {
    pub store: RedisSortedSetStore,
    pub lock: RedisLock,
    pub attempts: RedisAttemptLedger,
}

/// Connect once and hand out all capabilities over the same connection.
pub async fn connect(redis_url: impl AsRef<str>) -> Result<RedisBackends, redis::RedisError> {
    let client = redis::Client::open(redis_url.as_ref())?;
    let conn = client.get_multiplexed_tokio_connection().await?;
    Ok(RedisBackends {
        store: RedisSortedSetStore::new(conn.clone()),
        lock: RedisLock::new(conn.clone()),
        attempts: RedisAttemptLedger::new(conn),
    })
}
