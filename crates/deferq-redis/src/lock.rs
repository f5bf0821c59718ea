use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::trace;

use deferq_core::ports::{DistributedLock, LockError, LockGuard, fresh_token};

/// token が自分のものの場合だけ DEL する
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Single-instance Redis lock: `SET name token NX PX ttl`.
#[derive(Clone)]
pub struct RedisLock {
    conn: MultiplexedConnection,
    release: redis::Script,
}

impl RedisLock {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            release: redis::Script::new(RELEASE_SCRIPT),
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn lock_error(op: &'static str, name: &str, e: redis::RedisError) -> LockError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        LockError::Connection(format!("{op} {name}: {e}"))
    } else {
        LockError::Operation {
            op,
            name: name.to_string(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_lock(&self, name: &str, ttl: Duration) -> Result<Option<LockGuard>, LockError> {
        let mut conn = self.conn.clone();
        let token = fresh_token();
        // 取れたら "OK"、既に存在すれば nil
        let reply: Option<String> = redis::cmd("SET")
            .arg(name)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| lock_error("SET NX", name, e))?;

        match reply {
            Some(_) => Ok(Some(LockGuard::new(name, token))),
            None => {
                trace!(lock = name, "already held");
                Ok(None)
            }
        }
    }

    async fn unlock(&self, guard: &LockGuard) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release
            .key(guard.name())
            .arg(guard.token())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| lock_error("release", guard.name(), e))?;
        Ok(deleted == 1)
    }
}
