use async_trait::async_trait;
use redis::aio::MultiplexedConnection;

use deferq_core::domain::{DueAt, QueueItem};
use deferq_core::ports::{SortedSetStore, StoreError};

/// Sorted-set store on Redis. The task name is the Redis key.
#[derive(Clone)]
pub struct RedisSortedSetStore {
    conn: MultiplexedConnection,
}

impl RedisSortedSetStore {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

pub(crate) fn command_error(command: &'static str) -> impl FnOnce(redis::RedisError) -> StoreError {
    move |e| {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            StoreError::Connection(format!("{command}: {e}"))
        } else {
            StoreError::command(command, e.to_string())
        }
    }
}

/// Redis の score は double、due time は整数ミリ秒
fn to_due_at(command: &'static str, score: f64) -> Result<DueAt, StoreError> {
    if !score.is_finite() {
        return Err(StoreError::Decode {
            command,
            message: format!("non-finite score {score}"),
        });
    }
    Ok(DueAt::from_millis(score as i64))
}

#[async_trait]
impl SortedSetStore for RedisSortedSetStore {
    async fn add(&self, key: &str, member: &str, score: DueAt) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score.as_millis())
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(command_error("ZADD"))?;
        Ok(())
    }

    async fn first(&self, key: &str) -> Result<Option<QueueItem>, StoreError> {
        let mut conn = self.conn.clone();
        let items: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg("+inf")
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(command_error("ZRANGEBYSCORE"))?;

        match items.into_iter().next() {
            Some((member, score)) => Ok(Some(QueueItem::new(
                member,
                to_due_at("ZRANGEBYSCORE", score)?,
            ))),
            None => Ok(None),
        }
    }

    async fn remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(command_error("ZREM"))?;
        Ok(removed > 0)
    }

    async fn score(&self, key: &str, member: &str) -> Result<Option<DueAt>, StoreError> {
        let mut conn = self.conn.clone();
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(command_error("ZSCORE"))?;
        score.map(|s| to_due_at("ZSCORE", s)).transpose()
    }

    async fn rank(&self, key: &str, member: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn.clone();
        // nil は member なし
        let rank: Option<u64> = redis::cmd("ZRANK")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(command_error("ZRANK"))?;
        Ok(rank)
    }
}
