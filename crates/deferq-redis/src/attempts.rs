use async_trait::async_trait;
use redis::aio::MultiplexedConnection;

use deferq_core::ports::{AttemptLedger, StoreError};

use crate::store::command_error;

/// Attempt counts in one Redis hash per task name (`attempts/<name>`),
/// so every process shares the same Requeue budget.
#[derive(Clone)]
pub struct RedisAttemptLedger {
    conn: MultiplexedConnection,
}

impl RedisAttemptLedger {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl AttemptLedger for RedisAttemptLedger {
    async fn record_failure(&self, key: &str, member: &str) -> Result<u32, StoreError> {
        let mut conn = self.conn.clone();
        let total: i64 = redis::cmd("HINCRBY")
            .arg(key)
            .arg(member)
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(command_error("HINCRBY"))?;
        u32::try_from(total).map_err(|_| StoreError::Decode {
            command: "HINCRBY",
            message: format!("attempt count out of range: {total}"),
        })
    }

    async fn clear(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("HDEL")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(command_error("HDEL"))?;
        Ok(())
    }
}
