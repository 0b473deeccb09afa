//! Redis-backed broker implementation.

mod broker;

pub use broker::RedisBroker;

use deadpool_redis::{Manager, Pool, Runtime};
use tracing::info;

use crate::config::ConnectionConfig;
use crate::error::{QueueError, QueueResult};

/// Create a Redis connection pool for the task queue.
pub async fn create_pool(config: &ConnectionConfig) -> QueueResult<Pool> {
    info!(address = %config.address, db = config.db, "Creating Redis connection pool...");

    let manager = Manager::new(config.connection_info()?)
        .map_err(|e| QueueError::Configuration(format!("Invalid Redis connection: {e}")))?;

    let pool = Pool::builder(manager)
        .max_size(config.pool_size)
        .create_timeout(Some(config.dial_timeout()))
        .wait_timeout(Some(config.dial_timeout()))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| QueueError::Configuration(format!("Failed to create pool: {e}")))?;

    // Test connection
    let mut conn = pool.get().await?;
    redis::cmd("PING").query_async::<String>(&mut *conn).await?;

    info!(pool_size = config.pool_size, "Redis connection pool ready");

    Ok(pool)
}

/// Redis key builder for the task queue.
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    /// Create a new key builder with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Pending queue key (list, FIFO).
    pub fn pending(&self, queue: &str) -> String {
        format!("{}:pending:{}", self.prefix, queue)
    }

    /// Delayed messages key (sorted set by eligibility time).
    pub fn delayed(&self) -> String {
        format!("{}:delayed", self.prefix)
    }

    /// Active messages key (hash: task_id -> worker_id).
    pub fn active(&self) -> String {
        format!("{}:active", self.prefix)
    }

    /// Task record key.
    pub fn task(&self, task_id: &str) -> String {
        format!("{}:task:{}", self.prefix, task_id)
    }

    /// Dead messages key (sorted set by death time).
    pub fn dead(&self) -> String {
        format!("{}:dead", self.prefix)
    }

    /// Unique task key for deduplication.
    pub fn unique(&self, key: &str) -> String {
        format!("{}:unique:{}", self.prefix, key)
    }

    /// Worker heartbeat key.
    pub fn worker(&self, worker_id: &str) -> String {
        format!("{}:worker:{}", self.prefix, worker_id)
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new("ferroq")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_keys() {
        let keys = RedisKeys::new("test");

        assert_eq!(keys.pending("default"), "test:pending:default");
        assert_eq!(keys.task("123"), "test:task:123");
        assert_eq!(keys.delayed(), "test:delayed");
        assert_eq!(keys.dead(), "test:dead");
        assert_eq!(keys.unique("report-42"), "test:unique:report-42");
        assert_eq!(keys.worker("w1"), "test:worker:w1");
    }

    #[test]
    fn test_default_prefix() {
        let keys = RedisKeys::default();
        assert_eq!(keys.active(), "ferroq:active");
    }
}
