//! Redis broker implementation.

use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Connection, Pool};
use redis::AsyncCommands;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::RedisKeys;
use crate::broker::Broker;
use crate::config::ConnectionConfig;
use crate::error::{QueueError, QueueResult};
use crate::task::{TaskId, TaskMessage};

/// Redis-backed broker.
///
/// Pending queues are lists (FIFO within a queue); delayed and dead messages
/// live in sorted sets scored by time. Every round-trip is bounded by the
/// configured io timeout.
pub struct RedisBroker {
    pool: Pool,
    keys: RedisKeys,
    io_timeout: Duration,
}

impl RedisBroker {
    /// Create a broker over an existing pool.
    pub fn new(pool: Pool, config: &ConnectionConfig) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(config.key_prefix.clone()),
            io_timeout: config.io_timeout(),
        }
    }

    /// Get a connection from the pool.
    async fn conn(&self) -> QueueResult<Connection> {
        Ok(self.pool.get().await?)
    }

    /// Bound a broker round-trip by the io timeout.
    async fn timed<T, F>(&self, fut: F) -> QueueResult<T>
    where
        F: Future<Output = QueueResult<T>>,
    {
        match tokio::time::timeout(self.io_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(QueueError::Timeout(self.io_timeout.as_secs())),
        }
    }

    async fn enqueue_inner(&self, mut conn: Connection, msg: TaskMessage) -> QueueResult<TaskId> {
        if let Some(key) = &msg.unique_key {
            let unique_key = self.keys.unique(key);
            let exists: bool = conn.exists(&unique_key).await?;
            if exists {
                return Err(QueueError::Duplicate(key.clone()));
            }
            let _: () = conn
                .set_ex(&unique_key, msg.id.to_string(), msg.unique_ttl_secs)
                .await?;
        }

        let json = msg.to_json()?;
        let _: () = conn.set(self.keys.task(&msg.id.to_string()), &json).await?;

        if msg.scheduled_at > Utc::now() {
            let _: () = conn
                .zadd(self.keys.delayed(), &json, msg.scheduled_at.timestamp_millis())
                .await?;
            debug!(
                task_id = %msg.id,
                queue = %msg.queue,
                scheduled_at = %msg.scheduled_at,
                "enqueued delayed task"
            );
        } else {
            let _: () = conn.rpush(self.keys.pending(&msg.queue), &json).await?;
            debug!(task_id = %msg.id, queue = %msg.queue, "enqueued task");
        }

        crate::metrics::record_enqueued(&msg.queue);
        Ok(msg.id)
    }

    async fn dequeue_inner(
        &self,
        mut conn: Connection,
        queues: &[String],
        worker_id: &str,
    ) -> QueueResult<Option<TaskMessage>> {
        for queue in queues {
            let popped: Option<String> = conn.lpop(self.keys.pending(queue), None).await?;
            let Some(json) = popped else {
                continue;
            };

            match TaskMessage::from_json(&json) {
                Ok(mut msg) => {
                    msg.increment_attempt();
                    let _: () = conn
                        .set(self.keys.task(&msg.id.to_string()), msg.to_json()?)
                        .await?;
                    let _: () = conn
                        .hset(self.keys.active(), msg.id.to_string(), worker_id)
                        .await?;

                    debug!(
                        task_id = %msg.id,
                        queue = %msg.queue,
                        attempt = msg.attempt,
                        worker_id,
                        "dequeued task"
                    );
                    return Ok(Some(msg));
                }
                Err(e) => {
                    error!(error = %e, queue = %queue, "failed to deserialize task message, dropping");
                    continue;
                }
            }
        }

        Ok(None)
    }

    async fn ack_inner(&self, mut conn: Connection, id: &TaskId) -> QueueResult<()> {
        let id_str = id.to_string();
        let task_key = self.keys.task(&id_str);

        let json: Option<String> = conn.get(&task_key).await?;
        let _: () = conn.hdel(self.keys.active(), &id_str).await?;

        if let Some(json) = json {
            if let Ok(msg) = TaskMessage::from_json(&json) {
                if let Some(key) = &msg.unique_key {
                    let _: () = conn.del(self.keys.unique(key)).await?;
                }
                crate::metrics::record_completed(&msg.queue);
            }
        }

        let _: () = conn.del(&task_key).await?;
        debug!(task_id = %id, "task completed");
        Ok(())
    }

    async fn fail_inner(
        &self,
        mut conn: Connection,
        id: &TaskId,
        error: &QueueError,
    ) -> QueueResult<()> {
        let id_str = id.to_string();
        let task_key = self.keys.task(&id_str);

        let json: Option<String> = conn.get(&task_key).await?;
        let _: () = conn.hdel(self.keys.active(), &id_str).await?;

        let Some(json) = json else {
            warn!(task_id = %id, "failed task has no record");
            return Ok(());
        };

        let mut msg = TaskMessage::from_json(&json)?;
        msg.set_error(error);

        if !msg.is_exhausted() && error.is_retryable() {
            let delay = msg.retry_delay();
            msg.scheduled_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();

            let updated = msg.to_json()?;
            let _: () = conn.set(&task_key, &updated).await?;
            let _: () = conn
                .zadd(self.keys.delayed(), &updated, msg.scheduled_at.timestamp_millis())
                .await?;

            crate::metrics::record_retried(&msg.queue);
            debug!(
                task_id = %msg.id,
                attempt = msg.attempt,
                retry_at = %msg.scheduled_at,
                "scheduled task retry"
            );
        } else {
            let updated = msg.to_json()?;
            let _: () = conn.set(&task_key, &updated).await?;
            let _: () = conn
                .zadd(self.keys.dead(), &updated, Utc::now().timestamp_millis())
                .await?;
            if let Some(key) = &msg.unique_key {
                let _: () = conn.del(self.keys.unique(key)).await?;
            }

            crate::metrics::record_dead_lettered(&msg.queue);
            warn!(
                task_id = %msg.id,
                error = %error,
                attempts = msg.attempt,
                "task moved to the dead set"
            );
        }

        Ok(())
    }

    async fn promote_delayed_inner(&self, mut conn: Connection) -> QueueResult<u64> {
        let now = Utc::now().timestamp_millis();
        let due: Vec<String> = conn.zrangebyscore(self.keys.delayed(), 0i64, now).await?;

        let mut moved = 0u64;
        for json in due {
            let Ok(msg) = TaskMessage::from_json(&json) else {
                error!("failed to deserialize delayed task message, dropping");
                let _: () = conn.zrem(self.keys.delayed(), &json).await?;
                continue;
            };

            let _: () = redis::pipe()
                .zrem(self.keys.delayed(), &json)
                .rpush(self.keys.pending(&msg.queue), &json)
                .query_async(&mut *conn)
                .await?;

            moved += 1;
            debug!(task_id = %msg.id, queue = %msg.queue, "promoted delayed task");
        }

        Ok(moved)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, message: TaskMessage) -> QueueResult<TaskId> {
        let conn = self.conn().await?;
        self.timed(self.enqueue_inner(conn, message)).await
    }

    async fn dequeue(
        &self,
        queues: &[String],
        worker_id: &str,
    ) -> QueueResult<Option<TaskMessage>> {
        let conn = self.conn().await?;
        self.timed(self.dequeue_inner(conn, queues, worker_id)).await
    }

    async fn ack(&self, id: &TaskId) -> QueueResult<()> {
        let conn = self.conn().await?;
        self.timed(self.ack_inner(conn, id)).await
    }

    async fn fail(&self, id: &TaskId, error: &QueueError) -> QueueResult<()> {
        let conn = self.conn().await?;
        self.timed(self.fail_inner(conn, id, error)).await
    }

    async fn promote_delayed(&self) -> QueueResult<u64> {
        let conn = self.conn().await?;
        self.timed(self.promote_delayed_inner(conn)).await
    }

    async fn heartbeat(&self, worker_id: &str, ttl: Duration) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        self.timed(async move {
            let _: () = conn
                .set_ex(
                    self.keys.worker(worker_id),
                    Utc::now().to_rfc3339(),
                    ttl.as_secs(),
                )
                .await?;
            Ok(())
        })
        .await
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        self.timed(async move {
            let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> QueueResult<()> {
        self.pool.close();
        debug!("redis broker closed");
        Ok(())
    }

    async fn queue_length(&self, queue: &str) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        self.timed(async move {
            let len: u64 = conn.llen(self.keys.pending(queue)).await?;
            Ok(len)
        })
        .await
    }

    async fn delayed_length(&self) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        self.timed(async move {
            let len: u64 = conn.zcard(self.keys.delayed()).await?;
            Ok(len)
        })
        .await
    }

    async fn dead_length(&self) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        self.timed(async move {
            let len: u64 = conn.zcard(self.keys.dead()).await?;
            Ok(len)
        })
        .await
    }
}
