//! The durable broker abstraction consumed by the server, scheduler and
//! client.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{QueueError, QueueResult};
use crate::task::{TaskId, TaskMessage};

/// Capabilities required of a durable broker backend.
///
/// The production backend is [`crate::redis::RedisBroker`];
/// [`crate::memory::MemoryBroker`] provides the same contract in-process for
/// tests and local development.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Store a task message for processing.
    ///
    /// A message whose `scheduled_at` lies in the future lands in the
    /// delayed set; otherwise it is appended to its pending queue. A unique
    /// key already held by a live task yields [`QueueError::Duplicate`].
    async fn enqueue(&self, message: TaskMessage) -> QueueResult<TaskId>;

    /// Pop the next message, trying the queues in the given order.
    ///
    /// On a hit, the attempt counter is incremented and the message is
    /// marked active for `worker_id`.
    async fn dequeue(&self, queues: &[String], worker_id: &str)
        -> QueueResult<Option<TaskMessage>>;

    /// Report successful completion.
    async fn ack(&self, id: &TaskId) -> QueueResult<()>;

    /// Report a failed attempt.
    ///
    /// A retryable error with attempts remaining re-queues the message into
    /// the delayed set with the retry policy's backoff; otherwise the
    /// message moves to the dead set.
    async fn fail(&self, id: &TaskId, error: &QueueError) -> QueueResult<()>;

    /// Move due delayed messages into their pending queues.
    async fn promote_delayed(&self) -> QueueResult<u64>;

    /// Record a liveness marker for a worker.
    async fn heartbeat(&self, worker_id: &str, ttl: Duration) -> QueueResult<()>;

    /// Check broker connectivity.
    async fn ping(&self) -> QueueResult<()>;

    /// Release the underlying resources.
    async fn close(&self) -> QueueResult<()>;

    /// Number of pending messages in a queue.
    async fn queue_length(&self, queue: &str) -> QueueResult<u64>;

    /// Number of delayed messages.
    async fn delayed_length(&self) -> QueueResult<u64>;

    /// Number of dead messages.
    async fn dead_length(&self) -> QueueResult<u64>;
}
