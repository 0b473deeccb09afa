//! Enqueue client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::broker::Broker;
use crate::error::{QueueError, QueueResult};
use crate::options::EnqueueOptions;
use crate::task::{Task, TaskId};

/// Client that submits task instances to the broker.
///
/// `enqueue` is a synchronous round-trip to the broker; callers needing
/// batched high-throughput enqueue should parallelize externally.
pub struct Client {
    broker: Arc<dyn Broker>,
    closed: AtomicBool,
}

impl Client {
    /// Create a client over a broker.
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue one task instance immediately, honoring the given options.
    pub async fn enqueue(&self, task: Task, opts: EnqueueOptions) -> QueueResult<TaskId> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed("client is closed".to_string()));
        }

        let msg = opts.into_message(task);
        let name = msg.name.clone();
        let queue = msg.queue.clone();

        let id = self.broker.enqueue(msg).await?;
        debug!(task_id = %id, task_type = %name, queue = %queue, "task enqueued");
        Ok(id)
    }

    /// Stop accepting new enqueues.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("client closed");
        }
    }

    /// Whether the client has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;

    #[tokio::test]
    async fn test_enqueue_reaches_broker() {
        let broker = Arc::new(MemoryBroker::new());
        let client = Client::new(broker.clone());

        client
            .enqueue(
                Task::new("email:send", serde_json::json!({"to": "user@example.com"})),
                EnqueueOptions::default().queue("critical"),
            )
            .await
            .unwrap();

        assert_eq!(broker.queue_length("critical").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_closed_client_rejects_enqueue() {
        let broker = Arc::new(MemoryBroker::new());
        let client = Client::new(broker);

        client.close();
        assert!(client.is_closed());

        let err = client
            .enqueue(
                Task::new("noop", serde_json::Value::Null),
                EnqueueOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Closed(_)));
    }
}
