//! In-process broker for tests and local development.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, warn};

use crate::broker::Broker;
use crate::error::{QueueError, QueueResult};
use crate::task::{TaskId, TaskMessage};

#[derive(Debug, Default)]
struct MemoryState {
    queues: HashMap<String, VecDeque<TaskMessage>>,
    delayed: Vec<TaskMessage>,
    active: HashMap<TaskId, String>,
    records: HashMap<TaskId, TaskMessage>,
    dead: Vec<TaskMessage>,
    // Unique TTLs are not modeled; keys live until their task terminates.
    unique: HashMap<String, TaskId>,
    heartbeats: HashMap<String, chrono::DateTime<Utc>>,
    closed: bool,
}

/// In-memory broker implementing the same contract as the Redis backend.
///
/// Deterministic and dependency-free; intended for test suites and local
/// development, not for durability.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<MemoryState>,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Workers that have reported a heartbeat.
    pub fn heartbeat_workers(&self) -> Vec<String> {
        self.state.lock().heartbeats.keys().cloned().collect()
    }

    /// Snapshot of the dead messages.
    pub fn dead_tasks(&self) -> Vec<TaskMessage> {
        self.state.lock().dead.clone()
    }

    fn guard_open(state: &MemoryState) -> QueueResult<()> {
        if state.closed {
            return Err(QueueError::Closed("memory broker is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, message: TaskMessage) -> QueueResult<TaskId> {
        let mut state = self.state.lock();
        Self::guard_open(&state)?;

        if let Some(key) = &message.unique_key {
            if state.unique.contains_key(key) {
                return Err(QueueError::Duplicate(key.clone()));
            }
            state.unique.insert(key.clone(), message.id);
        }

        let id = message.id;
        state.records.insert(id, message.clone());

        if message.scheduled_at > Utc::now() {
            debug!(task_id = %id, queue = %message.queue, "enqueued delayed task");
            state.delayed.push(message);
        } else {
            debug!(task_id = %id, queue = %message.queue, "enqueued task");
            state
                .queues
                .entry(message.queue.clone())
                .or_default()
                .push_back(message);
        }

        Ok(id)
    }

    async fn dequeue(
        &self,
        queues: &[String],
        worker_id: &str,
    ) -> QueueResult<Option<TaskMessage>> {
        let mut state = self.state.lock();
        Self::guard_open(&state)?;

        for queue in queues {
            let Some(pending) = state.queues.get_mut(queue) else {
                continue;
            };
            if let Some(mut msg) = pending.pop_front() {
                msg.increment_attempt();
                state.records.insert(msg.id, msg.clone());
                state.active.insert(msg.id, worker_id.to_string());
                debug!(task_id = %msg.id, queue = %msg.queue, attempt = msg.attempt, "dequeued task");
                return Ok(Some(msg));
            }
        }

        Ok(None)
    }

    async fn ack(&self, id: &TaskId) -> QueueResult<()> {
        let mut state = self.state.lock();
        state.active.remove(id);
        if let Some(msg) = state.records.remove(id) {
            if let Some(key) = &msg.unique_key {
                state.unique.remove(key);
            }
            crate::metrics::record_completed(&msg.queue);
        }
        debug!(task_id = %id, "task completed");
        Ok(())
    }

    async fn fail(&self, id: &TaskId, error: &QueueError) -> QueueResult<()> {
        let mut state = self.state.lock();
        state.active.remove(id);

        let Some(mut msg) = state.records.get(id).cloned() else {
            warn!(task_id = %id, "failed task has no record");
            return Ok(());
        };
        msg.set_error(error);

        if !msg.is_exhausted() && error.is_retryable() {
            let delay = msg.retry_delay();
            msg.scheduled_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            state.records.insert(msg.id, msg.clone());
            crate::metrics::record_retried(&msg.queue);
            debug!(task_id = %msg.id, attempt = msg.attempt, "scheduled task retry");
            state.delayed.push(msg);
        } else {
            if let Some(key) = &msg.unique_key {
                state.unique.remove(key);
            }
            state.records.insert(msg.id, msg.clone());
            crate::metrics::record_dead_lettered(&msg.queue);
            warn!(task_id = %msg.id, error = %error, attempts = msg.attempt, "task moved to the dead set");
            state.dead.push(msg);
        }

        Ok(())
    }

    async fn promote_delayed(&self) -> QueueResult<u64> {
        let mut state = self.state.lock();
        Self::guard_open(&state)?;

        let now = Utc::now();
        let (due, pending): (Vec<_>, Vec<_>) = state
            .delayed
            .drain(..)
            .partition(|msg| msg.scheduled_at <= now);
        state.delayed = pending;

        let moved = due.len() as u64;
        for msg in due {
            debug!(task_id = %msg.id, queue = %msg.queue, "promoted delayed task");
            state
                .queues
                .entry(msg.queue.clone())
                .or_default()
                .push_back(msg);
        }

        Ok(moved)
    }

    async fn heartbeat(&self, worker_id: &str, _ttl: Duration) -> QueueResult<()> {
        let mut state = self.state.lock();
        Self::guard_open(&state)?;
        state.heartbeats.insert(worker_id.to_string(), Utc::now());
        Ok(())
    }

    async fn ping(&self) -> QueueResult<()> {
        Self::guard_open(&self.state.lock())
    }

    async fn close(&self) -> QueueResult<()> {
        self.state.lock().closed = true;
        debug!("memory broker closed");
        Ok(())
    }

    async fn queue_length(&self, queue: &str) -> QueueResult<u64> {
        let state = self.state.lock();
        Ok(state.queues.get(queue).map_or(0, |q| q.len() as u64))
    }

    async fn delayed_length(&self) -> QueueResult<u64> {
        Ok(self.state.lock().delayed.len() as u64)
    }

    async fn dead_length(&self) -> QueueResult<u64> {
        Ok(self.state.lock().dead.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::EnqueueOptions;
    use crate::task::Task;

    fn message(queue: &str) -> TaskMessage {
        EnqueueOptions::default()
            .queue(queue)
            .into_message(Task::new("noop", serde_json::Value::Null))
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_fifo() {
        let broker = MemoryBroker::new();
        let first = broker.enqueue(message("default")).await.unwrap();
        let second = broker.enqueue(message("default")).await.unwrap();

        let queues = vec!["default".to_string()];
        let msg = broker.dequeue(&queues, "w1").await.unwrap().unwrap();
        assert_eq!(msg.id, first);
        assert_eq!(msg.attempt, 1);

        let msg = broker.dequeue(&queues, "w1").await.unwrap().unwrap();
        assert_eq!(msg.id, second);

        assert!(broker.dequeue(&queues, "w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dequeue_respects_queue_order() {
        let broker = MemoryBroker::new();
        let low = broker.enqueue(message("low")).await.unwrap();
        let critical = broker.enqueue(message("critical")).await.unwrap();

        let order = vec!["critical".to_string(), "low".to_string()];
        let msg = broker.dequeue(&order, "w1").await.unwrap().unwrap();
        assert_eq!(msg.id, critical);
        let msg = broker.dequeue(&order, "w1").await.unwrap().unwrap();
        assert_eq!(msg.id, low);
    }

    #[tokio::test]
    async fn test_delayed_not_visible_until_promoted() {
        let broker = MemoryBroker::new();
        let msg = EnqueueOptions::default()
            .delay(Duration::from_millis(20))
            .into_message(Task::new("noop", serde_json::Value::Null));
        broker.enqueue(msg).await.unwrap();

        let queues = vec!["default".to_string()];
        assert!(broker.dequeue(&queues, "w1").await.unwrap().is_none());
        assert_eq!(broker.delayed_length().await.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(broker.promote_delayed().await.unwrap(), 1);
        assert!(broker.dequeue(&queues, "w1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fail_retryable_goes_to_delayed() {
        let broker = MemoryBroker::new();
        broker.enqueue(message("default")).await.unwrap();

        let queues = vec!["default".to_string()];
        let msg = broker.dequeue(&queues, "w1").await.unwrap().unwrap();
        broker
            .fail(&msg.id, &QueueError::Execution("boom".into()))
            .await
            .unwrap();

        assert_eq!(broker.delayed_length().await.unwrap(), 1);
        assert_eq!(broker.dead_length().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fail_exhausted_goes_to_dead() {
        let broker = MemoryBroker::new();
        let msg = EnqueueOptions::default()
            .max_retry(0)
            .into_message(Task::new("noop", serde_json::Value::Null));
        broker.enqueue(msg).await.unwrap();

        let queues = vec!["default".to_string()];
        let msg = broker.dequeue(&queues, "w1").await.unwrap().unwrap();
        broker
            .fail(&msg.id, &QueueError::Execution("boom".into()))
            .await
            .unwrap();

        assert_eq!(broker.dead_length().await.unwrap(), 1);
        let dead = broker.dead_tasks();
        assert!(dead[0].last_error.as_deref().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_fail_non_retryable_goes_to_dead() {
        let broker = MemoryBroker::new();
        broker.enqueue(message("default")).await.unwrap();

        let queues = vec!["default".to_string()];
        let msg = broker.dequeue(&queues, "w1").await.unwrap().unwrap();
        broker
            .fail(&msg.id, &QueueError::NoHandler("noop".into()))
            .await
            .unwrap();

        assert_eq!(broker.delayed_length().await.unwrap(), 0);
        assert_eq!(broker.dead_length().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unique_key_deduplicates() {
        let broker = MemoryBroker::new();
        let first = EnqueueOptions::default()
            .unique_key("report-42")
            .into_message(Task::new("noop", serde_json::Value::Null));
        let second = EnqueueOptions::default()
            .unique_key("report-42")
            .into_message(Task::new("noop", serde_json::Value::Null));

        broker.enqueue(first).await.unwrap();
        let err = broker.enqueue(second).await.unwrap_err();
        assert!(matches!(err, QueueError::Duplicate(_)));

        // Completion releases the key.
        let queues = vec!["default".to_string()];
        let msg = broker.dequeue(&queues, "w1").await.unwrap().unwrap();
        broker.ack(&msg.id).await.unwrap();

        let third = EnqueueOptions::default()
            .unique_key("report-42")
            .into_message(Task::new("noop", serde_json::Value::Null));
        assert!(broker.enqueue(third).await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_broker_rejects_operations() {
        let broker = MemoryBroker::new();
        broker.close().await.unwrap();

        assert!(broker.ping().await.is_err());
        let err = broker.enqueue(message("default")).await.unwrap_err();
        assert!(matches!(err, QueueError::Closed(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_recorded() {
        let broker = MemoryBroker::new();
        broker
            .heartbeat("server-1", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(broker.heartbeat_workers(), vec!["server-1".to_string()]);
    }
}
