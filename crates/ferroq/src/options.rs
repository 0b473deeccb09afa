//! Per-task enqueue options.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::task::{Task, TaskId, TaskMessage};

/// Options applied to a single enqueue.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    queue: String,
    delay: Option<Duration>,
    process_at: Option<DateTime<Utc>>,
    max_retry: u32,
    unique_key: Option<String>,
    unique_ttl_secs: u64,
    retry_policy: Option<RetryPolicy>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            queue: "default".to_string(),
            delay: None,
            process_at: None,
            max_retry: 3,
            unique_key: None,
            unique_ttl_secs: 3600,
            retry_policy: None,
        }
    }
}

impl EnqueueOptions {
    /// Create options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Target queue name.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Delay processing by the given duration.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self.process_at = None;
        self
    }

    /// Process at a specific time.
    pub fn process_at(mut self, at: DateTime<Utc>) -> Self {
        self.process_at = Some(at);
        self.delay = None;
        self
    }

    /// Maximum number of retries after the initial attempt.
    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Unique key for deduplication.
    pub fn unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }

    /// TTL for the unique key.
    pub fn unique_ttl(mut self, ttl: Duration) -> Self {
        self.unique_ttl_secs = ttl.as_secs();
        self
    }

    /// Override the retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Materialize the broker message envelope for a task.
    pub fn into_message(self, task: Task) -> TaskMessage {
        let now = Utc::now();
        let scheduled_at = if let Some(at) = self.process_at {
            at
        } else if let Some(delay) = self.delay {
            now + chrono::Duration::from_std(delay).unwrap_or_default()
        } else {
            now
        };

        TaskMessage {
            id: TaskId::new(),
            name: task.name,
            queue: self.queue,
            payload: task.payload,
            attempt: 0,
            max_attempts: self.max_retry + 1,
            created_at: now,
            scheduled_at,
            unique_key: self.unique_key,
            unique_ttl_secs: self.unique_ttl_secs,
            retry_policy: self.retry_policy,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_task() -> Task {
        Task::new("noop", serde_json::Value::Null)
    }

    #[test]
    fn test_defaults() {
        let msg = EnqueueOptions::default().into_message(noop_task());
        assert_eq!(msg.queue, "default");
        assert_eq!(msg.max_attempts, 4);
        assert!(msg.unique_key.is_none());
        assert!(msg.scheduled_at <= Utc::now());
    }

    #[test]
    fn test_delay_sets_scheduled_at() {
        let before = Utc::now();
        let msg = EnqueueOptions::default()
            .delay(Duration::from_secs(60))
            .into_message(noop_task());
        assert!(msg.scheduled_at >= before + chrono::Duration::seconds(59));
    }

    #[test]
    fn test_process_at_wins_over_earlier_delay() {
        let at = Utc::now() + chrono::Duration::hours(1);
        let msg = EnqueueOptions::default()
            .delay(Duration::from_secs(5))
            .process_at(at)
            .into_message(noop_task());
        assert_eq!(msg.scheduled_at, at);
    }

    #[test]
    fn test_queue_and_unique_key() {
        let msg = EnqueueOptions::default()
            .queue("critical")
            .unique_key("report-42")
            .unique_ttl(Duration::from_secs(120))
            .into_message(noop_task());
        assert_eq!(msg.queue, "critical");
        assert_eq!(msg.unique_key.as_deref(), Some("report-42"));
        assert_eq!(msg.unique_ttl_secs, 120);
    }
}
