//! Task definitions and the broker message envelope.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};
use crate::retry::RetryPolicy;

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Creates a new random task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// A unit of work: a type name and a JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Task type name (e.g. `"email:send"`), used to route to a handler.
    pub name: String,

    /// Task payload.
    pub payload: serde_json::Value,
}

impl Task {
    /// Create a task from a type name and a JSON payload.
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// Create a task by serializing a payload value.
    pub fn from_serialize<T: Serialize>(name: impl Into<String>, payload: &T) -> QueueResult<Self> {
        Ok(Self {
            name: name.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Deserialize the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> QueueResult<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// The serialized message envelope stored in the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Task ID.
    pub id: TaskId,

    /// Task type name.
    pub name: String,

    /// Queue name.
    pub queue: String,

    /// Task payload.
    pub payload: serde_json::Value,

    /// Number of attempts made so far.
    pub attempt: u32,

    /// Maximum attempts (retries + the initial attempt).
    pub max_attempts: u32,

    /// When the task was created.
    pub created_at: DateTime<Utc>,

    /// When the task becomes eligible for processing.
    pub scheduled_at: DateTime<Utc>,

    /// Unique key for deduplication.
    #[serde(default)]
    pub unique_key: Option<String>,

    /// Unique key TTL in seconds.
    #[serde(default = "default_unique_ttl")]
    pub unique_ttl_secs: u64,

    /// Retry policy override.
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,

    /// Error from the last failed attempt.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl TaskMessage {
    /// Rebuild the task carried by this message.
    pub fn task(&self) -> Task {
        Task {
            name: self.name.clone(),
            payload: self.payload.clone(),
        }
    }

    /// Increment the attempt counter.
    pub fn increment_attempt(&mut self) {
        self.attempt += 1;
    }

    /// Check if all attempts have been used.
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Record the error from the last attempt.
    pub fn set_error(&mut self, error: &QueueError) {
        self.last_error = Some(error.to_string());
    }

    /// Returns the retry delay before the next attempt.
    pub fn retry_delay(&self) -> Duration {
        self.retry_policy
            .clone()
            .unwrap_or_default()
            .delay_for_attempt(self.attempt)
    }

    /// Create the execution context handed to a handler.
    pub fn to_context(&self, worker_id: &str) -> TaskContext {
        TaskContext {
            id: self.id,
            queue: self.queue.clone(),
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            scheduled_at: self.scheduled_at,
            started_at: Utc::now(),
            worker_id: worker_id.to_string(),
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> QueueResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> QueueResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Execution context handed to a task handler.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Task ID.
    pub id: TaskId,

    /// Queue the task was pulled from.
    pub queue: String,

    /// Current attempt number (1-based).
    pub attempt: u32,

    /// Maximum attempts allowed.
    pub max_attempts: u32,

    /// When the task became eligible for processing.
    pub scheduled_at: DateTime<Utc>,

    /// When execution started.
    pub started_at: DateTime<Utc>,

    /// Worker processing the task.
    pub worker_id: String,
}

impl TaskContext {
    /// Returns true if this is the last attempt.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Returns remaining attempts.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt)
    }
}

fn default_unique_ttl() -> u64 {
    3600
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::EnqueueOptions;

    #[test]
    fn test_task_id_generation() {
        let id1 = TaskId::new();
        let id2 = TaskId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_payload_round_trip() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Email {
            to: String,
        }

        let task = Task::from_serialize(
            "email:send",
            &Email {
                to: "user@example.com".to_string(),
            },
        )
        .unwrap();
        assert_eq!(task.name, "email:send");

        let email: Email = task.payload_as().unwrap();
        assert_eq!(email.to, "user@example.com");
    }

    #[test]
    fn test_message_serialization() {
        let task = Task::new("report:weekly", serde_json::json!({"week": 7}));
        let msg = EnqueueOptions::default().into_message(task);

        let json = msg.to_json().unwrap();
        let restored = TaskMessage::from_json(&json).unwrap();
        assert_eq!(restored.id, msg.id);
        assert_eq!(restored.name, "report:weekly");
        assert_eq!(restored.queue, "default");
    }

    #[test]
    fn test_attempt_accounting() {
        let task = Task::new("noop", serde_json::Value::Null);
        let mut msg = EnqueueOptions::default().max_retry(1).into_message(task);
        assert_eq!(msg.max_attempts, 2);
        assert!(!msg.is_exhausted());

        msg.increment_attempt();
        assert!(!msg.is_exhausted());
        msg.increment_attempt();
        assert!(msg.is_exhausted());
    }

    #[test]
    fn test_context_from_message() {
        let task = Task::new("noop", serde_json::Value::Null);
        let mut msg = EnqueueOptions::default().into_message(task);
        msg.increment_attempt();

        let ctx = msg.to_context("worker-1");
        assert_eq!(ctx.attempt, 1);
        assert_eq!(ctx.max_attempts, 4);
        assert_eq!(ctx.remaining_attempts(), 3);
        assert!(!ctx.is_last_attempt());
        assert_eq!(ctx.worker_id, "worker-1");
    }
}
