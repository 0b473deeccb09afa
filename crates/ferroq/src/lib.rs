//! Ferroq - Redis-backed Task Queue Facade
//!
//! A small facade over a durable, Redis-backed task queue:
//! - A consumer server pulling from named, weighted queues with bounded
//!   concurrency, per-task panic isolation and graceful drain on shutdown
//! - A scheduler holding cron/interval entries, evaluated in a resolved
//!   timezone (`TZ` override, UTC default), enqueuing through the same
//!   broker path as manual enqueues
//! - A client for on-demand enqueues with per-task options (queue, delay,
//!   retry budget, unique key)
//!
//! # Architecture
//!
//! ```text
//!   Client ──enqueue──┐                       ┌── Scheduler (cron/@every)
//!                     ▼                       ▼
//!              ┌─────────────────────────────────────┐
//!              │            Broker backend           │
//!              │  critical(6)   default(3)   low(1)  │
//!              │        delayed set · dead set       │
//!              └──────────────────┬──────────────────┘
//!                                 │ weighted order
//!                                 ▼
//!              ┌─────────────────────────────────────┐
//!              │    Consumer server (10 workers)     │
//!              │  handler registry: name -> handler  │
//!              └─────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use ferroq::{ConnectionConfig, EnqueueOptions, Task, TaskQueue, handler_fn};
//!
//! let connection = ConnectionConfig::new("localhost:6379", None, None, 0)?;
//! let queue = TaskQueue::connect(connection).await?;
//!
//! queue.add_handler(
//!     "email:send",
//!     handler_fn(|task, _ctx| async move {
//!         println!("sending email: {}", task.payload);
//!         Ok(())
//!     }),
//! );
//! queue.add_scheduled_task("@every 10m", Task::new("session:cleanup", serde_json::json!({})))?;
//!
//! queue.start().await?;
//! queue
//!     .enqueue(
//!         Task::new("email:send", serde_json::json!({"to": "user@example.com"})),
//!         EnqueueOptions::default().queue("critical"),
//!     )
//!     .await?;
//!
//! queue.close().await?;
//! ```

pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod facade;
pub mod global;
pub mod memory;
pub mod metrics;
pub mod options;
pub mod redis;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod task;

pub use broker::Broker;
pub use client::Client;
pub use config::{ConnectionConfig, QueueConfig, QueueWeight, SchedulerConfig, ServerConfig};
pub use error::{QueueError, QueueResult};
pub use facade::{LifecycleState, TaskQueue};
pub use memory::MemoryBroker;
pub use metrics::register_metrics;
pub use options::EnqueueOptions;
pub use registry::{handler_fn, HandlerRegistry, TaskHandler};
pub use retry::{RetryPolicy, RetryStrategy};
pub use scheduler::{EntryId, ScheduleSpec, Scheduler};
pub use server::ConsumerServer;
pub use task::{Task, TaskContext, TaskId, TaskMessage};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::broker::Broker;
    pub use crate::options::EnqueueOptions;
    pub use crate::registry::{handler_fn, TaskHandler};
    pub use crate::task::{Task, TaskContext};
    pub use crate::{ConnectionConfig, QueueError, QueueResult, TaskId, TaskQueue};
}
