//! Optional process-wide task queue.
//!
//! The core [`TaskQueue`] is an explicit handle; this module adds a thin
//! convenience layer for applications that want one shared queue per process
//! without threading the handle through every call site.

use std::sync::{Arc, OnceLock};
use tracing::warn;

use crate::config::ConnectionConfig;
use crate::error::{QueueError, QueueResult};
use crate::facade::TaskQueue;
use crate::options::EnqueueOptions;
use crate::registry::TaskHandler;
use crate::scheduler::EntryId;
use crate::task::{Task, TaskId};

static INSTANCE: OnceLock<Arc<TaskQueue>> = OnceLock::new();

/// Construct and install the process-wide task queue.
///
/// The first call constructs the instance; any later call warns, discards
/// its parameters and returns the existing instance.
pub async fn init(connection: ConnectionConfig) -> QueueResult<Arc<TaskQueue>> {
    if let Some(existing) = INSTANCE.get() {
        warn!("task queue is already initialized, returning the existing instance");
        return Ok(Arc::clone(existing));
    }

    let queue = TaskQueue::connect(connection).await?;
    Ok(install(queue))
}

/// Install a pre-built task queue as the process-wide instance.
///
/// Idempotent like [`init`]: when an instance is already installed, the new
/// one is discarded and the existing instance is returned.
pub fn install(queue: TaskQueue) -> Arc<TaskQueue> {
    let queue = Arc::new(queue);
    match INSTANCE.set(Arc::clone(&queue)) {
        Ok(()) => queue,
        Err(_) => {
            warn!("task queue is already initialized, returning the existing instance");
            INSTANCE.get().map(Arc::clone).unwrap_or(queue)
        }
    }
}

/// The process-wide task queue, if initialized.
pub fn handle() -> Option<Arc<TaskQueue>> {
    INSTANCE.get().map(Arc::clone)
}

fn require() -> QueueResult<Arc<TaskQueue>> {
    handle().ok_or_else(|| {
        QueueError::Configuration("process-wide task queue is not initialized".to_string())
    })
}

/// Register a handler on the process-wide queue.
pub fn add_handler(task_type: &str, handler: Arc<dyn TaskHandler>) -> QueueResult<()> {
    require()?.add_handler(task_type, handler);
    Ok(())
}

/// Register a recurring task on the process-wide queue.
pub fn add_scheduled_task(spec: &str, task: Task) -> QueueResult<EntryId> {
    require()?.add_scheduled_task(spec, task)
}

/// Enqueue a task on the process-wide queue.
pub async fn enqueue(task: Task, opts: EnqueueOptions) -> QueueResult<TaskId> {
    require()?.enqueue(task, opts).await
}

/// Start the process-wide queue.
pub async fn start() -> QueueResult<()> {
    require()?.start().await
}

/// Close the process-wide queue.
pub async fn close() -> QueueResult<()> {
    require()?.close().await
}
