//! Handler registration and lookup.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::QueueResult;
use crate::task::{Task, TaskContext};

/// Executable bound to a task type name.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute a task, returning success or a typed failure.
    async fn handle(&self, task: Task, ctx: TaskContext) -> QueueResult<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Task, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = QueueResult<()>> + Send + 'static,
{
    async fn handle(&self, task: Task, ctx: TaskContext) -> QueueResult<()> {
        (self.0)(task, ctx).await
    }
}

/// Wrap an async closure as a task handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(Task, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = QueueResult<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Mapping from task type name to handler.
///
/// At most one handler per type name; the last registration for a given name
/// wins. The registry is expected to be stable before the consumer server
/// starts; registering after start is not supported.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or overwrite) the handler for a task type name.
    pub fn register(&self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let task_type = task_type.into();
        let replaced = self
            .handlers
            .write()
            .insert(task_type.clone(), handler)
            .is_some();
        if replaced {
            debug!(task_type = %task_type, "replaced existing task handler");
        }
        info!(task_type = %task_type, "registered task handler");
    }

    /// Look up the handler for a task type name.
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().get(task_type).cloned()
    }

    /// Check if a handler is registered for a task type.
    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.read().contains_key(task_type)
    }

    /// Registered task type names.
    pub fn names(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.names())
            .finish()
    }
}
