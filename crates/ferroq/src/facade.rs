//! The task queue facade: one consumer server, one scheduler and one client
//! over a shared broker, behind a single lifecycle-managed handle.

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::client::Client;
use crate::config::{ConnectionConfig, QueueConfig};
use crate::error::{QueueError, QueueResult};
use crate::options::EnqueueOptions;
use crate::redis::{create_pool, RedisBroker};
use crate::registry::{HandlerRegistry, TaskHandler};
use crate::scheduler::{EntryId, Scheduler};
use crate::server::ConsumerServer;
use crate::task::{Task, TaskId};

/// Facade lifecycle states.
///
/// `Closed` is terminal; construct a fresh instance to run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Components wired, nothing running yet.
    Constructed,
    /// Consumer server (and possibly the scheduler) running.
    Running,
    /// Shut down.
    Closed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constructed => write!(f, "constructed"),
            Self::Running => write!(f, "running"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// The task queue facade.
///
/// Owns one consumer server, one scheduler and one client sharing a single
/// broker connection pool. Handlers and scheduled entries accumulate before
/// [`TaskQueue::start`]; `start` activates the consumer server
/// unconditionally and the scheduler only when at least one entry was
/// registered successfully.
pub struct TaskQueue {
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    server: ConsumerServer,
    scheduler: Scheduler,
    client: Client,
    entry_ids: RwLock<Vec<EntryId>>,
    registration_errors: AtomicUsize,
    state: Mutex<LifecycleState>,
}

impl TaskQueue {
    /// Connect to the broker with default server and scheduler settings.
    pub async fn connect(connection: ConnectionConfig) -> QueueResult<Self> {
        Self::connect_with(QueueConfig::new(connection)).await
    }

    /// Connect to the broker with full configuration.
    pub async fn connect_with(config: QueueConfig) -> QueueResult<Self> {
        let pool = create_pool(&config.connection).await?;
        let broker: Arc<dyn Broker> = Arc::new(RedisBroker::new(pool, &config.connection));
        Self::with_broker(config, broker)
    }

    /// Wire the facade around an existing broker.
    ///
    /// This is the injection seam for tests and alternative backends such as
    /// [`crate::memory::MemoryBroker`].
    pub fn with_broker(config: QueueConfig, broker: Arc<dyn Broker>) -> QueueResult<Self> {
        // An invalid timezone is a configuration bug; fail before start.
        let timezone = config.scheduler.resolve_timezone()?;

        let registry = Arc::new(HandlerRegistry::new());
        let server = ConsumerServer::new(
            Arc::clone(&broker),
            Arc::clone(&registry),
            config.server.clone(),
        );
        let scheduler = Scheduler::new(Arc::clone(&broker), timezone, &config.scheduler);
        let client = Client::new(Arc::clone(&broker));

        info!(
            address = %config.connection.address,
            db = config.connection.db,
            timezone = %timezone,
            "task queue constructed"
        );

        Ok(Self {
            broker,
            registry,
            server,
            scheduler,
            client,
            entry_ids: RwLock::new(Vec::new()),
            registration_errors: AtomicUsize::new(0),
            state: Mutex::new(LifecycleState::Constructed),
        })
    }

    /// Register (or overwrite) the handler for a task type name.
    ///
    /// Returns the facade for chaining. The last registration for a given
    /// name wins. Registering after `start` is not supported.
    pub fn add_handler(&self, task_type: &str, handler: Arc<dyn TaskHandler>) -> &Self {
        self.registry.register(task_type, handler);
        self
    }

    /// Register a recurring task with default enqueue options.
    ///
    /// See [`crate::scheduler::ScheduleSpec`] for the accepted grammar. A
    /// malformed spec is logged and returned as an error without affecting
    /// other registrations.
    pub fn add_scheduled_task(&self, spec: &str, task: Task) -> QueueResult<EntryId> {
        self.add_scheduled_task_with(spec, task, EnqueueOptions::default())
    }

    /// Register a recurring task with explicit enqueue options.
    pub fn add_scheduled_task_with(
        &self,
        spec: &str,
        task: Task,
        opts: EnqueueOptions,
    ) -> QueueResult<EntryId> {
        match self.scheduler.register(spec, task, opts) {
            Ok(id) => {
                self.entry_ids.write().push(id);
                Ok(id)
            }
            Err(e) => {
                self.registration_errors.fetch_add(1, Ordering::SeqCst);
                error!(schedule = spec, error = %e, "failed to register scheduled task");
                Err(e)
            }
        }
    }

    /// Enqueue one task instance immediately.
    pub async fn enqueue(&self, task: Task, opts: EnqueueOptions) -> QueueResult<TaskId> {
        match self.client.enqueue(task, opts).await {
            Ok(id) => Ok(id),
            Err(e) => {
                error!(error = %e, "failed to enqueue task");
                Err(e)
            }
        }
    }

    /// Start the consumer server, and the scheduler when at least one entry
    /// was registered.
    ///
    /// A start failure of either subsystem is a non-recoverable condition;
    /// the facade shuts down whatever already started and returns the error.
    pub async fn start(&self) -> QueueResult<()> {
        {
            let state = *self.state.lock();
            match state {
                LifecycleState::Running => {
                    warn!("task queue is already running");
                    return Ok(());
                }
                LifecycleState::Closed => {
                    return Err(QueueError::InvalidState {
                        expected: "constructed".to_string(),
                        actual: "closed".to_string(),
                    });
                }
                LifecycleState::Constructed => {}
            }
        }

        self.server.start().await?;

        let entry_count = self.entry_ids.read().len();
        if entry_count > 0 {
            if let Err(e) = self.scheduler.start().await {
                self.server.shutdown().await;
                return Err(e);
            }
        } else {
            // An idle scheduler is never started.
            debug!("no scheduled tasks registered, scheduler not started");
        }

        *self.state.lock() = LifecycleState::Running;
        info!(scheduled_entries = entry_count, "task queue started");
        Ok(())
    }

    /// Shut everything down: client first, then the consumer server, then
    /// the scheduler, then the broker.
    ///
    /// Every step runs regardless of earlier failures; the first error (if
    /// any) is returned after all steps were attempted. `Closed` is
    /// terminal.
    pub async fn close(&self) -> QueueResult<()> {
        {
            let mut state = self.state.lock();
            if *state == LifecycleState::Closed {
                warn!("task queue is already closed");
                return Ok(());
            }
            *state = LifecycleState::Closed;
        }

        info!("closing task queue");
        self.client.close();
        self.server.shutdown().await;
        self.scheduler.shutdown().await;

        let result = self.broker.close().await;
        if let Err(e) = &result {
            error!(error = %e, "failed to close broker connections");
        }

        info!("task queue closed");
        result
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// The consumer server.
    pub fn server(&self) -> &ConsumerServer {
        &self.server
    }

    /// The scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The handler registry.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Entry IDs of successfully registered scheduled tasks.
    pub fn scheduled_entry_ids(&self) -> Vec<EntryId> {
        self.entry_ids.read().clone()
    }

    /// Number of scheduled-task registrations that failed.
    pub fn registration_errors(&self) -> usize {
        self.registration_errors.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("state", &self.state())
            .field("handlers", &self.registry.len())
            .field("scheduled_entries", &self.entry_ids.read().len())
            .finish()
    }
}
