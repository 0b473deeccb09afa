//! Consumer server: pulls tasks from weighted queues and dispatches them to
//! registered handlers with bounded concurrency.

use futures::FutureExt;
use rand::Rng;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::config::{QueueWeight, ServerConfig};
use crate::error::{QueueError, QueueResult};
use crate::registry::HandlerRegistry;
use crate::task::TaskMessage;

/// Consumer server with a fixed-size worker pool.
pub struct ConsumerServer {
    id: String,
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    config: ServerConfig,
    queues: Vec<QueueWeight>,
    semaphore: Arc<Semaphore>,
    shutdown_tx: broadcast::Sender<()>,
    running: Arc<AtomicBool>,
    tasks_processed: Arc<AtomicU64>,
    tasks_failed: Arc<AtomicU64>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ConsumerServer {
    /// Create a consumer server over a broker and handler registry.
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<HandlerRegistry>,
        config: ServerConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        // A queue with weight 0 is never serviced.
        let queues: Vec<QueueWeight> = config
            .queues
            .iter()
            .filter(|q| q.weight > 0)
            .cloned()
            .collect();

        Self {
            id: format!("server-{}", Uuid::new_v4()),
            broker,
            registry,
            semaphore: Arc::new(Semaphore::new(config.concurrency)),
            config,
            queues,
            shutdown_tx,
            running: Arc::new(AtomicBool::new(false)),
            tasks_processed: Arc::new(AtomicU64::new(0)),
            tasks_failed: Arc::new(AtomicU64::new(0)),
            handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Start the consumer server.
    ///
    /// Verifies broker connectivity first, then spawns the poll loop plus the
    /// heartbeat and delayed-scan loops. Fails with
    /// [`QueueError::Unavailable`] when the broker cannot be reached.
    pub async fn start(&self) -> QueueResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(QueueError::InvalidState {
                expected: "stopped".to_string(),
                actual: "running".to_string(),
            });
        }

        if let Err(e) = self.broker.ping().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(QueueError::Unavailable(format!(
                "cannot reach broker: {e}"
            )));
        }

        info!(
            server_id = %self.id,
            concurrency = self.config.concurrency,
            queues = ?self.queues.iter().map(|q| q.name.as_str()).collect::<Vec<_>>(),
            "starting consumer server"
        );
        crate::metrics::set_concurrency(self.config.concurrency);

        let mut handles = self.handles.lock();
        handles.push(self.spawn_heartbeat_loop());
        handles.push(self.spawn_delayed_scan_loop());
        handles.push(self.spawn_poll_loop());

        Ok(())
    }

    /// Stop the server: stop accepting work, drain in-flight tasks within the
    /// shutdown timeout, then cancel the periodic loops.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!(server_id = %self.id, "consumer server already stopped");
            return;
        }

        info!(server_id = %self.id, "stopping consumer server");
        let _ = self.shutdown_tx.send(());

        let drain = self
            .semaphore
            .clone()
            .acquire_many_owned(self.config.concurrency as u32);
        if tokio::time::timeout(self.config.shutdown_timeout(), drain)
            .await
            .is_err()
        {
            warn!(
                server_id = %self.id,
                timeout_secs = self.config.shutdown_timeout_secs,
                "shutdown timeout reached with tasks still in flight"
            );
        }

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            handle.abort();
        }

        info!(
            server_id = %self.id,
            processed = self.tasks_processed.load(Ordering::Relaxed),
            failed = self.tasks_failed.load(Ordering::Relaxed),
            "consumer server stopped"
        );
    }

    /// Whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Server identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of tasks processed successfully.
    pub fn tasks_processed(&self) -> u64 {
        self.tasks_processed.load(Ordering::Relaxed)
    }

    /// Number of tasks that failed.
    pub fn tasks_failed(&self) -> u64 {
        self.tasks_failed.load(Ordering::Relaxed)
    }

    fn spawn_heartbeat_loop(&self) -> JoinHandle<()> {
        let broker = Arc::clone(&self.broker);
        let server_id = self.id.clone();
        let interval = self.config.health_check_interval();
        let ttl = interval * 3;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = broker.heartbeat(&server_id, ttl).await {
                            warn!(server_id = %server_id, error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        })
    }

    fn spawn_delayed_scan_loop(&self) -> JoinHandle<()> {
        let broker = Arc::clone(&self.broker);
        let interval = self.config.delayed_task_check_interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        match broker.promote_delayed().await {
                            Ok(moved) if moved > 0 => {
                                debug!(count = moved, "promoted delayed tasks");
                            }
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "delayed task scan failed"),
                        }
                    }
                }
            }
        })
    }

    fn spawn_poll_loop(&self) -> JoinHandle<()> {
        let broker = Arc::clone(&self.broker);
        let registry = Arc::clone(&self.registry);
        let semaphore = Arc::clone(&self.semaphore);
        let queues = self.queues.clone();
        let server_id = self.id.clone();
        let poll_interval = self.config.poll_interval();
        let task_timeout = self.config.task_timeout();
        let tasks_processed = Arc::clone(&self.tasks_processed);
        let tasks_failed = Arc::clone(&self.tasks_failed);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                let permit = tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let order = weighted_queue_order(&queues, &mut rand::rng());
                let worker_id = format!("{}-{}", server_id, Uuid::new_v4());

                match broker.dequeue(&order, &worker_id).await {
                    Ok(Some(msg)) => {
                        let broker = Arc::clone(&broker);
                        let registry = Arc::clone(&registry);
                        let tasks_processed = Arc::clone(&tasks_processed);
                        let tasks_failed = Arc::clone(&tasks_failed);

                        tokio::spawn(async move {
                            let _permit = permit;
                            execute_task(
                                broker,
                                registry,
                                msg,
                                worker_id,
                                task_timeout,
                                tasks_processed,
                                tasks_failed,
                            )
                            .await;
                        });
                    }
                    Ok(None) => {
                        drop(permit);
                        tokio::select! {
                            _ = shutdown_rx.recv() => break,
                            _ = tokio::time::sleep(poll_interval) => {}
                        }
                    }
                    Err(e) => {
                        drop(permit);
                        error!(error = %e, "failed to dequeue task");
                        tokio::select! {
                            _ = shutdown_rx.recv() => break,
                            _ = tokio::time::sleep(poll_interval) => {}
                        }
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for ConsumerServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerServer")
            .field("id", &self.id)
            .field("running", &self.is_running())
            .field("concurrency", &self.config.concurrency)
            .finish()
    }
}

/// Execute one dequeued task and report the outcome to the broker.
async fn execute_task(
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    msg: TaskMessage,
    worker_id: String,
    task_timeout: Option<Duration>,
    tasks_processed: Arc<AtomicU64>,
    tasks_failed: Arc<AtomicU64>,
) {
    let Some(handler) = registry.get(&msg.name) else {
        error!(task_id = %msg.id, task_type = %msg.name, "no handler registered for task type");
        report_failure(&broker, &msg, QueueError::NoHandler(msg.name.clone())).await;
        tasks_failed.fetch_add(1, Ordering::Relaxed);
        return;
    };

    debug!(
        task_id = %msg.id,
        task_type = %msg.name,
        attempt = msg.attempt,
        worker_id = %worker_id,
        "processing task"
    );

    let task = msg.task();
    let ctx = msg.to_context(&worker_id);
    let started = Instant::now();

    // A panicking handler must not take the consumer down with it.
    let execution = AssertUnwindSafe(handler.handle(task, ctx)).catch_unwind();
    let outcome = match task_timeout {
        Some(limit) => match tokio::time::timeout(limit, execution).await {
            Ok(outcome) => outcome,
            Err(_) => Ok(Err(QueueError::Timeout(limit.as_secs()))),
        },
        None => execution.await,
    };

    match outcome {
        Ok(Ok(())) => {
            if let Err(e) = broker.ack(&msg.id).await {
                error!(task_id = %msg.id, error = %e, "failed to mark task as completed");
            }
            tasks_processed.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_execution(&msg.queue, started.elapsed());
            debug!(task_id = %msg.id, "task completed");
        }
        Ok(Err(err)) => {
            warn!(task_id = %msg.id, error = %err, "task execution failed");
            report_failure(&broker, &msg, err).await;
            tasks_failed.fetch_add(1, Ordering::Relaxed);
        }
        Err(panic) => {
            let message = panic_message(panic);
            error!(task_id = %msg.id, panic = %message, "task handler panicked");
            report_failure(&broker, &msg, QueueError::Panicked(message)).await;
            tasks_failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn report_failure(broker: &Arc<dyn Broker>, msg: &TaskMessage, err: QueueError) {
    if let Err(e) = broker.fail(&msg.id, &err).await {
        error!(task_id = %msg.id, error = %e, "failed to report task failure");
    }
    crate::metrics::record_failed(&msg.queue);
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Produce a queue servicing order by weighted sampling without replacement.
///
/// Every positive-weight queue appears exactly once, so an empty high-weight
/// queue never blocks the others within a poll cycle; the weights shape the
/// average position, not a strict priority.
fn weighted_queue_order<R: Rng>(queues: &[QueueWeight], rng: &mut R) -> Vec<String> {
    let mut remaining: Vec<&QueueWeight> = queues.iter().collect();
    let mut order = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let total: u64 = remaining.iter().map(|q| u64::from(q.weight)).sum();
        let mut roll = rng.random_range(0..total);
        let mut chosen = remaining.len() - 1;
        for (i, queue) in remaining.iter().enumerate() {
            if roll < u64::from(queue.weight) {
                chosen = i;
                break;
            }
            roll -= u64::from(queue.weight);
        }
        order.push(remaining.remove(chosen).name.clone());
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn weights() -> Vec<QueueWeight> {
        vec![
            QueueWeight::new("critical", 6),
            QueueWeight::new("default", 3),
            QueueWeight::new("low", 1),
        ]
    }

    #[test]
    fn test_order_contains_every_queue_once() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let mut order = weighted_queue_order(&weights(), &mut rng);
            assert_eq!(order.len(), 3);
            order.sort();
            assert_eq!(order, vec!["critical", "default", "low"]);
        }
    }

    #[test]
    fn test_higher_weight_leads_more_often() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut critical_first = 0u32;
        let mut low_first = 0u32;
        for _ in 0..2000 {
            let order = weighted_queue_order(&weights(), &mut rng);
            match order[0].as_str() {
                "critical" => critical_first += 1,
                "low" => low_first += 1,
                _ => {}
            }
        }
        // critical holds 6/10 of the weight, low 1/10.
        assert!(critical_first > 900, "critical first {critical_first} times");
        assert!(low_first < 500, "low first {low_first} times");
        assert!(low_first > 0, "low is never starved of the lead entirely");
    }

    #[test]
    fn test_single_queue_order() {
        let mut rng = StdRng::seed_from_u64(1);
        let queues = vec![QueueWeight::new("default", 3)];
        assert_eq!(weighted_queue_order(&queues, &mut rng), vec!["default"]);
    }

    #[test]
    fn test_zero_weight_filtered_at_construction() {
        use crate::memory::MemoryBroker;

        let mut config = ServerConfig::default();
        config.queues = vec![
            QueueWeight::new("critical", 6),
            QueueWeight::new("disabled", 0),
        ];

        let server = ConsumerServer::new(
            Arc::new(MemoryBroker::new()),
            Arc::new(HandlerRegistry::new()),
            config,
        );
        assert_eq!(server.queues.len(), 1);
        assert_eq!(server.queues[0].name, "critical");
    }
}
