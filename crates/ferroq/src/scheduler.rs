//! Scheduler for recurring tasks.
//!
//! Entries accept either a cron expression (seconds field included, e.g.
//! `"0 */5 * * * *"`) or an `"@every <duration>"` shorthand such as
//! `"@every 30s"`. Cron evaluation follows the resolved timezone, so DST
//! transitions track the configured zone rather than the host.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::config::SchedulerConfig;
use crate::error::{QueueError, QueueResult};
use crate::options::EnqueueOptions;
use crate::task::Task;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Identifier of a registered scheduler entry; the only handle for later
/// cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Creates a new random entry ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A parsed recurrence rule.
#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    /// Cron expression, evaluated in the scheduler's timezone.
    Cron(Box<Schedule>),
    /// Fixed interval.
    Every(Duration),
}

impl FromStr for ScheduleSpec {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if let Some(rest) = s.strip_prefix("@every") {
            let duration = humantime::parse_duration(rest.trim()).map_err(|e| {
                QueueError::InvalidSchedule(format!(
                    "invalid @every duration '{}': {e}",
                    rest.trim()
                ))
            })?;
            if duration.is_zero() {
                return Err(QueueError::InvalidSchedule(
                    "@every duration must be positive".to_string(),
                ));
            }
            return Ok(Self::Every(duration));
        }

        let schedule = Schedule::from_str(s)
            .map_err(|e| QueueError::InvalidSchedule(format!("invalid cron expression '{s}': {e}")))?;
        Ok(Self::Cron(Box::new(schedule)))
    }
}

impl ScheduleSpec {
    /// Next occurrence strictly after `after`, evaluated in `tz`.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron(schedule) => schedule
                .after(&after.with_timezone(&tz))
                .next()
                .map(|next| next.with_timezone(&Utc)),
            Self::Every(interval) => {
                Some(after + chrono::Duration::from_std(*interval).unwrap_or_default())
            }
        }
    }
}

/// A registered recurring task.
#[derive(Debug, Clone)]
struct ScheduledEntry {
    id: EntryId,
    raw: String,
    spec: ScheduleSpec,
    task: Task,
    opts: EnqueueOptions,
    next_run: DateTime<Utc>,
}

/// Periodically materializes registered entries into enqueued tasks.
///
/// The scheduler only produces enqueues; it never consumes.
pub struct Scheduler {
    id: String,
    broker: Arc<dyn Broker>,
    timezone: Tz,
    tick_interval: Duration,
    entries: Arc<RwLock<HashMap<EntryId, ScheduledEntry>>>,
    shutdown_tx: broadcast::Sender<()>,
    running: Arc<AtomicBool>,
    tasks_enqueued: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler over a broker, evaluating cron entries in
    /// `timezone`.
    pub fn new(broker: Arc<dyn Broker>, timezone: Tz, config: &SchedulerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            id: format!("scheduler-{}", Uuid::new_v4()),
            broker,
            timezone,
            tick_interval: config.tick_interval(),
            entries: Arc::new(RwLock::new(HashMap::new())),
            shutdown_tx,
            running: Arc::new(AtomicBool::new(false)),
            tasks_enqueued: Arc::new(AtomicU64::new(0)),
            handle: Mutex::new(None),
        }
    }

    /// Register a recurring task.
    ///
    /// Returns the entry ID on success; a malformed spec is a recoverable
    /// registration failure that leaves other entries untouched.
    pub fn register(
        &self,
        spec_str: &str,
        task: Task,
        opts: EnqueueOptions,
    ) -> QueueResult<EntryId> {
        let spec: ScheduleSpec = spec_str.parse()?;
        let now = Utc::now();
        let next_run = spec.next_after(now, self.timezone).ok_or_else(|| {
            QueueError::InvalidSchedule(format!("schedule '{spec_str}' has no upcoming occurrence"))
        })?;

        let id = EntryId::new();
        let task_type = task.name.clone();
        let mut entries = self.entries.write();
        entries.insert(
            id,
            ScheduledEntry {
                id,
                raw: spec_str.to_string(),
                spec,
                task,
                opts,
                next_run,
            },
        );
        crate::metrics::set_scheduler_entries(entries.len());
        drop(entries);

        info!(
            entry_id = %id,
            schedule = spec_str,
            task_type = %task_type,
            next_run = %next_run,
            "registered scheduled task"
        );
        Ok(id)
    }

    /// Remove a registered entry.
    pub fn unregister(&self, id: &EntryId) -> bool {
        let mut entries = self.entries.write();
        let removed = entries.remove(id).is_some();
        crate::metrics::set_scheduler_entries(entries.len());
        drop(entries);

        if removed {
            info!(entry_id = %id, "unregistered scheduled task");
        }
        removed
    }

    /// Number of registered entries.
    pub fn entry_count(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the scheduler is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of task instances enqueued so far.
    pub fn tasks_enqueued(&self) -> u64 {
        self.tasks_enqueued.load(Ordering::Relaxed)
    }

    /// Scheduler identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Start the tick loop.
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
            scheduler_id = %self.id,
            timezone = %self.timezone,
            entries = self.entry_count(),
            "starting scheduler"
        );

        let broker = Arc::clone(&self.broker);
        let entries = Arc::clone(&self.entries);
        let timezone = self.timezone;
        let tick_interval = self.tick_interval;
        let tasks_enqueued = Arc::clone(&self.tasks_enqueued);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        run_due_entries(&broker, &entries, timezone, &tasks_enqueued).await;
                    }
                }
            }
        });
        *self.handle.lock() = Some(handle);

        Ok(())
    }

    /// Stop the tick loop.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!(scheduler_id = %self.id, "scheduler already stopped");
            return;
        }

        info!(scheduler_id = %self.id, "stopping scheduler");
        let _ = self.shutdown_tx.send(());

        let handle = self.handle.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }

        info!(
            scheduler_id = %self.id,
            enqueued = self.tasks_enqueued.load(Ordering::Relaxed),
            "scheduler stopped"
        );
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.id)
            .field("timezone", &self.timezone)
            .field("entries", &self.entry_count())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Enqueue every due entry and advance its next run time.
async fn run_due_entries(
    broker: &Arc<dyn Broker>,
    entries: &RwLock<HashMap<EntryId, ScheduledEntry>>,
    timezone: Tz,
    tasks_enqueued: &AtomicU64,
) {
    let now = Utc::now();

    let due: Vec<(EntryId, String, Task, EnqueueOptions)> = {
        let mut entries = entries.write();
        let mut due = Vec::new();
        for entry in entries.values_mut() {
            if entry.next_run > now {
                continue;
            }
            due.push((entry.id, entry.raw.clone(), entry.task.clone(), entry.opts.clone()));
            match entry.spec.next_after(now, timezone) {
                Some(next) => entry.next_run = next,
                None => {
                    warn!(entry_id = %entry.id, schedule = %entry.raw, "schedule has no further occurrences");
                    entry.next_run = DateTime::<Utc>::MAX_UTC;
                }
            }
        }
        due
    };

    // One failing entry must not block the others.
    for (id, raw, task, opts) in due {
        let task_type = task.name.clone();
        match broker.enqueue(opts.into_message(task)).await {
            Ok(task_id) => {
                debug!(
                    entry_id = %id,
                    task_id = %task_id,
                    task_type = %task_type,
                    "enqueued scheduled task"
                );
                tasks_enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                error!(
                    entry_id = %id,
                    schedule = %raw,
                    task_type = %task_type,
                    error = %e,
                    "failed to enqueue scheduled task"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use chrono::TimeZone;

    fn scheduler_with(tz: Tz) -> Scheduler {
        Scheduler::new(Arc::new(MemoryBroker::new()), tz, &SchedulerConfig::default())
    }

    fn noop_task() -> Task {
        Task::new("noop", serde_json::Value::Null)
    }

    #[test]
    fn test_parse_cron_spec() {
        let spec: ScheduleSpec = "0 */5 * * * *".parse().unwrap();
        assert!(matches!(spec, ScheduleSpec::Cron(_)));
    }

    #[test]
    fn test_parse_every_spec() {
        let spec: ScheduleSpec = "@every 30s".parse().unwrap();
        match spec {
            ScheduleSpec::Every(d) => assert_eq!(d, Duration::from_secs(30)),
            other => panic!("expected Every, got {other:?}"),
        }

        let spec: ScheduleSpec = "@every 1h 30m".parse().unwrap();
        assert!(matches!(spec, ScheduleSpec::Every(_)));
    }

    #[test]
    fn test_parse_malformed_specs() {
        assert!("definitely not cron".parse::<ScheduleSpec>().is_err());
        assert!("@every sideways".parse::<ScheduleSpec>().is_err());
        assert!("@every 0s".parse::<ScheduleSpec>().is_err());
    }

    #[test]
    fn test_every_advances_by_interval() {
        let spec: ScheduleSpec = "@every 45s".parse().unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();
        let next = spec.next_after(after, Tz::UTC).unwrap();
        assert_eq!(next, after + chrono::Duration::seconds(45));
    }

    #[test]
    fn test_cron_evaluated_in_timezone() {
        // Daily at midnight. Midnight in Tokyo is 15:00 UTC.
        let spec: ScheduleSpec = "0 0 0 * * *".parse().unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();

        let next = spec.next_after(after, Tz::Asia__Tokyo).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 10, 15, 0, 0).unwrap());

        let next = spec.next_after(after, Tz::UTC).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 11, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_register_tracks_entries() {
        let scheduler = scheduler_with(Tz::UTC);
        assert_eq!(scheduler.entry_count(), 0);

        let first = scheduler
            .register("@every 1m", noop_task(), EnqueueOptions::default())
            .unwrap();
        let second = scheduler
            .register("0 0 * * * *", noop_task(), EnqueueOptions::default())
            .unwrap();

        assert_ne!(first, second);
        assert_eq!(scheduler.entry_count(), 2);

        assert!(scheduler.unregister(&first));
        assert!(!scheduler.unregister(&first));
        assert_eq!(scheduler.entry_count(), 1);
    }

    #[test]
    fn test_malformed_registration_leaves_others_untouched() {
        let scheduler = scheduler_with(Tz::UTC);

        let err = scheduler
            .register("not a schedule", noop_task(), EnqueueOptions::default())
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidSchedule(_)));
        assert_eq!(scheduler.entry_count(), 0);

        scheduler
            .register("@every 10s", noop_task(), EnqueueOptions::default())
            .unwrap();
        assert_eq!(scheduler.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_due_entries_enqueue_through_broker() {
        let broker = Arc::new(MemoryBroker::new());
        let scheduler = Scheduler::new(
            broker.clone(),
            Tz::UTC,
            &SchedulerConfig {
                tick_interval_ms: 10,
                ..Default::default()
            },
        );

        scheduler
            .register(
                "@every 20ms",
                Task::new("tick", serde_json::Value::Null),
                EnqueueOptions::default().queue("critical"),
            )
            .unwrap();

        scheduler.start().await.unwrap();
        assert!(scheduler.is_running());

        tokio::time::sleep(Duration::from_millis(120)).await;
        scheduler.shutdown().await;
        assert!(!scheduler.is_running());

        assert!(scheduler.tasks_enqueued() >= 1);
        assert!(broker.queue_length("critical").await.unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_start_twice_is_an_error() {
        let scheduler = scheduler_with(Tz::UTC);
        scheduler.start().await.unwrap();
        let err = scheduler.start().await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidState { .. }));
        scheduler.shutdown().await;
    }
}
