//! Metrics for task queue monitoring.

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use std::time::Duration;

/// Metric names for the task queue.
pub mod names {
    /// Total tasks enqueued.
    pub const TASKS_ENQUEUED_TOTAL: &str = "ferroq_tasks_enqueued_total";
    /// Total tasks completed successfully.
    pub const TASKS_COMPLETED_TOTAL: &str = "ferroq_tasks_completed_total";
    /// Total tasks failed.
    pub const TASKS_FAILED_TOTAL: &str = "ferroq_tasks_failed_total";
    /// Total tasks scheduled for retry.
    pub const TASKS_RETRIED_TOTAL: &str = "ferroq_tasks_retried_total";
    /// Total tasks moved to the dead set.
    pub const TASKS_DEAD_TOTAL: &str = "ferroq_tasks_dead_total";

    /// Task execution duration in seconds.
    pub const TASK_DURATION_SECONDS: &str = "ferroq_task_duration_seconds";

    /// Configured worker concurrency.
    pub const WORKERS_CONCURRENCY: &str = "ferroq_workers_concurrency";
    /// Registered scheduler entries.
    pub const SCHEDULER_ENTRIES: &str = "ferroq_scheduler_entries";
}

/// Register metric descriptions with the installed recorder.
pub fn register_metrics() {
    describe_counter!(names::TASKS_ENQUEUED_TOTAL, "Total tasks enqueued");
    describe_counter!(
        names::TASKS_COMPLETED_TOTAL,
        "Total tasks completed successfully"
    );
    describe_counter!(names::TASKS_FAILED_TOTAL, "Total tasks failed");
    describe_counter!(names::TASKS_RETRIED_TOTAL, "Total tasks scheduled for retry");
    describe_counter!(names::TASKS_DEAD_TOTAL, "Total tasks moved to the dead set");
    describe_histogram!(
        names::TASK_DURATION_SECONDS,
        "Task execution duration in seconds"
    );
    describe_gauge!(names::WORKERS_CONCURRENCY, "Configured worker concurrency");
    describe_gauge!(names::SCHEDULER_ENTRIES, "Registered scheduler entries");
}

pub(crate) fn record_enqueued(queue: &str) {
    counter!(names::TASKS_ENQUEUED_TOTAL, "queue" => queue.to_string()).increment(1);
}

pub(crate) fn record_completed(queue: &str) {
    counter!(names::TASKS_COMPLETED_TOTAL, "queue" => queue.to_string()).increment(1);
}

pub(crate) fn record_failed(queue: &str) {
    counter!(names::TASKS_FAILED_TOTAL, "queue" => queue.to_string()).increment(1);
}

pub(crate) fn record_retried(queue: &str) {
    counter!(names::TASKS_RETRIED_TOTAL, "queue" => queue.to_string()).increment(1);
}

pub(crate) fn record_dead_lettered(queue: &str) {
    counter!(names::TASKS_DEAD_TOTAL, "queue" => queue.to_string()).increment(1);
}

pub(crate) fn record_execution(queue: &str, elapsed: Duration) {
    histogram!(names::TASK_DURATION_SECONDS, "queue" => queue.to_string())
        .record(elapsed.as_secs_f64());
}

pub(crate) fn set_concurrency(concurrency: usize) {
    gauge!(names::WORKERS_CONCURRENCY).set(concurrency as f64);
}

pub(crate) fn set_scheduler_entries(entries: usize) {
    gauge!(names::SCHEDULER_ENTRIES).set(entries as f64);
}
