//! Prometheus-style metrics for queue monitoring.
//!
//! Recorded through the `metrics` facade; install any exporter to collect them.

use crate::store::JobCounts;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names.
pub mod names {
    /// Total jobs enqueued.
    pub const JOBS_ENQUEUED_TOTAL: &str = "bullion_jobs_enqueued_total";
    /// Total jobs claimed by workers.
    pub const JOBS_CLAIMED_TOTAL: &str = "bullion_jobs_claimed_total";
    /// Total jobs completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "bullion_jobs_completed_total";
    /// Total jobs moved to failed.
    pub const JOBS_FAILED_TOTAL: &str = "bullion_jobs_failed_total";
    /// Total failed attempts that were scheduled for retry.
    pub const JOBS_RETRIED_TOTAL: &str = "bullion_jobs_retried_total";
    /// Total delayed jobs promoted to the ready list.
    pub const JOBS_PROMOTED_TOTAL: &str = "bullion_jobs_promoted_total";
    /// Total stalled jobs recovered.
    pub const JOBS_STALLED_TOTAL: &str = "bullion_jobs_stalled_total";
    /// Total finalize calls rejected because the lock was lost.
    pub const LOCKS_LOST_TOTAL: &str = "bullion_locks_lost_total";

    /// Current waiting jobs.
    pub const JOBS_WAITING: &str = "bullion_jobs_waiting";
    /// Current active jobs.
    pub const JOBS_ACTIVE: &str = "bullion_jobs_active";
    /// Current delayed jobs.
    pub const JOBS_DELAYED: &str = "bullion_jobs_delayed";

    /// Handler execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "bullion_job_duration_seconds";

    /// Handlers currently running in a worker.
    pub const WORKERS_BUSY: &str = "bullion_workers_busy";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total number of jobs enqueued");
    describe_counter!(
        names::JOBS_CLAIMED_TOTAL,
        "Total number of jobs claimed by workers"
    );
    describe_counter!(
        names::JOBS_COMPLETED_TOTAL,
        "Total number of jobs completed successfully"
    );
    describe_counter!(
        names::JOBS_FAILED_TOTAL,
        "Total number of jobs moved to failed"
    );
    describe_counter!(
        names::JOBS_RETRIED_TOTAL,
        "Total number of failed attempts scheduled for retry"
    );
    describe_counter!(
        names::JOBS_PROMOTED_TOTAL,
        "Total number of delayed jobs promoted"
    );
    describe_counter!(
        names::JOBS_STALLED_TOTAL,
        "Total number of stalled jobs recovered"
    );
    describe_counter!(
        names::LOCKS_LOST_TOTAL,
        "Total number of completions or failures rejected for a lost lock"
    );

    describe_gauge!(names::JOBS_WAITING, "Current number of waiting jobs");
    describe_gauge!(names::JOBS_ACTIVE, "Current number of active jobs");
    describe_gauge!(names::JOBS_DELAYED, "Current number of delayed jobs");

    describe_histogram!(
        names::JOB_DURATION_SECONDS,
        "Job handler duration in seconds"
    );

    describe_gauge!(
        names::WORKERS_BUSY,
        "Number of handlers currently running"
    );
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    pub fn job_enqueued(queue: &str, delayed: bool) {
        counter!(
            names::JOBS_ENQUEUED_TOTAL,
            "queue" => queue.to_string(),
            "delayed" => delayed.to_string()
        )
        .increment(1);
    }

    pub fn job_claimed(queue: &str) {
        counter!(names::JOBS_CLAIMED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Record a job completed.
    pub fn job_completed(queue: &str, duration: Duration) {
        counter!(names::JOBS_COMPLETED_TOTAL, "queue" => queue.to_string()).increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "status" => "completed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job that ran out of attempts. `reason` is a short label such
    /// as `handler`, `decoding` or `stalled`.
    pub fn job_failed(queue: &str, reason: &str, duration: Duration) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "queue" => queue.to_string(),
            "reason" => reason.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());
    }

    pub fn job_retried(queue: &str, attempt: u32) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "queue" => queue.to_string(),
            "attempt" => attempt.to_string()
        )
        .increment(1);
    }

    pub fn jobs_promoted(queue: &str, count: usize) {
        counter!(names::JOBS_PROMOTED_TOTAL, "queue" => queue.to_string())
            .increment(count as u64);
    }

    pub fn jobs_stalled(queue: &str, requeued: usize, failed: usize) {
        counter!(
            names::JOBS_STALLED_TOTAL,
            "queue" => queue.to_string(),
            "outcome" => "requeued"
        )
        .increment(requeued as u64);
        counter!(
            names::JOBS_STALLED_TOTAL,
            "queue" => queue.to_string(),
            "outcome" => "failed"
        )
        .increment(failed as u64);
    }

    pub fn lock_lost(queue: &str) {
        counter!(names::LOCKS_LOST_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Update queue size gauges.
    pub fn update_queue_sizes(queue: &str, counts: &JobCounts) {
        gauge!(names::JOBS_WAITING, "queue" => queue.to_string()).set(counts.waiting as f64);
        gauge!(names::JOBS_ACTIVE, "queue" => queue.to_string()).set(counts.active as f64);
        gauge!(names::JOBS_DELAYED, "queue" => queue.to_string()).set(counts.delayed as f64);
    }
}

/// Worker metrics recorder.
#[derive(Clone)]
pub struct WorkerMetrics;

impl WorkerMetrics {
    pub fn update_busy(worker_id: &str, busy: u64) {
        gauge!(names::WORKERS_BUSY, "worker_id" => worker_id.to_string()).set(busy as f64);
    }
}
