//! Store backends.
//!
//! Every method that changes queue state is one atomic transition: either all
//! of its effects land or none do. Callers never combine reads and writes
//! across containers themselves.

mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::error::JobResult;
use crate::events::Subscription;
use crate::job::JobId;
use crate::keys::QueueKeys;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Raw job record as stored in the job hash.
pub type JobFields = HashMap<String, String>;

/// Stack-trace entry written when a stalled job runs out of attempts.
pub const STALLED_FAILURE: &str = "job stalled more than allowable limit";

/// A job popped from the ready list, locked and marked active.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: JobId,
    /// Record after `attemptsMade` was incremented by the claim.
    pub fields: JobFields,
}

/// Arguments of the fail-or-retry transition.
#[derive(Debug, Clone)]
pub struct Failure {
    /// Attempts started so far, including the one that failed.
    pub attempts_made: u32,
    /// Maximum attempts allowed.
    pub max_attempts: u32,
    /// Backoff before the retry, if one is allowed.
    pub retry_delay_ms: u64,
    /// Current time in ms since the Unix epoch.
    pub now_ms: i64,
    /// Encoded stack-trace list including the new failure.
    pub stacktrace: String,
}

/// Where a failed job went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-entered the delayed set, due at `retry_at_ms`.
    Delayed { retry_at_ms: i64 },
    /// Pushed straight back onto the ready list.
    Requeued,
    /// Out of attempts, moved to failed.
    Failed,
}

/// Result of a stalled-job sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StalledReport {
    /// Returned to the ready list.
    pub requeued: Vec<JobId>,
    /// Moved to failed because their attempts were used up.
    pub failed: Vec<JobId>,
}

impl StalledReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

/// Container sizes for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.delayed + self.completed + self.failed
    }
}

/// Shared store holding queue state.
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    /// Assign an id from the counter, write the record and make the job
    /// ready, or delayed when `eta_ms` is later than `now_ms`.
    async fn enqueue(
        &self,
        keys: &QueueKeys,
        fields: &[(&'static str, String)],
        lifo: bool,
        eta_ms: Option<i64>,
        now_ms: i64,
    ) -> JobResult<JobId>;

    /// Move every delayed job due at or before `now_ms` onto the ready list,
    /// earliest first.
    async fn promote_delayed(&self, keys: &QueueKeys, now_ms: i64) -> JobResult<Vec<JobId>>;

    /// Pop the next ready job, mark it active and lock it for `token`.
    async fn claim_next(
        &self,
        keys: &QueueKeys,
        token: &str,
        lock_ttl: Duration,
    ) -> JobResult<Option<ClaimedJob>>;

    /// Push the lock expiry forward. Returns false if `token` no longer holds it.
    async fn extend_lock(
        &self,
        keys: &QueueKeys,
        id: JobId,
        token: &str,
        lock_ttl: Duration,
    ) -> JobResult<bool>;

    /// Move an active job to completed and release its lock.
    ///
    /// Fails with `LockLost` if `token` does not hold the lock.
    async fn complete(
        &self,
        keys: &QueueKeys,
        id: JobId,
        token: &str,
        return_value: &str,
    ) -> JobResult<()>;

    /// Record a failure, then retry or fail the job and release its lock.
    ///
    /// Fails with `LockLost` if `token` does not hold the lock.
    async fn fail_or_retry(
        &self,
        keys: &QueueKeys,
        id: JobId,
        token: &str,
        failure: &Failure,
    ) -> JobResult<FailOutcome>;

    /// Write the progress field of a job held by `token`.
    async fn update_progress(
        &self,
        keys: &QueueKeys,
        id: JobId,
        token: &str,
        progress: f64,
    ) -> JobResult<()>;

    /// Return active jobs whose lock has expired to the ready list.
    async fn recover_stalled(
        &self,
        keys: &QueueKeys,
        stacktrace_limit: usize,
    ) -> JobResult<StalledReport>;

    /// Read a job record.
    async fn get_job(&self, keys: &QueueKeys, id: JobId) -> JobResult<Option<JobFields>>;

    /// Sizes of the queue containers.
    async fn job_counts(&self, keys: &QueueKeys) -> JobResult<JobCounts>;

    /// Due time of the earliest delayed job.
    async fn next_delayed_at(&self, keys: &QueueKeys) -> JobResult<Option<i64>>;

    /// Subscribe to the queue's notification channels.
    async fn subscribe(&self, keys: &QueueKeys) -> JobResult<Subscription>;

    /// Health check.
    async fn ping(&self) -> JobResult<()>;
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
