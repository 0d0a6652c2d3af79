//! Job locks.
//!
//! A claimed job is guarded by an expiring lock whose value is the claiming
//! worker's token. The lock is renewed while the handler runs; a worker that
//! lost its lock finds out on its next state-changing call, which fails with
//! [`JobError::LockLost`].

use crate::error::{JobError, JobResult};
use crate::job::{encode_return_value, encode_stacktraces, now_ms, Job, JobId, MAX_ETA_MS};
use crate::keys::QueueKeys;
use crate::metrics::JobMetrics;
use crate::store::{FailOutcome, Failure, QueueStore};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, trace, warn};

/// Ownership of one active job.
pub struct JobLock<S: QueueStore> {
    store: Arc<S>,
    keys: QueueKeys,
    id: JobId,
    token: String,
    ttl: Duration,
}

impl<S: QueueStore> Clone for JobLock<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            keys: self.keys.clone(),
            id: self.id,
            token: self.token.clone(),
            ttl: self.ttl,
        }
    }
}

impl<S: QueueStore> JobLock<S> {
    pub(crate) fn new(
        store: Arc<S>,
        keys: QueueKeys,
        id: JobId,
        token: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            id,
            token: token.into(),
            ttl,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Storage key of the lock.
    pub fn key(&self) -> String {
        self.keys.lock(self.id)
    }

    /// Push the expiry forward by one ttl. Returns false if the lock is gone.
    pub async fn extend(&self) -> JobResult<bool> {
        self.store
            .extend_lock(&self.keys, self.id, &self.token, self.ttl)
            .await
    }

    /// Record handler progress.
    pub async fn update_progress(&self, progress: f64) -> JobResult<()> {
        self.store
            .update_progress(&self.keys, self.id, &self.token, progress)
            .await
            .map_err(|e| self.note_lock_lost(e))
    }

    /// Move the job to completed with `return_value` recorded.
    pub async fn complete(&self, return_value: &Value) -> JobResult<()> {
        let encoded = encode_return_value(return_value)?;
        self.store
            .complete(&self.keys, self.id, &self.token, &encoded)
            .await
            .map_err(|e| self.note_lock_lost(e))?;

        debug!(job_id = %self.id, queue = %self.keys.name(), "Job completed");
        Ok(())
    }

    /// Record a failed attempt and retry or fail the job.
    ///
    /// `job` must be the record returned by the claim; its stack-trace list is
    /// updated in place.
    pub async fn fail(
        &self,
        job: &mut Job,
        error: &str,
        stacktrace_limit: usize,
    ) -> JobResult<FailOutcome> {
        job.push_stacktrace(error, stacktrace_limit);

        let retry_delay = if job.is_last_attempt() {
            Duration::ZERO
        } else {
            job.backoff.delay_for_attempt(job.attempts_made)
        };

        // long backoffs are pinned to the latest schedulable eta
        let now = now_ms();
        let latest = u64::try_from(MAX_ETA_MS.saturating_sub(now)).unwrap_or(0);
        let failure = Failure {
            attempts_made: job.attempts_made,
            max_attempts: job.attempts,
            retry_delay_ms: crate::store::duration_ms(retry_delay).min(latest),
            now_ms: now,
            stacktrace: encode_stacktraces(&job.stacktraces)?,
        };

        let outcome = self
            .store
            .fail_or_retry(&self.keys, self.id, &self.token, &failure)
            .await
            .map_err(|e| self.note_lock_lost(e))?;

        debug!(
            job_id = %self.id,
            queue = %self.keys.name(),
            attempts_made = job.attempts_made,
            outcome = ?outcome,
            "Job failed"
        );
        Ok(outcome)
    }

    /// Move the job straight to failed, whatever attempts remain.
    ///
    /// Used when the stored record cannot be decoded.
    pub async fn discard(&self, reason: &str) -> JobResult<()> {
        let failure = Failure {
            attempts_made: 1,
            max_attempts: 0,
            retry_delay_ms: 0,
            now_ms: now_ms(),
            stacktrace: encode_stacktraces(&[reason.to_string()])?,
        };

        self.store
            .fail_or_retry(&self.keys, self.id, &self.token, &failure)
            .await
            .map_err(|e| self.note_lock_lost(e))?;
        Ok(())
    }

    /// Start renewing the lock every `every` until the returned guard is
    /// stopped or dropped.
    pub fn keep_alive(&self, every: Duration) -> LockRenewal {
        let lock = self.clone();
        let lost = Arc::new(AtomicBool::new(false));
        let lost_flag = lost.clone();
        let (cancel, mut cancelled) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut cancelled => break,
                    _ = ticker.tick() => match lock.extend().await {
                        Ok(true) => trace!(job_id = %lock.id, "Lock extended"),
                        Ok(false) => {
                            warn!(job_id = %lock.id, queue = %lock.keys.name(), "Lock lost while handler running");
                            lost_flag.store(true, Ordering::SeqCst);
                            break;
                        }
                        Err(e) => {
                            // The lock may still be alive; try again next tick.
                            error!(job_id = %lock.id, error = %e, "Failed to extend lock");
                        }
                    },
                }
            }
        });

        LockRenewal {
            cancel: Some(cancel),
            task,
            lost,
        }
    }

    fn note_lock_lost(&self, err: JobError) -> JobError {
        if err.is_lock_lost() {
            warn!(job_id = %self.id, queue = %self.keys.name(), "Lock lost");
            JobMetrics::lock_lost(self.keys.name());
        }
        err
    }
}

/// Background renewal of a job lock.
pub struct LockRenewal {
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    lost: Arc<AtomicBool>,
}

impl LockRenewal {
    /// True once a renewal found the lock gone.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Stop renewing and wait for the renewal task to exit.
    pub async fn stop(mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        let _ = (&mut self.task).await;
    }
}

impl Drop for LockRenewal {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOptions;
    use crate::retry::Backoff;
    use crate::store::MemoryStore;
    use serde_json::json;

    async fn claimed(
        store: &Arc<MemoryStore>,
        opts: JobOptions,
        ttl: Duration,
    ) -> (JobLock<MemoryStore>, Job) {
        let keys = QueueKeys::new("bull", "locks").unwrap();
        let pending = Job::pending(keys.clone(), json!({"n": 1}), &opts, 0);
        store
            .enqueue(&keys, &pending.to_fields().unwrap(), false, None, 0)
            .await
            .unwrap();

        let claim = store.claim_next(&keys, "token-a", ttl).await.unwrap().unwrap();
        let job = Job::from_fields(keys.clone(), claim.id, &claim.fields).unwrap();
        (JobLock::new(store.clone(), keys, claim.id, "token-a", ttl), job)
    }

    #[tokio::test]
    async fn test_complete_records_return_value() {
        let store = Arc::new(MemoryStore::new());
        let (lock, job) = claimed(&store, JobOptions::new(), Duration::from_secs(5)).await;

        lock.complete(&json!({"ok": true})).await.unwrap();

        let fields = store.get_job(job.queue(), job.id).await.unwrap().unwrap();
        let done = Job::from_fields(job.queue().clone(), job.id, &fields).unwrap();
        assert_eq!(done.return_value, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_fail_schedules_backoff_then_fails() {
        let store = Arc::new(MemoryStore::new());
        let opts = JobOptions::new()
            .attempts(2)
            .backoff(Backoff::fixed(Duration::from_millis(250)));
        let (lock, mut job) = claimed(&store, opts, Duration::from_secs(5)).await;

        let before = now_ms();
        let outcome = lock.fail(&mut job, "first", 10).await.unwrap();
        match outcome {
            FailOutcome::Delayed { retry_at_ms } => {
                assert!(retry_at_ms >= before + 250);
            }
            other => panic!("expected delayed retry, got {other:?}"),
        }
        assert_eq!(job.stacktraces, vec!["first"]);
    }

    #[tokio::test]
    async fn test_huge_backoff_is_capped_at_latest_eta() {
        let store = Arc::new(MemoryStore::new());
        let opts = JobOptions::new()
            .attempts(100)
            .backoff(Backoff::exponential(Duration::from_secs(3600)));
        let (lock, mut job) = claimed(&store, opts, Duration::from_secs(5)).await;
        job.attempts_made = 60;

        match lock.fail(&mut job, "again", 10).await.unwrap() {
            FailOutcome::Delayed { retry_at_ms } => assert_eq!(retry_at_ms, MAX_ETA_MS),
            other => panic!("expected delayed retry, got {other:?}"),
        }
        assert_eq!(store.next_delayed_at(job.queue()).await.unwrap(), Some(MAX_ETA_MS));
    }

    #[tokio::test]
    async fn test_last_attempt_goes_to_failed() {
        let store = Arc::new(MemoryStore::new());
        let (lock, mut job) = claimed(&store, JobOptions::new(), Duration::from_secs(5)).await;

        let outcome = lock.fail(&mut job, "boom", 10).await.unwrap();
        assert_eq!(outcome, FailOutcome::Failed);

        let counts = store.job_counts(job.queue()).await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.active, 0);
    }

    #[tokio::test]
    async fn test_discard_ignores_remaining_attempts() {
        let store = Arc::new(MemoryStore::new());
        let (lock, job) = claimed(&store, JobOptions::new().attempts(5), Duration::from_secs(5)).await;

        lock.discard("corrupt record").await.unwrap();
        assert_eq!(store.job_counts(job.queue()).await.unwrap().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_outlives_ttl() {
        let store = Arc::new(MemoryStore::new());
        let ttl = Duration::from_millis(100);
        let (lock, _job) = claimed(&store, JobOptions::new(), ttl).await;

        let renewal = lock.keep_alive(Duration::from_millis(40));
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        assert!(!renewal.is_lost());
        renewal.stop().await;

        lock.complete(&Value::Null).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lock_rejects_finalize() {
        let store = Arc::new(MemoryStore::new());
        let ttl = Duration::from_millis(100);
        let (lock, job) = claimed(&store, JobOptions::new(), ttl).await;

        tokio::time::sleep(Duration::from_millis(150)).await;

        let err = lock.complete(&Value::Null).await.unwrap_err();
        assert!(err.is_lock_lost());
        assert!(lock.update_progress(10.0).await.unwrap_err().is_lock_lost());

        // position unchanged
        let counts = store.job_counts(job.queue()).await.unwrap();
        assert_eq!(counts.active, 1);
        assert_eq!(counts.completed, 0);
    }
}
