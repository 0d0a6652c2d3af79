//! Workers: claim jobs, run handlers, report the result.

use crate::config::WorkerSettings;
use crate::error::{JobError, JobResult};
use crate::events::QueueEvent;
use crate::job::{Job, JobId};
use crate::lock::JobLock;
use crate::metrics::{JobMetrics, WorkerMetrics};
use crate::queue::Queue;
use crate::store::{FailOutcome, QueueStore};
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// What a handler returns: the job's return value, or the failure.
pub type HandlerResult = Result<Value, JobError>;

/// Processes jobs of one queue.
#[async_trait]
pub trait JobHandler<S: QueueStore>: Send + Sync + 'static {
    async fn handle(&self, job: Job, ctx: JobContext<S>) -> HandlerResult;
}

/// Handler built from a closure, see [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wrap a closure or `async fn` returning a future (boxed or not) as a
/// [`JobHandler`].
pub fn handler_fn<S, F, Fut>(f: F) -> FnHandler<F>
where
    S: QueueStore,
    F: Fn(Job, JobContext<S>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<S, F, Fut> JobHandler<S> for FnHandler<F>
where
    S: QueueStore,
    F: Fn(Job, JobContext<S>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, job: Job, ctx: JobContext<S>) -> HandlerResult {
        (self.0)(job, ctx).await
    }
}

/// Per-job context passed to handlers.
pub struct JobContext<S: QueueStore> {
    attempt: u32,
    worker_id: String,
    lock: JobLock<S>,
}

impl<S: QueueStore> Clone for JobContext<S> {
    fn clone(&self) -> Self {
        Self {
            attempt: self.attempt,
            worker_id: self.worker_id.clone(),
            lock: self.lock.clone(),
        }
    }
}

impl<S: QueueStore> JobContext<S> {
    /// Attempt number, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn job_id(&self) -> JobId {
        self.lock.job_id()
    }

    pub fn lock(&self) -> &JobLock<S> {
        &self.lock
    }

    /// Record progress. Fails with `LockLost` once the job was reassigned.
    pub async fn update_progress(&self, progress: f64) -> JobResult<()> {
        self.lock.update_progress(progress).await
    }
}

/// Result of one [`Worker::process_next`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    /// The ready list was empty.
    Idle,
    /// Handler succeeded and the job completed.
    Completed(JobId),
    /// Handler failed and the job will run again.
    Retrying(JobId, FailOutcome),
    /// The job moved to failed.
    Failed(JobId),
}

/// Worker statistics.
#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub id: String,
    pub running: bool,
    pub concurrency: usize,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub locks_lost: u64,
}

struct Inner<S: QueueStore, H> {
    id: String,
    queue: Queue<S>,
    handler: Arc<H>,
    settings: WorkerSettings,
    shutdown_tx: broadcast::Sender<()>,
    wake: Notify,
    running: AtomicBool,
    busy: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_retried: AtomicU64,
    locks_lost: AtomicU64,
}

/// Runs `concurrency` claim loops against one queue.
pub struct Worker<S: QueueStore, H: JobHandler<S>> {
    inner: Arc<Inner<S, H>>,
}

impl<S: QueueStore, H: JobHandler<S>> Clone for Worker<S, H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: QueueStore, H: JobHandler<S>> Worker<S, H> {
    pub fn new(queue: Queue<S>, settings: WorkerSettings, handler: H) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            inner: Arc::new(Inner {
                id: format!("worker-{}", Uuid::new_v4()),
                queue,
                handler: Arc::new(handler),
                settings,
                shutdown_tx,
                wake: Notify::new(),
                running: AtomicBool::new(false),
                busy: AtomicU64::new(0),
                jobs_completed: AtomicU64::new(0),
                jobs_failed: AtomicU64::new(0),
                jobs_retried: AtomicU64::new(0),
                locks_lost: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Run until [`Worker::stop`] is called or the queue is closed.
    pub async fn start(&self) -> JobResult<()> {
        let inner = &self.inner;
        if inner.settings.concurrency == 0 {
            return Err(JobError::Configuration(
                "Worker concurrency must be at least 1".to_string(),
            ));
        }
        if inner.settings.lock_ttl_ms == 0 {
            return Err(JobError::Configuration(
                "Worker lock ttl must be at least 1ms".to_string(),
            ));
        }
        if inner.settings.poll_interval_ms == 0 {
            return Err(JobError::Configuration(
                "Worker poll interval must be at least 1ms".to_string(),
            ));
        }
        if inner.running.swap(true, Ordering::SeqCst) {
            return Err(JobError::Configuration("Worker already running".to_string()));
        }

        info!(
            worker_id = %inner.id,
            queue = %inner.queue.name(),
            concurrency = inner.settings.concurrency,
            "Starting worker"
        );

        let mut shutdown_rx = inner.shutdown_tx.subscribe();
        let mut closed_rx = inner.queue.closed_signal();

        let notifier = self.spawn_notifier().await;

        let loops: Vec<JoinHandle<()>> = (0..inner.settings.concurrency)
            .map(|slot| {
                let inner = inner.clone();
                let shutdown = inner.shutdown_tx.subscribe();
                let closed = inner.queue.closed_signal();
                tokio::spawn(
                    run_loop(inner, shutdown, closed)
                        .instrument(tracing::info_span!("worker", slot = slot)),
                )
            })
            .collect();

        if !inner.queue.is_closed() {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(worker_id = %inner.id, "Received shutdown signal");
                }
                _ = closed_rx.recv() => {
                    info!(worker_id = %inner.id, "Queue closed");
                }
            }
        }
        // Loops may have been spawned after the signal fired.
        let _ = inner.shutdown_tx.send(());

        info!(worker_id = %inner.id, "Waiting for in-flight jobs to finish...");
        let aborts: Vec<_> = loops.iter().map(|handle| handle.abort_handle()).collect();
        let drained = timeout(inner.settings.shutdown_timeout(), async {
            for handle in loops {
                let _ = handle.await;
            }
        })
        .await;

        if drained.is_err() {
            warn!(worker_id = %inner.id, "Shutdown timeout reached; aborting in-flight jobs");
            for abort in aborts {
                abort.abort();
            }
        }

        if let Some(notifier) = notifier {
            notifier.abort();
        }
        inner.running.store(false, Ordering::SeqCst);

        info!(
            worker_id = %inner.id,
            completed = inner.jobs_completed.load(Ordering::Relaxed),
            failed = inner.jobs_failed.load(Ordering::Relaxed),
            "Worker stopped"
        );

        Ok(())
    }

    /// Signal the claim loops to stop after their current job.
    pub fn stop(&self) {
        info!(worker_id = %self.inner.id, "Stopping worker...");
        let _ = self.inner.shutdown_tx.send(());
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Claim one job, run the handler and finalize it.
    ///
    /// Fails with `LockLost` if the lock expired while the handler ran; the job
    /// then belongs to whoever reclaims it.
    pub async fn process_next(&self) -> JobResult<Processed> {
        self.inner.process_next().await
    }

    pub fn stats(&self) -> WorkerStats {
        let inner = &self.inner;
        WorkerStats {
            id: inner.id.clone(),
            running: self.is_running(),
            concurrency: inner.settings.concurrency,
            jobs_completed: inner.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: inner.jobs_failed.load(Ordering::Relaxed),
            jobs_retried: inner.jobs_retried.load(Ordering::Relaxed),
            locks_lost: inner.locks_lost.load(Ordering::Relaxed),
        }
    }

    /// Forward ready notifications as wake-ups for idle loops.
    async fn spawn_notifier(&self) -> Option<JoinHandle<()>> {
        let mut subscription = match self.inner.queue.subscribe().await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(worker_id = %self.inner.id, error = %e, "Notifications unavailable; polling only");
                return None;
            }
        };

        let inner = self.inner.clone();
        Some(tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                if let QueueEvent::Ready(_) = event {
                    inner.wake.notify_one();
                }
            }
        }))
    }
}

async fn run_loop<S: QueueStore, H: JobHandler<S>>(
    inner: Arc<Inner<S, H>>,
    mut shutdown: broadcast::Receiver<()>,
    mut closed: broadcast::Receiver<()>,
) {
    loop {
        if inner.queue.is_closed() || !matches!(shutdown.try_recv(), Err(broadcast::error::TryRecvError::Empty)) {
            break;
        }

        match inner.process_next().await {
            Ok(Processed::Idle) => {}
            Ok(_) => continue,
            Err(e) if e.is_lock_lost() => continue,
            Err(e) => {
                error!(worker_id = %inner.id, error = %e, "Failed to process job");
            }
        }

        tokio::select! {
            _ = shutdown.recv() => break,
            _ = closed.recv() => break,
            _ = inner.wake.notified() => {}
            _ = sleep(inner.settings.poll_interval()) => {}
        }
    }
}

impl<S: QueueStore, H: JobHandler<S>> Inner<S, H> {
    async fn process_next(&self) -> JobResult<Processed> {
        let queue = &self.queue;
        let token = Uuid::new_v4().to_string();
        let ttl = self.settings.lock_ttl();

        let Some(claim) = queue.store().claim_next(queue.keys(), &token, ttl).await? else {
            return Ok(Processed::Idle);
        };
        JobMetrics::job_claimed(queue.name());

        let lock = JobLock::new(queue.store().clone(), queue.keys().clone(), claim.id, token, ttl);

        let mut job = match Job::from_fields(queue.keys().clone(), claim.id, &claim.fields) {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id = %claim.id, queue = %queue.name(), error = %e, "Undecodable job record");
                self.finalize(lock.discard(&e.to_string()).await)?;
                self.jobs_failed.fetch_add(1, Ordering::Relaxed);
                JobMetrics::job_failed(queue.name(), "decoding", std::time::Duration::ZERO);
                return Ok(Processed::Failed(claim.id));
            }
        };

        debug!(
            job_id = %job.id,
            queue = %queue.name(),
            attempt = job.attempts_made,
            worker_id = %self.id,
            "Processing job"
        );

        let ctx = JobContext {
            attempt: job.attempts_made,
            worker_id: self.id.clone(),
            lock: lock.clone(),
        };

        let renewal = lock.keep_alive(self.settings.lock_renew());
        let busy = self.busy.fetch_add(1, Ordering::Relaxed) + 1;
        WorkerMetrics::update_busy(&self.id, busy);
        let started = Instant::now();

        // Run on its own task so a panicking handler counts as a failure.
        let handler = self.handler.clone();
        let handler_job = job.clone();
        let mut task = HandlerTask(tokio::spawn(async move { handler.handle(handler_job, ctx).await }));
        let result = match (&mut task.0).await {
            Ok(result) => result,
            Err(e) => Err(JobError::Handler(format!("handler panicked: {e}"))),
        };

        let elapsed = started.elapsed();
        let lost = renewal.is_lost();
        renewal.stop().await;
        let busy = self.busy.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        WorkerMetrics::update_busy(&self.id, busy);

        if lost {
            // Another worker may already own the job; leave it to them.
            warn!(job_id = %job.id, queue = %queue.name(), "Dropping result of job whose lock was lost");
            self.locks_lost.fetch_add(1, Ordering::Relaxed);
            JobMetrics::lock_lost(queue.name());
            return Err(JobError::LockLost(job.id.to_string()));
        }

        match result {
            Ok(value) => {
                self.finalize(lock.complete(&value).await)?;
                self.jobs_completed.fetch_add(1, Ordering::Relaxed);
                JobMetrics::job_completed(queue.name(), elapsed);
                Ok(Processed::Completed(job.id))
            }
            Err(e) => {
                let message = failure_message(&e);
                warn!(job_id = %job.id, queue = %queue.name(), error = %message, "Job execution failed");

                let outcome = self.finalize(
                    lock.fail(&mut job, &message, queue.settings().stacktrace_limit)
                        .await,
                )?;

                match outcome {
                    FailOutcome::Failed => {
                        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
                        JobMetrics::job_failed(queue.name(), "handler", elapsed);
                        Ok(Processed::Failed(job.id))
                    }
                    retry => {
                        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
                        JobMetrics::job_retried(queue.name(), job.attempts_made);
                        Ok(Processed::Retrying(job.id, retry))
                    }
                }
            }
        }
    }

    fn finalize<T>(&self, result: JobResult<T>) -> JobResult<T> {
        if let Err(e) = &result {
            if e.is_lock_lost() {
                self.locks_lost.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }
}

/// Handler task that is aborted when its claim loop goes away.
struct HandlerTask(JoinHandle<HandlerResult>);

impl Drop for HandlerTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Text recorded in the stack-trace list for a handler failure.
fn failure_message(err: &JobError) -> String {
    match err {
        JobError::Handler(message) => message.clone(),
        other => other.to_string(),
    }
}
