//! Producer side of a queue.

use crate::config::QueueSettings;
use crate::error::{JobError, JobResult};
use crate::events::Subscription;
use crate::job::{now_ms, Job, JobId, JobOptions};
use crate::keys::QueueKeys;
use crate::metrics::JobMetrics;
use crate::store::{JobCounts, QueueStore, StalledReport};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Handle to one named queue in a store.
///
/// Cheap to clone; clones share the store and the closed state.
pub struct Queue<S: QueueStore> {
    store: Arc<S>,
    keys: QueueKeys,
    settings: QueueSettings,
    closed: Arc<AtomicBool>,
    close_tx: broadcast::Sender<()>,
}

impl<S: QueueStore> Clone for Queue<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            keys: self.keys.clone(),
            settings: self.settings.clone(),
            closed: self.closed.clone(),
            close_tx: self.close_tx.clone(),
        }
    }
}

impl<S: QueueStore> Queue<S> {
    /// Open a queue. Fails if the name or prefix cannot form unambiguous keys.
    pub fn new(store: Arc<S>, settings: QueueSettings) -> JobResult<Self> {
        let keys = QueueKeys::new(settings.prefix.clone(), settings.name.clone())?;
        let (close_tx, _) = broadcast::channel(1);

        Ok(Self {
            store,
            keys,
            settings,
            closed: Arc::new(AtomicBool::new(false)),
            close_tx,
        })
    }

    pub fn name(&self) -> &str {
        self.keys.name()
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Enqueue a serializable payload.
    pub async fn add<T: Serialize + ?Sized>(&self, data: &T, opts: JobOptions) -> JobResult<JobId> {
        let value = serde_json::to_value(data)?;
        self.add_value(value, opts).await
    }

    /// Enqueue a JSON payload.
    pub async fn add_value(&self, data: Value, opts: JobOptions) -> JobResult<JobId> {
        self.ensure_open()?;
        opts.validate()?;

        let now = now_ms();
        opts.resolve_eta(now)?;
        let job = Job::pending(self.keys.clone(), data, &opts, now);
        let fields = job.to_fields()?;
        let eta = (job.delay > 0).then(|| job.eta_ms());

        let id = self
            .store
            .enqueue(&self.keys, &fields, opts.lifo, eta, now)
            .await?;

        JobMetrics::job_enqueued(self.name(), eta.is_some());
        debug!(
            job_id = %id,
            queue = %self.name(),
            delay_ms = job.delay,
            lifo = opts.lifo,
            "Enqueued job"
        );

        Ok(id)
    }

    /// Read a job back. Returns `None` when no record exists.
    pub async fn get_job(&self, id: JobId) -> JobResult<Option<Job>> {
        match self.store.get_job(&self.keys, id).await? {
            Some(fields) => Ok(Some(Job::from_fields(self.keys.clone(), id, &fields)?)),
            None => Ok(None),
        }
    }

    /// Container sizes; also refreshes the queue size gauges.
    pub async fn job_counts(&self) -> JobResult<JobCounts> {
        let counts = self.store.job_counts(&self.keys).await?;
        JobMetrics::update_queue_sizes(self.name(), &counts);
        Ok(counts)
    }

    /// Promote delayed jobs due at or before `now_ms`.
    pub async fn promote_delayed(&self, now_ms: i64) -> JobResult<Vec<JobId>> {
        let promoted = self.store.promote_delayed(&self.keys, now_ms).await?;

        if !promoted.is_empty() {
            JobMetrics::jobs_promoted(self.name(), promoted.len());
            debug!(queue = %self.name(), count = promoted.len(), "Promoted delayed jobs");
        }
        Ok(promoted)
    }

    /// Requeue or fail active jobs whose lock expired.
    pub async fn recover_stalled(&self) -> JobResult<StalledReport> {
        let report = self
            .store
            .recover_stalled(&self.keys, self.settings.stacktrace_limit)
            .await?;

        if !report.is_empty() {
            JobMetrics::jobs_stalled(self.name(), report.requeued.len(), report.failed.len());
        }
        Ok(report)
    }

    /// Due time of the earliest delayed job.
    pub async fn next_delayed_at(&self) -> JobResult<Option<i64>> {
        self.store.next_delayed_at(&self.keys).await
    }

    /// Subscribe to ready and delayed notifications.
    pub async fn subscribe(&self) -> JobResult<Subscription> {
        self.store.subscribe(&self.keys).await
    }

    /// Health check of the underlying store.
    pub async fn ping(&self) -> JobResult<()> {
        self.store.ping().await
    }

    /// Close the queue: refuse new jobs and stop workers and promoters
    /// running against it. Jobs already stored are kept.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(queue = %self.name(), "Closing queue");
            let _ = self.close_tx.send(());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fires once when the queue is closed.
    pub(crate) fn closed_signal(&self) -> broadcast::Receiver<()> {
        self.close_tx.subscribe()
    }

    fn ensure_open(&self) -> JobResult<()> {
        if self.is_closed() {
            return Err(JobError::QueueClosed(self.name().to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;
    use crate::store::MemoryStore;
    use serde::Deserialize;
    use serde_json::json;
    use std::time::Duration;

    fn queue() -> Queue<MemoryStore> {
        Queue::new(Arc::new(MemoryStore::new()), QueueSettings::new("producer")).unwrap()
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Email {
        to: String,
        subject: String,
    }

    #[tokio::test]
    async fn test_add_and_get_typed_payload() {
        let queue = queue();
        let email = Email {
            to: "a@example.com".into(),
            subject: "hi".into(),
        };

        let id = queue
            .add(&email, JobOptions::new().attempts(3).backoff(Backoff::exponential(Duration::from_millis(100))))
            .await
            .unwrap();

        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.backoff, Backoff::Exponential { delay_ms: 100 });
        assert_eq!(job.data_as::<Email>().unwrap(), email);
    }

    #[tokio::test]
    async fn test_delayed_add_goes_to_delayed_set() {
        let queue = queue();
        queue
            .add_value(json!(1), JobOptions::new().delay(Duration::from_secs(60)))
            .await
            .unwrap();

        let counts = queue.job_counts().await.unwrap();
        assert_eq!(counts.delayed, 1);
        assert_eq!(counts.waiting, 0);
        assert!(queue.next_delayed_at().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_options_touch_nothing() {
        let queue = queue();
        let err = queue
            .add_value(json!(1), JobOptions::new().attempts(0))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidOptions(_)));

        assert_eq!(queue.job_counts().await.unwrap().total(), 0);
        // the counter was not consumed
        let id = queue.add_value(json!(1), JobOptions::new()).await.unwrap();
        assert_eq!(id, JobId::new(1));
    }

    #[tokio::test]
    async fn test_unschedulable_eta_is_rejected() {
        let queue = queue();
        let far_delay = JobOptions::new().delay(Duration::from_secs(u64::MAX));
        let far_eta = JobOptions::new().at(chrono::DateTime::<chrono::Utc>::MAX_UTC);
        // valid on its own, past the limit once added to the current time
        let edge = JobOptions::new().delay(Duration::from_millis(crate::job::MAX_ETA_MS as u64));

        for opts in [far_delay, far_eta, edge] {
            let err = queue.add_value(json!(1), opts).await.unwrap_err();
            assert!(matches!(err, JobError::InvalidOptions(_)));
        }

        assert_eq!(queue.job_counts().await.unwrap().total(), 0);
        let id = queue.add_value(json!(1), JobOptions::new()).await.unwrap();
        assert_eq!(id, JobId::new(1));
    }

    #[tokio::test]
    async fn test_missing_job_is_none() {
        let queue = queue();
        assert!(queue.get_job(JobId::new(99)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_jobs() {
        let queue = queue();
        let mut signal = queue.closed_signal();
        queue.close();

        assert!(queue.is_closed());
        assert!(signal.recv().await.is_ok());
        let err = queue.add_value(json!(1), JobOptions::new()).await.unwrap_err();
        assert!(matches!(err, JobError::QueueClosed(_)));
    }

    #[test]
    fn test_rejects_ambiguous_names() {
        let store = Arc::new(MemoryStore::new());
        let settings = QueueSettings::new("a:b");
        assert!(Queue::new(store, settings).is_err());
    }
}
