//! In-process store.
//!
//! Mirrors the Redis data layout (lists, sorted sets, sets, hashes and
//! expiring lock keys) behind a single mutex, so every transition is atomic
//! the same way the Lua scripts are. Useful for tests and single-process use.

use crate::error::{JobError, JobResult};
use crate::events::Subscription;
use crate::job::{delayed_score, score_timestamp, JobId, FIELD_ATTEMPTS, FIELD_ATTEMPTS_MADE};
use crate::job::{FIELD_PROGRESS, FIELD_RETURN_VALUE, FIELD_STACKTRACE};
use crate::keys::QueueKeys;
use crate::store::{
    ClaimedJob, FailOutcome, Failure, JobCounts, JobFields, QueueStore, StalledReport,
    STALLED_FAILURE,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::warn;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug)]
struct HeldLock {
    token: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Db {
    counters: HashMap<String, u64>,
    hashes: HashMap<String, JobFields>,
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, BTreeSet<(i64, String)>>,
    sets: HashMap<String, HashSet<String>>,
    locks: HashMap<String, HeldLock>,
}

impl Db {
    fn list(&mut self, key: String) -> &mut VecDeque<String> {
        self.lists.entry(key).or_default()
    }

    /// `LREM key -1 value`: drop the occurrence nearest the tail.
    fn remove_last(&mut self, key: &str, value: &str) {
        if let Some(list) = self.lists.get_mut(key) {
            if let Some(pos) = list.iter().rposition(|v| v == value) {
                list.remove(pos);
            }
        }
    }

    fn lock_holder(&self, key: &str) -> Option<&str> {
        self.locks
            .get(key)
            .filter(|lock| lock.expires_at > Instant::now())
            .map(|lock| lock.token.as_str())
    }

    fn holds_lock(&self, key: &str, token: &str) -> bool {
        self.lock_holder(key) == Some(token)
    }

    fn set_lock(&mut self, key: String, token: &str, ttl: Duration) {
        self.locks.insert(
            key,
            HeldLock {
                token: token.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn hash_field<T: std::str::FromStr>(&self, key: &str, field: &str) -> Option<T> {
        self.hashes
            .get(key)
            .and_then(|fields| fields.get(field))
            .and_then(|raw| raw.parse().ok())
    }
}

/// Queue store kept in process memory.
pub struct MemoryStore {
    db: Mutex<Db>,
    events: broadcast::Sender<(String, String)>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            db: Mutex::new(Db::default()),
            events,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn publish(&self, channel: String, payload: impl ToString) {
        // No subscribers is fine; waiters poll.
        let _ = self.events.send((channel, payload.to_string()));
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn enqueue(
        &self,
        keys: &QueueKeys,
        fields: &[(&'static str, String)],
        lifo: bool,
        eta_ms: Option<i64>,
        now_ms: i64,
    ) -> JobResult<JobId> {
        let (id, event) = {
            let mut db = self.db.lock();

            let next = db.counters.get(&keys.id()).copied().unwrap_or(0) + 1;
            let id = JobId::new(next);
            let delayed = match eta_ms.filter(|eta| *eta > now_ms) {
                Some(eta) => Some((eta, delayed_score(eta, id)?)),
                None => None,
            };
            db.counters.insert(keys.id(), next);

            let record = fields
                .iter()
                .map(|(field, value)| (field.to_string(), value.clone()))
                .collect();
            db.hashes.insert(keys.job(id), record);

            match delayed {
                Some((eta, score)) => {
                    db.zsets
                        .entry(keys.delayed())
                        .or_default()
                        .insert((score, id.to_string()));
                    (id, (keys.delayed(), eta.to_string()))
                }
                None => {
                    let wait = db.list(keys.wait());
                    if lifo {
                        wait.push_back(id.to_string());
                    } else {
                        wait.push_front(id.to_string());
                    }
                    (id, (keys.jobs(), id.to_string()))
                }
            }
        };

        self.publish(event.0, event.1);
        Ok(id)
    }

    async fn promote_delayed(&self, keys: &QueueKeys, now_ms: i64) -> JobResult<Vec<JobId>> {
        let bound = now_ms.saturating_add(1).saturating_mul(4096);

        let promoted: Vec<String> = {
            let mut db = self.db.lock();
            let due: Vec<(i64, String)> = match db.zsets.get_mut(&keys.delayed()) {
                Some(delayed) => {
                    let due: Vec<_> = delayed
                        .iter()
                        .take_while(|(score, _)| *score < bound)
                        .cloned()
                        .collect();
                    for entry in &due {
                        delayed.remove(entry);
                    }
                    due
                }
                None => Vec::new(),
            };

            let wait = db.list(keys.wait());
            for (_, id) in &due {
                wait.push_front(id.clone());
            }
            due.into_iter().map(|(_, id)| id).collect()
        };

        for id in &promoted {
            self.publish(keys.jobs(), id);
        }

        promoted.iter().map(|id| id.parse()).collect()
    }

    async fn claim_next(
        &self,
        keys: &QueueKeys,
        token: &str,
        lock_ttl: Duration,
    ) -> JobResult<Option<ClaimedJob>> {
        let mut db = self.db.lock();

        let Some(raw_id) = db.list(keys.wait()).pop_back() else {
            return Ok(None);
        };
        db.list(keys.active()).push_front(raw_id.clone());

        let id: JobId = raw_id.parse()?;
        db.set_lock(keys.lock(id), token, lock_ttl);

        let record = db.hashes.entry(keys.job(id)).or_default();
        let made = record
            .get(FIELD_ATTEMPTS_MADE)
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(0);
        record.insert(FIELD_ATTEMPTS_MADE.to_string(), (made + 1).to_string());

        Ok(Some(ClaimedJob {
            id,
            fields: record.clone(),
        }))
    }

    async fn extend_lock(
        &self,
        keys: &QueueKeys,
        id: JobId,
        token: &str,
        lock_ttl: Duration,
    ) -> JobResult<bool> {
        let mut db = self.db.lock();
        let lock_key = keys.lock(id);

        if !db.holds_lock(&lock_key, token) {
            return Ok(false);
        }
        db.set_lock(lock_key, token, lock_ttl);
        Ok(true)
    }

    async fn complete(
        &self,
        keys: &QueueKeys,
        id: JobId,
        token: &str,
        return_value: &str,
    ) -> JobResult<()> {
        let mut db = self.db.lock();
        let lock_key = keys.lock(id);

        if !db.holds_lock(&lock_key, token) {
            return Err(JobError::LockLost(id.to_string()));
        }

        db.remove_last(&keys.active(), &id.to_string());
        db.sets.entry(keys.completed()).or_default().insert(id.to_string());
        db.hashes
            .entry(keys.job(id))
            .or_default()
            .insert(FIELD_RETURN_VALUE.to_string(), return_value.to_string());
        db.locks.remove(&lock_key);
        Ok(())
    }

    async fn fail_or_retry(
        &self,
        keys: &QueueKeys,
        id: JobId,
        token: &str,
        failure: &Failure,
    ) -> JobResult<FailOutcome> {
        let (outcome, event) = {
            let mut db = self.db.lock();
            let lock_key = keys.lock(id);

            if !db.holds_lock(&lock_key, token) {
                return Err(JobError::LockLost(id.to_string()));
            }

            let retry = failure.attempts_made < failure.max_attempts;
            let delayed = if retry && failure.retry_delay_ms > 0 {
                let delay = i64::try_from(failure.retry_delay_ms).unwrap_or(i64::MAX);
                let eta = failure.now_ms.saturating_add(delay);
                Some((eta, delayed_score(eta, id)?))
            } else {
                None
            };

            db.remove_last(&keys.active(), &id.to_string());
            db.hashes
                .entry(keys.job(id))
                .or_default()
                .insert(FIELD_STACKTRACE.to_string(), failure.stacktrace.clone());

            let result = if retry {
                if let Some((eta, score)) = delayed {
                    db.zsets
                        .entry(keys.delayed())
                        .or_default()
                        .insert((score, id.to_string()));
                    (
                        FailOutcome::Delayed { retry_at_ms: eta },
                        Some((keys.delayed(), eta.to_string())),
                    )
                } else {
                    db.list(keys.wait()).push_front(id.to_string());
                    (FailOutcome::Requeued, Some((keys.jobs(), id.to_string())))
                }
            } else {
                db.sets.entry(keys.failed()).or_default().insert(id.to_string());
                (FailOutcome::Failed, None)
            };

            db.locks.remove(&lock_key);
            result
        };

        if let Some((channel, payload)) = event {
            self.publish(channel, payload);
        }
        Ok(outcome)
    }

    async fn update_progress(
        &self,
        keys: &QueueKeys,
        id: JobId,
        token: &str,
        progress: f64,
    ) -> JobResult<()> {
        let mut db = self.db.lock();

        if !db.holds_lock(&keys.lock(id), token) {
            return Err(JobError::LockLost(id.to_string()));
        }

        db.hashes
            .entry(keys.job(id))
            .or_default()
            .insert(FIELD_PROGRESS.to_string(), progress.to_string());
        Ok(())
    }

    async fn recover_stalled(
        &self,
        keys: &QueueKeys,
        stacktrace_limit: usize,
    ) -> JobResult<StalledReport> {
        let mut report = StalledReport::default();

        {
            let mut db = self.db.lock();
            let active: Vec<String> = db.list(keys.active()).iter().cloned().collect();

            for raw_id in active {
                let id: JobId = raw_id.parse()?;
                if db.lock_holder(&keys.lock(id)).is_some() {
                    continue;
                }

                db.remove_last(&keys.active(), &raw_id);

                let job_key = keys.job(id);
                let made: u32 = db.hash_field(&job_key, FIELD_ATTEMPTS_MADE).unwrap_or(0);
                let max: u32 = db.hash_field(&job_key, FIELD_ATTEMPTS).unwrap_or(1);

                if made >= max {
                    let record = db.hashes.entry(job_key).or_default();
                    let mut traces: Vec<String> = record
                        .get(FIELD_STACKTRACE)
                        .and_then(|raw| serde_json::from_str(raw).ok())
                        .unwrap_or_default();
                    traces.push(STALLED_FAILURE.to_string());
                    if traces.len() > stacktrace_limit {
                        let excess = traces.len() - stacktrace_limit;
                        traces.drain(..excess);
                    }
                    record.insert(FIELD_STACKTRACE.to_string(), serde_json::to_string(&traces)?);

                    db.sets.entry(keys.failed()).or_default().insert(raw_id);
                    report.failed.push(id);
                } else {
                    db.list(keys.wait()).push_back(raw_id);
                    report.requeued.push(id);
                }
            }
        }

        for id in &report.requeued {
            self.publish(keys.jobs(), id);
        }

        if !report.is_empty() {
            warn!(
                queue = %keys.name(),
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                "Recovered stalled jobs"
            );
        }

        Ok(report)
    }

    async fn get_job(&self, keys: &QueueKeys, id: JobId) -> JobResult<Option<JobFields>> {
        Ok(self.db.lock().hashes.get(&keys.job(id)).cloned())
    }

    async fn job_counts(&self, keys: &QueueKeys) -> JobResult<JobCounts> {
        let db = self.db.lock();
        let list_len = |key: String| db.lists.get(&key).map_or(0, |l| l.len() as u64);
        let set_len = |key: String| db.sets.get(&key).map_or(0, |s| s.len() as u64);

        Ok(JobCounts {
            waiting: list_len(keys.wait()),
            active: list_len(keys.active()),
            delayed: db.zsets.get(&keys.delayed()).map_or(0, |z| z.len() as u64),
            completed: set_len(keys.completed()),
            failed: set_len(keys.failed()),
        })
    }

    async fn next_delayed_at(&self, keys: &QueueKeys) -> JobResult<Option<i64>> {
        let db = self.db.lock();
        Ok(db
            .zsets
            .get(&keys.delayed())
            .and_then(|delayed| delayed.first())
            .map(|(score, _)| score_timestamp(*score)))
    }

    async fn subscribe(&self, keys: &QueueKeys) -> JobResult<Subscription> {
        let receiver = self.events.subscribe();

        let messages = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => return Some((message, receiver)),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                }
            }
        });

        Ok(Subscription::spawn(keys.clone(), messages))
    }

    async fn ping(&self) -> JobResult<()> {
        Ok(())
    }
}
