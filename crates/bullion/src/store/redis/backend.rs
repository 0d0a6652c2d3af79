//! Redis store implementation.

use super::scripts::{Scripts, LOCK_MISMATCH};
use crate::config::RedisSettings;
use crate::error::{JobError, JobResult};
use crate::events::Subscription;
use crate::job::{score_timestamp, JobId};
use crate::keys::QueueKeys;
use crate::store::{
    duration_ms, ClaimedJob, FailOutcome, Failure, JobCounts, JobFields, QueueStore,
    StalledReport, STALLED_FAILURE,
};
use async_trait::async_trait;
use deadpool_redis::Pool;
use futures::{future, StreamExt};
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Queue store backed by a Redis server.
///
/// Commands go through a connection pool; notifications use a dedicated
/// pub/sub connection per subscription.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    client: redis::Client,
    scripts: Scripts,
}

impl RedisStore {
    /// Create a store from an existing pool and a client for pub/sub.
    pub fn new(pool: Pool, client: redis::Client) -> Self {
        Self {
            pool,
            client,
            scripts: Scripts::load(),
        }
    }

    /// Connect using the given settings.
    pub async fn connect(settings: &RedisSettings) -> JobResult<Self> {
        let pool = super::create_pool(settings).await?;
        let client = redis::Client::open(settings.connection_url())
            .map_err(|e| JobError::Configuration(format!("Invalid Redis URL: {}", e)))?;
        Ok(Self::new(pool, client))
    }

    /// Get a connection from the pool.
    async fn conn(&self) -> JobResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }
}

fn parse_ids(raw: Vec<String>) -> JobResult<Vec<JobId>> {
    raw.iter().map(|id| id.parse()).collect()
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn enqueue(
        &self,
        keys: &QueueKeys,
        fields: &[(&'static str, String)],
        lifo: bool,
        eta_ms: Option<i64>,
        now_ms: i64,
    ) -> JobResult<JobId> {
        let mut conn = self.conn().await?;

        let mut invocation = self.scripts.enqueue.prepare_invoke();
        invocation
            .key(keys.jobs())
            .key(keys.wait())
            .key(keys.delayed())
            .key(keys.id())
            .arg(keys.base())
            .arg(if lifo { "1" } else { "0" })
            .arg(eta_ms.map(|eta| eta.to_string()).unwrap_or_default())
            .arg(now_ms);
        for (field, value) in fields {
            invocation.arg(*field).arg(value);
        }

        let id: u64 = invocation.invoke_async(&mut *conn).await?;
        Ok(JobId::new(id))
    }

    async fn promote_delayed(&self, keys: &QueueKeys, now_ms: i64) -> JobResult<Vec<JobId>> {
        let mut conn = self.conn().await?;
        let bound = now_ms.saturating_add(1).saturating_mul(4096);

        let promoted: Vec<String> = self
            .scripts
            .promote_delayed
            .key(keys.delayed())
            .key(keys.wait())
            .key(keys.jobs())
            .arg(bound)
            .invoke_async(&mut *conn)
            .await?;

        parse_ids(promoted)
    }

    async fn claim_next(
        &self,
        keys: &QueueKeys,
        token: &str,
        lock_ttl: Duration,
    ) -> JobResult<Option<ClaimedJob>> {
        let mut conn = self.conn().await?;

        let claimed: Option<(String, JobFields)> = self
            .scripts
            .claim_next
            .key(keys.wait())
            .key(keys.active())
            .arg(keys.base())
            .arg(token)
            .arg(duration_ms(lock_ttl))
            .invoke_async(&mut *conn)
            .await?;

        match claimed {
            Some((id, fields)) => Ok(Some(ClaimedJob {
                id: id.parse()?,
                fields,
            })),
            None => Ok(None),
        }
    }

    async fn extend_lock(
        &self,
        keys: &QueueKeys,
        id: JobId,
        token: &str,
        lock_ttl: Duration,
    ) -> JobResult<bool> {
        let mut conn = self.conn().await?;

        let extended: i64 = self
            .scripts
            .extend_lock
            .key(keys.lock(id))
            .arg(token)
            .arg(duration_ms(lock_ttl))
            .invoke_async(&mut *conn)
            .await?;

        Ok(extended == 1)
    }

    async fn complete(
        &self,
        keys: &QueueKeys,
        id: JobId,
        token: &str,
        return_value: &str,
    ) -> JobResult<()> {
        let mut conn = self.conn().await?;

        let result: i64 = self
            .scripts
            .complete
            .key(keys.active())
            .key(keys.completed())
            .key(keys.job(id))
            .key(keys.lock(id))
            .arg(id.as_u64())
            .arg(token)
            .arg(return_value)
            .invoke_async(&mut *conn)
            .await?;

        if result == LOCK_MISMATCH {
            return Err(JobError::LockLost(id.to_string()));
        }
        Ok(())
    }

    async fn fail_or_retry(
        &self,
        keys: &QueueKeys,
        id: JobId,
        token: &str,
        failure: &Failure,
    ) -> JobResult<FailOutcome> {
        let mut conn = self.conn().await?;

        let result: i64 = self
            .scripts
            .fail_or_retry
            .key(keys.active())
            .key(keys.failed())
            .key(keys.delayed())
            .key(keys.wait())
            .key(keys.jobs())
            .key(keys.job(id))
            .key(keys.lock(id))
            .arg(id.as_u64())
            .arg(token)
            .arg(&failure.stacktrace)
            .arg(failure.attempts_made)
            .arg(failure.max_attempts)
            .arg(failure.retry_delay_ms)
            .arg(failure.now_ms)
            .invoke_async(&mut *conn)
            .await?;

        match result {
            LOCK_MISMATCH => Err(JobError::LockLost(id.to_string())),
            0 => Ok(FailOutcome::Failed),
            1 => Ok(FailOutcome::Delayed {
                retry_at_ms: failure
                    .now_ms
                    .saturating_add(i64::try_from(failure.retry_delay_ms).unwrap_or(i64::MAX)),
            }),
            2 => Ok(FailOutcome::Requeued),
            other => Err(JobError::Internal(format!(
                "unexpected fail_or_retry result {other} for job {id}"
            ))),
        }
    }

    async fn update_progress(
        &self,
        keys: &QueueKeys,
        id: JobId,
        token: &str,
        progress: f64,
    ) -> JobResult<()> {
        let mut conn = self.conn().await?;

        let result: i64 = self
            .scripts
            .update_progress
            .key(keys.job(id))
            .key(keys.lock(id))
            .arg(token)
            .arg(progress.to_string())
            .invoke_async(&mut *conn)
            .await?;

        if result == LOCK_MISMATCH {
            return Err(JobError::LockLost(id.to_string()));
        }
        Ok(())
    }

    async fn recover_stalled(
        &self,
        keys: &QueueKeys,
        stacktrace_limit: usize,
    ) -> JobResult<StalledReport> {
        let mut conn = self.conn().await?;

        let (requeued, failed): (Vec<String>, Vec<String>) = self
            .scripts
            .recover_stalled
            .key(keys.active())
            .key(keys.wait())
            .key(keys.failed())
            .key(keys.jobs())
            .arg(keys.base())
            .arg(stacktrace_limit)
            .arg(STALLED_FAILURE)
            .invoke_async(&mut *conn)
            .await?;

        let report = StalledReport {
            requeued: parse_ids(requeued)?,
            failed: parse_ids(failed)?,
        };

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
        let mut conn = self.conn().await?;
        let fields: JobFields = conn.hgetall(keys.job(id)).await?;

        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(fields))
    }

    async fn job_counts(&self, keys: &QueueKeys) -> JobResult<JobCounts> {
        let mut conn = self.conn().await?;

        let (waiting, active, delayed, completed, failed): (u64, u64, u64, u64, u64) =
            redis::pipe()
                .llen(keys.wait())
                .llen(keys.active())
                .zcard(keys.delayed())
                .scard(keys.completed())
                .scard(keys.failed())
                .query_async(&mut *conn)
                .await?;

        Ok(JobCounts {
            waiting,
            active,
            delayed,
            completed,
            failed,
        })
    }

    async fn next_delayed_at(&self, keys: &QueueKeys) -> JobResult<Option<i64>> {
        let mut conn = self.conn().await?;
        let head: Vec<(String, f64)> = conn.zrange_withscores(keys.delayed(), 0, 0).await?;

        Ok(head
            .first()
            .map(|(_, score)| score_timestamp(*score as i64)))
    }

    async fn subscribe(&self, keys: &QueueKeys) -> JobResult<Subscription> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| JobError::StoreUnavailable(e.to_string()))?;

        pubsub.subscribe(vec![keys.jobs(), keys.delayed()]).await?;

        info!(queue = %keys.name(), "Subscribed to queue notifications");

        let messages = pubsub.into_on_message().filter_map(|msg| {
            let message = match msg.get_payload::<String>() {
                Ok(payload) => Some((msg.get_channel_name().to_string(), payload)),
                Err(e) => {
                    debug!(error = %e, "Skipping undecodable notification");
                    None
                }
            };
            future::ready(message)
        });

        Ok(Subscription::spawn(keys.clone(), messages))
    }

    async fn ping(&self) -> JobResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|e| JobError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }
}
