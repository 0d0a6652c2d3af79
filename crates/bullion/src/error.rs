//! Job error types.

use thiserror::Error;

/// Result type for queue operations.
pub type JobResult<T> = Result<T, JobError>;

/// Queue and job errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// Enqueue options were rejected before touching the store.
    #[error("Invalid job options: {0}")]
    InvalidOptions(String),

    /// A payload or return value could not be serialized.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// A stored job record could not be read back.
    #[error("Decoding error for job {job_id}: {reason}")]
    Decoding { job_id: String, reason: String },

    /// The job lock expired or is held by another worker.
    #[error("Lock lost for job {0}")]
    LockLost(String),

    /// The store could not be reached.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// The queue was closed.
    #[error("Queue closed: {0}")]
    QueueClosed(String),

    /// Job not found.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// The job handler reported a failure.
    #[error("Job handler failed: {0}")]
    Handler(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Builds a decoding error for the given job id.
    pub fn decoding(job_id: impl ToString, reason: impl Into<String>) -> Self {
        JobError::Decoding {
            job_id: job_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns true if the operation may succeed when retried by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::StoreUnavailable(_) | JobError::Redis(_) | JobError::Pool(_)
        )
    }

    /// Returns true if the caller no longer owns the job.
    pub fn is_lock_lost(&self) -> bool {
        matches!(self, JobError::LockLost(_))
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::Encoding(err.to_string())
    }
}
