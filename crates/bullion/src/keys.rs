//! Store key namespace for a queue.
//!
//! Every container a queue owns lives under `{prefix}:{name}:`. Prefix and
//! name may not contain `:`, which keeps the mapping from
//! `(prefix, name, segment)` to key injective.

use crate::error::{JobError, JobResult};
use crate::job::JobId;

/// Default key prefix, shared with other Bull-compatible queues.
pub const DEFAULT_PREFIX: &str = "bull";

/// Channel announcing job ids that became ready.
pub const SEGMENT_JOBS: &str = "jobs";
/// Atomic id counter.
pub const SEGMENT_ID: &str = "id";
/// Ready list.
pub const SEGMENT_WAIT: &str = "wait";
/// Active list.
pub const SEGMENT_ACTIVE: &str = "active";
/// Delayed sorted set, also the delayed-notification channel.
pub const SEGMENT_DELAYED: &str = "delayed";
/// Completed set.
pub const SEGMENT_COMPLETED: &str = "completed";
/// Failed set.
pub const SEGMENT_FAILED: &str = "failed";

const LOCK_SUFFIX: &str = ":lock";

/// Key builder for one queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKeys {
    prefix: String,
    name: String,
    base: String,
}

impl QueueKeys {
    /// Create a key builder, rejecting names that would make keys ambiguous.
    pub fn new(prefix: impl Into<String>, name: impl Into<String>) -> JobResult<Self> {
        let prefix = prefix.into();
        let name = name.into();

        for (label, value) in [("prefix", &prefix), ("queue name", &name)] {
            if value.is_empty() {
                return Err(JobError::InvalidOptions(format!("{label} must not be empty")));
            }
            if value.contains(':') {
                return Err(JobError::InvalidOptions(format!(
                    "{label} must not contain ':' (got {value:?})"
                )));
            }
        }

        let base = format!("{prefix}:{name}:");
        Ok(Self { prefix, name, base })
    }

    /// Create a key builder with the default prefix.
    pub fn with_default_prefix(name: impl Into<String>) -> JobResult<Self> {
        Self::new(DEFAULT_PREFIX, name)
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `{prefix}:{name}:`, the stem job hashes are appended to.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Full key for a segment.
    pub fn key(&self, segment: &str) -> String {
        format!("{}{}", self.base, segment)
    }

    pub fn jobs(&self) -> String {
        self.key(SEGMENT_JOBS)
    }

    pub fn id(&self) -> String {
        self.key(SEGMENT_ID)
    }

    pub fn wait(&self) -> String {
        self.key(SEGMENT_WAIT)
    }

    pub fn active(&self) -> String {
        self.key(SEGMENT_ACTIVE)
    }

    pub fn delayed(&self) -> String {
        self.key(SEGMENT_DELAYED)
    }

    pub fn completed(&self) -> String {
        self.key(SEGMENT_COMPLETED)
    }

    pub fn failed(&self) -> String {
        self.key(SEGMENT_FAILED)
    }

    /// Hash holding a job record.
    pub fn job(&self, id: JobId) -> String {
        self.key(&id.to_string())
    }

    /// Exclusive lock over an active job.
    pub fn lock(&self, id: JobId) -> String {
        format!("{}{}{}", self.base, id, LOCK_SUFFIX)
    }
}
