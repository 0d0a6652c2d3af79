//! Runtime settings for stores, queues, workers and the promoter.

use crate::job::DEFAULT_STACKTRACE_LIMIT;
use crate::keys::DEFAULT_PREFIX;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Password, if the server requires `AUTH`.
    #[serde(default)]
    pub password: Option<String>,

    /// Database index to `SELECT`.
    #[serde(default)]
    pub database: Option<u32>,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            password: None,
            database: None,
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl RedisSettings {
    /// URL with credentials and database index folded in.
    pub fn connection_url(&self) -> String {
        let mut url = self.url.clone();

        if let Some(password) = &self.password {
            if let Some((scheme, rest)) = url.split_once("://") {
                if !rest.contains('@') {
                    url = format!("{scheme}://:{password}@{rest}");
                }
            }
        }

        if let Some(db) = self.database {
            let path_start = url
                .split_once("://")
                .and_then(|(scheme, rest)| rest.find('/').map(|i| scheme.len() + 3 + i));
            if let Some(i) = path_start {
                url.truncate(i);
            }
            url = format!("{url}/{db}");
        }

        url
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

/// Queue identity and record retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Queue name.
    pub name: String,

    /// Key prefix.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Stack traces kept per job.
    #[serde(default = "default_stacktrace_limit")]
    pub stacktrace_limit: usize,
}

impl QueueSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: default_prefix(),
            stacktrace_limit: default_stacktrace_limit(),
        }
    }
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_stacktrace_limit() -> usize {
    DEFAULT_STACKTRACE_LIMIT
}

/// Worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Concurrent claim loops.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Lock expiry in milliseconds.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_ms: u64,

    /// Lock renewal interval in milliseconds. Defaults to half the lock ttl.
    #[serde(default)]
    pub lock_renew_ms: Option<u64>,

    /// Fallback polling interval in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            lock_ttl_ms: default_lock_ttl(),
            lock_renew_ms: None,
            poll_interval_ms: default_poll_interval(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl WorkerSettings {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn lock_renew(&self) -> Duration {
        Duration::from_millis(self.lock_renew_ms.unwrap_or(self.lock_ttl_ms / 2).max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn default_concurrency() -> usize {
    1
}

fn default_lock_ttl() -> u64 {
    5_000
}

fn default_poll_interval() -> u64 {
    1_000
}

fn default_shutdown_timeout() -> u64 {
    30
}

/// Delayed-job promoter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromoterSettings {
    /// Run the promoter in this process.
    #[serde(default = "default_promoter_enabled")]
    pub enabled: bool,

    /// Longest sleep between promotion cycles, in milliseconds.
    #[serde(default = "default_max_interval")]
    pub max_interval_ms: u64,

    /// Interval of the stalled-job sweep, in milliseconds.
    #[serde(default = "default_stalled_interval")]
    pub stalled_interval_ms: u64,
}

impl Default for PromoterSettings {
    fn default() -> Self {
        Self {
            enabled: default_promoter_enabled(),
            max_interval_ms: default_max_interval(),
            stalled_interval_ms: default_stalled_interval(),
        }
    }
}

impl PromoterSettings {
    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms.max(1))
    }

    pub fn stalled_interval(&self) -> Duration {
        Duration::from_millis(self.stalled_interval_ms.max(1))
    }
}

fn default_promoter_enabled() -> bool {
    true
}

fn default_max_interval() -> u64 {
    5_000
}

fn default_stalled_interval() -> u64 {
    5_000
}
