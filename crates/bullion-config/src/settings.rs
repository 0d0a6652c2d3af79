//! Configuration structures.

use bullion::{
    JobResult, PromoterSettings, Queue, QueueSettings, RedisSettings, RedisStore, TelemetryConfig,
    WorkerSettings,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BullionConfig {
    /// Redis connection.
    #[serde(default)]
    pub redis: RedisSettings,

    /// Queue identity.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Worker settings.
    #[serde(default)]
    pub worker: WorkerSettings,

    /// Delayed-job promoter settings.
    #[serde(default)]
    pub promoter: PromoterSettings,

    /// Log output.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Queue section. The name has no default and must be configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub name: String,

    #[serde(default = "default_prefix")]
    pub prefix: String,

    #[serde(default = "default_stacktrace_limit")]
    pub stacktrace_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            prefix: default_prefix(),
            stacktrace_limit: default_stacktrace_limit(),
        }
    }
}

fn default_prefix() -> String {
    bullion::keys::DEFAULT_PREFIX.to_string()
}

fn default_stacktrace_limit() -> usize {
    bullion::job::DEFAULT_STACKTRACE_LIMIT
}

impl From<QueueConfig> for QueueSettings {
    fn from(config: QueueConfig) -> Self {
        QueueSettings {
            name: config.name,
            prefix: config.prefix,
            stacktrace_limit: config.stacktrace_limit,
        }
    }
}

impl BullionConfig {
    pub fn queue_settings(&self) -> QueueSettings {
        self.queue.clone().into()
    }

    /// Connect to Redis and open the configured queue.
    pub async fn open_queue(&self) -> JobResult<Queue<RedisStore>> {
        let store = RedisStore::connect(&self.redis).await?;
        Queue::new(Arc::new(store), self.queue_settings())
    }
}
