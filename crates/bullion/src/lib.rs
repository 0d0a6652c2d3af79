//! Bullion - Distributed Persistent Job Queue
//!
//! A Redis-backed job queue where producers, workers and promoters in any
//! number of processes coordinate only through the store:
//! - Durable jobs with JSON payloads and per-job options
//! - FIFO and LIFO insertion, delayed jobs with millisecond etas
//! - Exactly-once claims guarded by expiring, renewable locks
//! - Retries with fixed or exponential backoff
//! - Stalled job recovery for workers that died mid-job
//! - Pub/sub wake-ups, with polling as the fallback
//!
//! # Architecture
//!
//! ```text
//!   Producer ──add──▶ id counter ─┬─▶ wait (list) ──claim──▶ active (list)
//!                                 │        ▲                     │
//!                                 └─▶ delayed (zset)             ├─▶ completed (set)
//!                                          │ promote             └─▶ failed (set)
//!                                          └──────────▶ wait            │
//!                                                              retry ◀──┘ (backoff)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use bullion::prelude::*;
//! use std::sync::Arc;
//!
//! let store = Arc::new(RedisStore::connect(&RedisSettings::default()).await?);
//! let queue = Queue::new(store, QueueSettings::new("emails"))?;
//!
//! queue
//!     .add(&serde_json::json!({"to": "user@example.com"}), JobOptions::new().attempts(3))
//!     .await?;
//!
//! async fn send(job: Job, _ctx: JobContext<RedisStore>) -> HandlerResult {
//!     Ok(job.data)
//! }
//!
//! let worker = Worker::new(queue.clone(), WorkerSettings::default(), handler_fn(send));
//! worker.start().await?;
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod keys;
pub mod lock;
pub mod metrics;
pub mod promoter;
pub mod queue;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use config::{PromoterSettings, QueueSettings, RedisSettings, WorkerSettings};
pub use error::{JobError, JobResult};
pub use events::{QueueEvent, Subscription};
pub use job::{Job, JobId, JobOptions};
pub use keys::QueueKeys;
pub use lock::{JobLock, LockRenewal};
pub use metrics::{register_metrics, JobMetrics, WorkerMetrics};
pub use promoter::Promoter;
pub use queue::Queue;
pub use retry::{Backoff, BackoffKind};
pub use store::redis::create_pool;
pub use store::{FailOutcome, JobCounts, MemoryStore, QueueStore, RedisStore, StalledReport};
pub use telemetry::{init_tracing, TelemetryConfig};
pub use worker::{handler_fn, HandlerResult, JobContext, JobHandler, Processed, Worker, WorkerStats};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{PromoterSettings, QueueSettings, RedisSettings, WorkerSettings};
    pub use crate::job::{Job, JobId, JobOptions};
    pub use crate::queue::Queue;
    pub use crate::retry::Backoff;
    pub use crate::store::{MemoryStore, QueueStore, RedisStore};
    pub use crate::worker::{handler_fn, HandlerResult, JobContext, JobHandler, Worker};
    pub use crate::{JobError, JobResult, Promoter};
}
