//! Redis-backed store.
//!
//! Every transition runs as a single Lua script, so concurrent workers and
//! producers on any number of hosts observe each transition atomically.

mod backend;
mod scripts;

pub use backend::RedisStore;

use crate::config::RedisSettings;
use crate::error::{JobError, JobResult};
use deadpool_redis::{Config, Pool, Runtime};
use tracing::info;

/// Create a Redis connection pool and check that the server answers.
pub async fn create_pool(settings: &RedisSettings) -> JobResult<Pool> {
    info!("Creating Redis connection pool for job queue...");

    let cfg = Config::from_url(settings.connection_url());

    let pool = cfg
        .builder()
        .map_err(|e| JobError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(settings.pool_size)
        .wait_timeout(Some(settings.connect_timeout()))
        .create_timeout(Some(settings.connect_timeout()))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| JobError::Configuration(format!("Failed to create pool: {}", e)))?;

    let mut conn = pool.get().await?;
    redis::cmd("PING")
        .query_async::<String>(&mut *conn)
        .await?;

    info!(pool_size = settings.pool_size, "Redis connection pool created successfully");

    Ok(pool)
}
