//! Common test infrastructure for queue integration tests.

#![allow(dead_code)]

use bullion::{
    handler_fn, HandlerResult, Job, JobContext, MemoryStore, Queue, QueueSettings, RedisSettings,
    RedisStore, Worker, WorkerSettings,
};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::redis::Redis;

/// Queue over a fresh in-process store.
pub fn memory_queue(name: &str) -> Queue<MemoryStore> {
    Queue::new(Arc::new(MemoryStore::new()), QueueSettings::new(name)).expect("Invalid queue name")
}

/// Worker settings with short polling, suitable for tests.
pub fn fast_worker_settings(concurrency: usize) -> WorkerSettings {
    WorkerSettings {
        concurrency,
        lock_ttl_ms: 2_000,
        poll_interval_ms: 20,
        shutdown_timeout_secs: 5,
        ..WorkerSettings::default()
    }
}

/// Handler that completes every job with its own payload.
pub async fn echo<S: bullion::QueueStore>(job: Job, _ctx: JobContext<S>) -> HandlerResult {
    Ok(job.data)
}

pub fn echo_worker(queue: &Queue<MemoryStore>, concurrency: usize) -> Worker<MemoryStore, impl bullion::JobHandler<MemoryStore>> {
    Worker::new(
        queue.clone(),
        fast_worker_settings(concurrency),
        handler_fn(echo::<MemoryStore>),
    )
}

/// Test Redis server.
///
/// Manages a Redis testcontainer lifecycle and provides a connected store.
pub struct TestRedis {
    _container: ContainerAsync<Redis>,
    store: Arc<RedisStore>,
}

impl TestRedis {
    /// Starts a fresh Redis container and connects to it.
    pub async fn new() -> Self {
        let container = Redis::default()
            .start()
            .await
            .expect("Failed to start Redis container");

        let port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let settings = RedisSettings {
            url: format!("redis://127.0.0.1:{}", port),
            pool_size: 8,
            ..RedisSettings::default()
        };

        let store = Self::connect_with_retry(&settings, 30).await;

        Self {
            _container: container,
            store: Arc::new(store),
        }
    }

    async fn connect_with_retry(settings: &RedisSettings, max_retries: u32) -> RedisStore {
        let mut retries = 0;
        loop {
            match RedisStore::connect(settings).await {
                Ok(store) => return store,
                Err(e) if retries < max_retries => {
                    retries += 1;
                    eprintln!("Redis not ready (attempt {}): {}", retries, e);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(e) => panic!("Failed to connect to Redis after {} attempts: {}", max_retries, e),
            }
        }
    }

    pub fn store(&self) -> Arc<RedisStore> {
        self.store.clone()
    }

    pub fn queue(&self, name: &str) -> Queue<RedisStore> {
        Queue::new(self.store(), QueueSettings::new(name)).expect("Invalid queue name")
    }
}
