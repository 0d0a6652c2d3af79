//! Delayed-job promoter.
//!
//! Moves due delayed jobs onto the ready list and periodically returns
//! stalled active jobs. Talks to the queue only through the store, so any
//! number of promoters may run against the same queue.

use crate::config::PromoterSettings;
use crate::error::{JobError, JobResult};
use crate::events::{QueueEvent, Subscription};
use crate::job::now_ms;
use crate::queue::Queue;
use crate::store::QueueStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{error, info, Instrument};

/// Background promoter for one queue.
pub struct Promoter<S: QueueStore> {
    queue: Queue<S>,
    settings: PromoterSettings,
    shutdown_tx: broadcast::Sender<()>,
    running: Arc<AtomicBool>,
}

impl<S: QueueStore> Clone for Promoter<S> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            settings: self.settings.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
            running: self.running.clone(),
        }
    }
}

impl<S: QueueStore> Promoter<S> {
    pub fn new(queue: Queue<S>, settings: PromoterSettings) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            queue,
            settings,
            shutdown_tx,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run until [`Promoter::stop`] is called or the queue is closed.
    ///
    /// Returns immediately when the promoter is disabled in its settings.
    pub async fn start(&self) -> JobResult<()> {
        if !self.settings.enabled {
            info!(queue = %self.queue.name(), "Promoter disabled; not starting");
            return Ok(());
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(JobError::Configuration("Promoter already running".to_string()));
        }

        let queue = self.queue.name().to_string();
        self.run()
            .instrument(tracing::info_span!("promoter", queue = %queue))
            .await;

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Signal the promoter loop to stop.
    pub fn stop(&self) {
        info!(queue = %self.queue.name(), "Stopping promoter...");
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn run(&self) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut closed = self.queue.closed_signal();

        info!(
            queue = %self.queue.name(),
            max_interval_ms = self.settings.max_interval_ms,
            stalled_interval_ms = self.settings.stalled_interval_ms,
            "Starting promoter"
        );

        let mut events = match self.queue.subscribe().await {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                error!(error = %e, "Notifications unavailable; promoter polling only");
                None
            }
        };

        let mut stalled = interval(self.settings.stalled_interval());
        stalled.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.queue.is_closed() {
            let pause = self.promote_once().await;

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = closed.recv() => break,
                _ = stalled.tick() => {
                    if let Err(e) = self.queue.recover_stalled().await {
                        error!(error = %e, "Stalled job recovery failed");
                    }
                }
                eta = next_delayed(&mut events) => {
                    if eta.is_none() {
                        events = None;
                    }
                }
                _ = sleep(pause) => {}
            }
        }

        info!(queue = %self.queue.name(), "Promoter stopped");
    }

    /// Promote what is due and work out how long to sleep.
    async fn promote_once(&self) -> Duration {
        let max = self.settings.max_interval();

        if let Err(e) = self.queue.promote_delayed(now_ms()).await {
            error!(error = %e, "Failed to promote delayed jobs");
            return max;
        }

        match self.queue.next_delayed_at().await {
            Ok(Some(eta)) => {
                let wait = u64::try_from(eta - now_ms()).unwrap_or(0);
                Duration::from_millis(wait).min(max)
            }
            Ok(None) => max,
            Err(e) => {
                error!(error = %e, "Failed to read next delayed job");
                max
            }
        }
    }
}

/// Wait for the next delayed-job notification. Returns `None` once the
/// subscription is gone; pends forever without one.
async fn next_delayed(events: &mut Option<Subscription>) -> Option<i64> {
    let Some(subscription) = events else {
        return std::future::pending().await;
    };

    while let Some(event) = subscription.recv().await {
        if let QueueEvent::Delayed { eta_ms } = event {
            return Some(eta_ms);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;
    use crate::job::JobOptions;
    use crate::store::MemoryStore;
    use serde_json::json;
    use tokio::time::timeout;

    fn queue() -> Queue<MemoryStore> {
        Queue::new(Arc::new(MemoryStore::new()), QueueSettings::new("promo")).unwrap()
    }

    fn settings() -> PromoterSettings {
        PromoterSettings {
            enabled: true,
            max_interval_ms: 1_000,
            stalled_interval_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn test_promotes_due_job() {
        let queue = queue();
        queue
            .add_value(json!(1), JobOptions::new().delay(Duration::from_millis(50)))
            .await
            .unwrap();

        let promoter = Promoter::new(queue.clone(), settings());
        let running = promoter.clone();
        let handle = tokio::spawn(async move { running.start().await });

        let mut waiting = 0;
        for _ in 0..100 {
            waiting = queue.job_counts().await.unwrap().waiting;
            if waiting == 1 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(waiting, 1);

        promoter.stop();
        handle.await.unwrap().unwrap();
        assert!(!promoter.is_running());
    }

    #[tokio::test]
    async fn test_wakes_on_new_delayed_job() {
        let queue = queue();
        let promoter = Promoter::new(
            queue.clone(),
            PromoterSettings {
                max_interval_ms: 60_000,
                ..settings()
            },
        );
        let running = promoter.clone();
        let handle = tokio::spawn(async move { running.start().await });
        sleep(Duration::from_millis(20)).await;

        queue
            .add_value(json!(1), JobOptions::new().delay(Duration::from_millis(30)))
            .await
            .unwrap();

        let promoted = timeout(Duration::from_secs(2), async {
            loop {
                if queue.job_counts().await.unwrap().waiting == 1 {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(promoted.is_ok());

        queue.close();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disabled_promoter_does_not_run() {
        let queue = queue();
        queue
            .add_value(json!(1), JobOptions::new().delay(Duration::from_millis(10)))
            .await
            .unwrap();

        let promoter = Promoter::new(
            queue.clone(),
            PromoterSettings {
                enabled: false,
                ..settings()
            },
        );
        timeout(Duration::from_secs(1), promoter.start())
            .await
            .unwrap()
            .unwrap();
        assert!(!promoter.is_running());

        sleep(Duration::from_millis(50)).await;
        let counts = queue.job_counts().await.unwrap();
        assert_eq!(counts.delayed, 1);
        assert_eq!(counts.waiting, 0);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let promoter = Promoter::new(queue(), settings());
        let running = promoter.clone();
        let handle = tokio::spawn(async move { running.start().await });
        sleep(Duration::from_millis(20)).await;

        assert!(promoter.start().await.is_err());
        promoter.stop();
        handle.await.unwrap().unwrap();
    }
}
