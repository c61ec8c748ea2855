//! Batch Scheduler
//!
//! Periodic flush timer for the ingestion queue. Owned by the service and
//! started/stopped explicitly.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::transfer::queue::IngestionQueue;

struct Running {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct BatchScheduler {
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl BatchScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            running: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Start flushing `queue` every interval. A second call while running is a
    /// no-op.
    pub fn start(&self, queue: Arc<IngestionQueue>) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            log::warn!("Batch scheduler already running");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let period = self.interval;
        let handle = tokio::spawn(async move {
            log::info!("Batch scheduler started (interval={}ms)", period.as_millis());
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of an interval completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        queue.flush();
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            log::info!("Batch scheduler stopped");
        });

        *running = Some(Running { shutdown_tx, handle });
    }

    /// Stop the timer and wait for the task to exit. No flush fires after
    /// this returns.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(running) = running else {
            return;
        };

        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.handle.await {
            log::error!("Batch scheduler task failed: {}", e);
        }
    }
}
