//! Periodic background work
//!
//! Each job runs on its own tokio task with a fixed interval. A failed
//! run is logged and retried on the next tick.

use crate::antispam::SpamDefense;
use crate::config::Config;
use crate::directory::Directory;
use crate::smtp::DeliveryQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

const GREYLIST_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Queue processing, directory resync and greylist cleanup
pub struct Scheduler {
    queue: Arc<DeliveryQueue>,
    directory: Arc<Directory>,
    spam: Arc<SpamDefense>,
    queue_interval: Duration,
    max_items: usize,
    max_retries: u32,
    resync_interval: Duration,
}

impl Scheduler {
    pub fn new(
        config: &Config,
        queue: Arc<DeliveryQueue>,
        directory: Arc<Directory>,
        spam: Arc<SpamDefense>,
    ) -> Self {
        Self {
            queue,
            directory,
            spam,
            queue_interval: Duration::from_secs(config.queue.interval_secs.max(1)),
            max_items: config.queue.max_items,
            max_retries: config.queue.max_retries,
            resync_interval: Duration::from_secs(config.directory.resync_interval_secs.max(1)),
        }
    }

    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        info!(
            "Starting background tasks: queue every {:?}, resync every {:?}",
            self.queue_interval, self.resync_interval
        );

        let queue = self.queue.clone();
        let (max_items, max_retries) = (self.max_items, self.max_retries);
        let queue_task = tokio::spawn(every(self.queue_interval, move || {
            let queue = queue.clone();
            async move {
                if let Err(e) = queue.process_cycle(max_items, max_retries).await {
                    error!("Queue processing error: {}", e);
                }
            }
        }));

        let directory = self.directory.clone();
        let resync_task = tokio::spawn(every(self.resync_interval, move || {
            let directory = directory.clone();
            async move {
                match directory.resync().await {
                    Ok(count) => debug!("Directory resynced: {} mailboxes", count),
                    Err(e) => error!("Directory resync failed: {}", e),
                }
            }
        }));

        let spam = self.spam.clone();
        let cleanup_task = tokio::spawn(every(GREYLIST_CLEANUP_INTERVAL, move || {
            let spam = spam.clone();
            async move {
                if let Err(e) = spam.cleanup().await {
                    error!("Greylist cleanup failed: {}", e);
                }
            }
        }));

        vec![queue_task, resync_task, cleanup_task]
    }
}

/// Run `job` every `period`, starting one period from now
async fn every<F, Fut>(period: Duration, mut job: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        job().await;
    }
}
