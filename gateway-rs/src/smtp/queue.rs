//! Delivery queue with retry
//!
//! Messages whose relay failed transiently wait here for the next cycle.
//! Everything lives in account data on the message bus:
//!
//! ```text
//! mailgate.queue         index: id → id
//! mailgate.queue.<id>    item:  id, from, to, data, attempts, attemptedAt
//! ```
//!
//! A cycle holds the index lock from start to end, so cycles never
//! overlap. Delivery is at-least-once: a crash between relay and dequeue
//! sends the message again on the next run.

use crate::bus::{AccountData, MessageBus};
use crate::error::{GatewayError, Result};
use crate::mime::{email_date, DATE_FORMAT};
use crate::smtp::relay::Relay;
use crate::utils::KeyLocks;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Account data key of the queue index
pub const QUEUE_KEY: &str = "mailgate.queue";

fn item_key(id: &str) -> String {
    format!("{}.{}", QUEUE_KEY, id)
}

/// A queued message
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub id: String,
    pub from: String,
    pub to: String,
    pub data: String,
    pub attempts: u32,
    pub attempted_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    pub fn new(id: &str, from: &str, to: &str, data: &[u8]) -> Self {
        QueueItem {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            data: String::from_utf8_lossy(data).into_owned(),
            attempts: 0,
            attempted_at: None,
        }
    }

    fn to_account_data(&self) -> AccountData {
        let mut data = AccountData::new();
        data.insert("id".to_string(), self.id.clone());
        data.insert("from".to_string(), self.from.clone());
        data.insert("to".to_string(), self.to.clone());
        data.insert("data".to_string(), self.data.clone());
        data.insert("attempts".to_string(), self.attempts.to_string());
        if let Some(at) = &self.attempted_at {
            data.insert("attemptedAt".to_string(), email_date(at));
        }
        data
    }

    fn from_account_data(mut data: AccountData) -> Result<Self> {
        let mut field = |name: &str| {
            data.remove(name)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| GatewayError::Store(format!("queue item without {}", name)))
        };

        let id = field("id")?;
        let from = field("from")?;
        let to = field("to")?;
        let body = field("data")?;
        let attempts = field("attempts")
            .ok()
            .and_then(|attempts| attempts.parse().ok())
            .unwrap_or(0);
        let attempted_at = field("attemptedAt").ok().and_then(|at| {
            DateTime::parse_from_str(&at, DATE_FORMAT)
                .ok()
                .map(|at| at.with_timezone(&Utc))
        });

        Ok(QueueItem {
            id,
            from,
            to,
            data: body,
            attempts,
            attempted_at,
        })
    }
}

/// What a processing cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub sent: usize,
    pub dropped: usize,
    pub retried: usize,
    pub skipped: usize,
}

impl CycleSummary {
    pub fn visited(&self) -> usize {
        self.sent + self.dropped + self.retried + self.skipped
    }
}

/// Queue of messages awaiting relay
pub struct DeliveryQueue {
    bus: Arc<dyn MessageBus>,
    locks: KeyLocks,
    relay: Arc<dyn Relay>,
}

impl DeliveryQueue {
    pub fn new(bus: Arc<dyn MessageBus>, locks: KeyLocks, relay: Arc<dyn Relay>) -> Self {
        Self { bus, locks, relay }
    }

    /// Add a message to the queue
    ///
    /// The item is written before the index entry. If the index write
    /// fails the item stays behind, unreferenced and never sent.
    pub async fn enqueue(&self, id: &str, from: &str, to: &str, data: &[u8]) -> Result<()> {
        info!("Enqueuing {} from {} to {}", id, from, to);

        let item = QueueItem::new(id, from, to, data);
        {
            let key = item_key(id);
            let _guard = self.locks.lock(&key).await;
            self.bus.set_account_data(&key, item.to_account_data()).await?;
        }

        let _guard = self.locks.lock(QUEUE_KEY).await;
        let mut index = self.bus.get_account_data(QUEUE_KEY).await?;
        index.insert(id.to_string(), id.to_string());
        self.bus.set_account_data(QUEUE_KEY, index).await
    }

    /// Try to send up to `max_items` queued messages
    ///
    /// Items never attempted go first, then the ones whose last attempt is
    /// oldest (fewest attempts on a tie), so a message that keeps failing
    /// moves behind the others.
    /// Index entries whose item is gone are removed from the index.
    pub async fn process_cycle(&self, max_items: usize, max_retries: u32) -> Result<CycleSummary> {
        let _guard = self.locks.lock(QUEUE_KEY).await;
        let mut index = self.bus.get_account_data(QUEUE_KEY).await?;

        let (ids, orphans) = self.rotation(&index).await?;
        if !orphans.is_empty() {
            for id in &orphans {
                warn!("Removing queue entry {} without an item", id);
                index.remove(id);
            }
            self.bus.set_account_data(QUEUE_KEY, index.clone()).await?;
        }
        let ids: Vec<String> = ids.into_iter().take(max_items).collect();

        let mut summary = CycleSummary::default();
        let mut done = Vec::new();

        for id in ids {
            let key = item_key(&id);
            let _item_guard = self.locks.lock(&key).await;

            let mut item = match self
                .bus
                .get_account_data(&key)
                .await
                .and_then(QueueItem::from_account_data)
            {
                Ok(item) => item,
                Err(e) => {
                    error!("Cannot read queue item {}: {}", id, e);
                    summary.skipped += 1;
                    continue;
                }
            };

            if item.attempts > max_retries {
                warn!(
                    "Dropping {} to {} after {} attempts",
                    item.id, item.to, item.attempts
                );
                done.push(id);
                summary.dropped += 1;
                continue;
            }

            match self
                .relay
                .relay(&item.from, &item.to, item.data.as_bytes())
                .await
            {
                Ok(()) => {
                    info!("Queued message {} delivered to {}", item.id, item.to);
                    done.push(id);
                    summary.sent += 1;
                }
                Err(e) => {
                    item.attempts += 1;
                    item.attempted_at = Some(Utc::now());
                    warn!(
                        "Delivery of {} failed (attempt {}): {}",
                        item.id, item.attempts, e
                    );
                    if let Err(e) = self.bus.set_account_data(&key, item.to_account_data()).await {
                        error!("Cannot update queue item {}: {}", item.id, e);
                    }
                    summary.retried += 1;
                }
            }
        }

        if !done.is_empty() {
            for id in &done {
                index.remove(id);
            }
            self.bus.set_account_data(QUEUE_KEY, index).await?;
            for id in &done {
                self.tombstone(id).await?;
            }
        }

        if summary.visited() > 0 {
            info!(
                "Queue cycle: {} sent, {} dropped, {} retried, {} skipped",
                summary.sent, summary.dropped, summary.retried, summary.skipped
            );
        } else {
            debug!("Queue is empty");
        }

        Ok(summary)
    }

    /// Index ids in visiting order, and the ids whose item is missing
    async fn rotation(&self, index: &AccountData) -> Result<(Vec<String>, Vec<String>)> {
        // Unreadable items sort after every readable one
        let mut ranked: Vec<(u8, Option<DateTime<Utc>>, u32, String)> =
            Vec::with_capacity(index.len());
        let mut orphans = Vec::new();

        for id in index.keys() {
            let data = self.bus.get_account_data(&item_key(id)).await?;
            if data.is_empty() {
                orphans.push(id.clone());
                continue;
            }
            match QueueItem::from_account_data(data) {
                Ok(item) => ranked.push((0, item.attempted_at, item.attempts, id.clone())),
                Err(_) => ranked.push((1, None, 0, id.clone())),
            }
        }

        ranked.sort();
        let ids = ranked.into_iter().map(|(_, _, _, id)| id).collect();
        Ok((ids, orphans))
    }

    /// Remove a message from the queue
    pub async fn dequeue(&self, id: &str) -> Result<()> {
        {
            let _guard = self.locks.lock(QUEUE_KEY).await;
            let mut index = self.bus.get_account_data(QUEUE_KEY).await?;
            if index.remove(id).is_some() {
                self.bus.set_account_data(QUEUE_KEY, index).await?;
            }
        }
        self.tombstone(id).await
    }

    async fn tombstone(&self, id: &str) -> Result<()> {
        let key = item_key(id);
        let _guard = self.locks.lock(&key).await;
        self.bus.set_account_data(&key, AccountData::new()).await
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.bus.get_account_data(QUEUE_KEY).await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Readable queued items, ordered by id
    pub async fn items(&self) -> Result<Vec<QueueItem>> {
        let index = self.bus.get_account_data(QUEUE_KEY).await?;
        let mut ids: Vec<&String> = index.keys().collect();
        ids.sort();

        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            match self
                .bus
                .get_account_data(&item_key(id))
                .await
                .and_then(QueueItem::from_account_data)
            {
                Ok(item) => items.push(item),
                Err(e) => debug!("Skipping queue item {}: {}", id, e),
            }
        }
        Ok(items)
    }

    /// Overwrite the attempt counter of a queued item
    #[cfg(test)]
    pub(crate) async fn set_attempts(&self, id: &str, attempts: u32) -> Result<()> {
        let key = item_key(id);
        let _guard = self.locks.lock(&key).await;
        let mut item = QueueItem::from_account_data(self.bus.get_account_data(&key).await?)?;
        item.attempts = attempts;
        self.bus.set_account_data(&key, item.to_account_data()).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Relay recording deliveries; fails while `failing` is set
    #[derive(Default)]
    pub(crate) struct FakeRelay {
        pub failing: std::sync::atomic::AtomicBool,
        pub permanent: std::sync::atomic::AtomicBool,
        pub sent: Mutex<Vec<(String, String, String)>>,
    }

    impl FakeRelay {
        pub(crate) fn failing() -> Self {
            let relay = FakeRelay::default();
            relay.set_failing(true);
            relay
        }

        pub(crate) fn set_failing(&self, failing: bool) {
            self.failing
                .store(failing, std::sync::atomic::Ordering::SeqCst);
        }

        pub(crate) fn sent(&self) -> Vec<(String, String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Relay for FakeRelay {
        async fn relay(&self, from: &str, to: &str, data: &[u8]) -> Result<()> {
            use std::sync::atomic::Ordering;
            if self.permanent.load(Ordering::SeqCst) {
                return Err(GatewayError::SmtpReply {
                    code: 550,
                    message: "550 no such user".to_string(),
                });
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(GatewayError::SmtpReply {
                    code: 421,
                    message: "421 try later".to_string(),
                });
            }
            self.sent.lock().unwrap().push((
                from.to_string(),
                to.to_string(),
                String::from_utf8_lossy(data).into_owned(),
            ));
            Ok(())
        }
    }

    fn queue(bus: Arc<MemoryBus>, relay: Arc<FakeRelay>) -> DeliveryQueue {
        DeliveryQueue::new(bus, KeyLocks::new(), relay)
    }

    #[tokio::test]
    async fn test_enqueue_writes_item_and_index() {
        let bus = Arc::new(MemoryBus::new());
        let queue = queue(bus.clone(), Arc::new(FakeRelay::default()));

        queue
            .enqueue("m1", "a@example.com", "b@example.org", b"hello")
            .await
            .unwrap();

        assert_eq!(queue.len().await.unwrap(), 1);
        let item = bus.get_account_data("mailgate.queue.m1").await.unwrap();
        assert_eq!(item["from"], "a@example.com");
        assert_eq!(item["attempts"], "0");
        assert!(!item.contains_key("attemptedAt"));
    }

    #[tokio::test]
    async fn test_successful_cycle_dequeues() {
        let bus = Arc::new(MemoryBus::new());
        let relay = Arc::new(FakeRelay::default());
        let queue = queue(bus.clone(), relay.clone());
        queue
            .enqueue("m1", "a@example.com", "b@example.org", b"hello")
            .await
            .unwrap();

        let summary = queue.process_cycle(10, 100).await.unwrap();
        assert_eq!(summary.sent, 1);
        assert!(queue.is_empty().await.unwrap());
        assert_eq!(relay.sent().len(), 1);
        assert!(bus
            .get_account_data("mailgate.queue.m1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_failure_increments_attempts() {
        let bus = Arc::new(MemoryBus::new());
        let queue = queue(bus.clone(), Arc::new(FakeRelay::failing()));
        queue
            .enqueue("m1", "a@example.com", "b@example.org", b"hello")
            .await
            .unwrap();
        queue.set_attempts("m1", 5).await.unwrap();

        let summary = queue.process_cycle(1, 100).await.unwrap();
        assert_eq!(summary.retried, 1);

        let items = queue.items().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].attempts, 6);
        assert!(items[0].attempted_at.is_some());
    }

    #[tokio::test]
    async fn test_over_max_retries_dropped_without_sending() {
        let bus = Arc::new(MemoryBus::new());
        let relay = Arc::new(FakeRelay::default());
        let queue = queue(bus.clone(), relay.clone());
        queue
            .enqueue("m1", "a@example.com", "b@example.org", b"hello")
            .await
            .unwrap();
        queue.set_attempts("m1", 101).await.unwrap();

        let summary = queue.process_cycle(1, 100).await.unwrap();
        assert_eq!(summary.dropped, 1);
        assert!(relay.sent().is_empty());
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_cycle_visits_at_most_max_items() {
        let bus = Arc::new(MemoryBus::new());
        let relay = Arc::new(FakeRelay::default());
        let queue = queue(bus.clone(), relay.clone());
        for id in ["m1", "m2", "m3"] {
            queue
                .enqueue(id, "a@example.com", "b@example.org", b"hello")
                .await
                .unwrap();
        }

        let summary = queue.process_cycle(1, 100).await.unwrap();
        assert_eq!(summary.visited(), 1);
        assert_eq!(queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_entry_without_item_removed_from_index() {
        let bus = Arc::new(MemoryBus::new());
        let queue = queue(bus.clone(), Arc::new(FakeRelay::default()));
        let mut index = AccountData::new();
        index.insert("ghost".to_string(), "ghost".to_string());
        bus.set_account_data(QUEUE_KEY, index).await.unwrap();

        let summary = queue.process_cycle(10, 100).await.unwrap();
        assert_eq!(summary.visited(), 0);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_unreadable_item_skipped_and_kept() {
        let bus = Arc::new(MemoryBus::new());
        let queue = queue(bus.clone(), Arc::new(FakeRelay::default()));
        let mut broken = AccountData::new();
        broken.insert("id".to_string(), "broken".to_string());
        bus.set_account_data("mailgate.queue.broken", broken)
            .await
            .unwrap();
        let mut index = AccountData::new();
        index.insert("broken".to_string(), "broken".to_string());
        bus.set_account_data(QUEUE_KEY, index).await.unwrap();

        let summary = queue.process_cycle(10, 100).await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_item_does_not_block_others() {
        let bus = Arc::new(MemoryBus::new());
        let relay = Arc::new(FakeRelay::default());
        let queue = queue(bus.clone(), relay.clone());
        let mut broken = AccountData::new();
        broken.insert("id".to_string(), "a-broken".to_string());
        bus.set_account_data("mailgate.queue.a-broken", broken)
            .await
            .unwrap();
        let mut index = AccountData::new();
        index.insert("a-broken".to_string(), "a-broken".to_string());
        bus.set_account_data(QUEUE_KEY, index).await.unwrap();
        queue
            .enqueue("b-fine", "a@example.com", "b@example.org", b"hello")
            .await
            .unwrap();

        let summary = queue.process_cycle(1, 100).await.unwrap();
        assert_eq!(summary.sent, 1);
        assert_eq!(relay.sent().len(), 1);
    }

    /// Fails every message addressed to `stuck@example.org`
    struct SelectiveRelay {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Relay for SelectiveRelay {
        async fn relay(&self, _from: &str, to: &str, _data: &[u8]) -> Result<()> {
            if to == "stuck@example.org" {
                return Err(GatewayError::SmtpReply {
                    code: 421,
                    message: "421 try later".to_string(),
                });
            }
            self.sent.lock().unwrap().push(to.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failing_item_does_not_hold_up_the_queue() {
        let bus = Arc::new(MemoryBus::new());
        let relay = Arc::new(SelectiveRelay {
            sent: Mutex::new(Vec::new()),
        });
        let queue = DeliveryQueue::new(bus.clone(), KeyLocks::new(), relay.clone());
        queue
            .enqueue("a-stuck", "a@example.com", "stuck@example.org", b"hello")
            .await
            .unwrap();
        queue
            .enqueue("b-fine", "a@example.com", "fine@example.org", b"hello")
            .await
            .unwrap();

        let first = queue.process_cycle(1, 100).await.unwrap();
        assert_eq!(first.visited(), 1);
        let second = queue.process_cycle(1, 100).await.unwrap();
        assert_eq!(first.retried + second.retried, 1);
        assert_eq!(first.sent + second.sent, 1);

        assert_eq!(*relay.sent.lock().unwrap(), vec!["fine@example.org"]);
        let items = queue.items().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "a-stuck");
        assert_eq!(items[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_least_recently_attempted_goes_first() {
        let bus = Arc::new(MemoryBus::new());
        let queue = queue(bus.clone(), Arc::new(FakeRelay::failing()));
        for id in ["m1", "m2"] {
            queue
                .enqueue(id, "a@example.com", "b@example.org", b"hello")
                .await
                .unwrap();
        }

        for _ in 0..4 {
            queue.process_cycle(1, 100).await.unwrap();
        }

        let attempts: Vec<u32> = queue
            .items()
            .await
            .unwrap()
            .iter()
            .map(|item| item.attempts)
            .collect();
        assert_eq!(attempts, vec![2, 2]);
    }

    #[tokio::test]
    async fn test_dequeue() {
        let bus = Arc::new(MemoryBus::new());
        let queue = queue(bus.clone(), Arc::new(FakeRelay::default()));
        queue
            .enqueue("m1", "a@example.com", "b@example.org", b"hello")
            .await
            .unwrap();

        queue.dequeue("m1").await.unwrap();
        assert!(queue.is_empty().await.unwrap());
        assert!(queue.items().await.unwrap().is_empty());
    }
}
