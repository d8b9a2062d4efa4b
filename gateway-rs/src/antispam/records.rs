use crate::bus::{AccountData, MessageBus};
use crate::error::Result;
use crate::mime::{email_date, DATE_FORMAT};
use crate::utils::KeyLocks;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// IP address → timestamp map cached in memory and persisted as account data
pub(crate) struct AddressRecords {
    key: &'static str,
    bus: Arc<dyn MessageBus>,
    locks: KeyLocks,
    entries: RwLock<HashMap<IpAddr, DateTime<Utc>>>,
}

impl AddressRecords {
    pub(crate) fn new(key: &'static str, bus: Arc<dyn MessageBus>, locks: KeyLocks) -> Self {
        Self {
            key,
            bus,
            locks,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the cache with the persisted records
    pub(crate) async fn load(&self) -> Result<usize> {
        let _guard = self.locks.lock(self.key).await;
        let data = self.bus.get_account_data(self.key).await?;

        let mut loaded = HashMap::new();
        for (addr, at) in data {
            let Ok(ip) = addr.parse::<IpAddr>() else {
                warn!("Ignoring invalid address {:?} in {}", addr, self.key);
                continue;
            };
            let at = DateTime::parse_from_str(&at, DATE_FORMAT)
                .map(|at| at.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            loaded.insert(ip, at);
        }

        let count = loaded.len();
        *self.entries.write().await = loaded;
        debug!("Loaded {} records from {}", count, self.key);
        Ok(count)
    }

    pub(crate) async fn get(&self, ip: &IpAddr) -> Option<DateTime<Utc>> {
        self.entries.read().await.get(ip).copied()
    }

    pub(crate) async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Record `ip` unless it is already known
    pub(crate) async fn insert(&self, ip: IpAddr, at: DateTime<Utc>) -> Result<()> {
        let _guard = self.locks.lock(self.key).await;
        let mut entries = self.entries.write().await;
        if entries.contains_key(&ip) {
            return Ok(());
        }
        entries.insert(ip, at);
        self.persist(&entries).await
    }

    pub(crate) async fn remove(&self, ip: &IpAddr) -> Result<bool> {
        let _guard = self.locks.lock(self.key).await;
        let mut entries = self.entries.write().await;
        if entries.remove(ip).is_none() {
            return Ok(false);
        }
        self.persist(&entries).await?;
        Ok(true)
    }

    pub(crate) async fn clear(&self) -> Result<()> {
        let _guard = self.locks.lock(self.key).await;
        let mut entries = self.entries.write().await;
        entries.clear();
        self.persist(&entries).await
    }

    /// Keep records recorded after `cutoff`; returns how many were dropped
    pub(crate) async fn retain_newer(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let _guard = self.locks.lock(self.key).await;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, at| *at > cutoff);
        let removed = before - entries.len();
        if removed > 0 {
            self.persist(&entries).await?;
        }
        Ok(removed)
    }

    async fn persist(&self, entries: &HashMap<IpAddr, DateTime<Utc>>) -> Result<()> {
        let data: AccountData = entries
            .iter()
            .map(|(ip, at)| (ip.to_string(), email_date(at)))
            .collect();
        self.bus.set_account_data(self.key, data).await
    }
}
