use super::records::AddressRecords;
use crate::bus::MessageBus;
use crate::error::Result;
use crate::utils::KeyLocks;
use chrono::Utc;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// Account data key of the banlist
pub const BANLIST_KEY: &str = "mailgate.banlist";

/// Remote addresses refused at connect time
pub struct Banlist {
    enabled: bool,
    records: AddressRecords,
}

impl Banlist {
    pub fn new(enabled: bool, bus: Arc<dyn MessageBus>, locks: KeyLocks) -> Self {
        Banlist {
            enabled,
            records: AddressRecords::new(BANLIST_KEY, bus, locks),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub async fn load(&self) -> Result<usize> {
        if !self.enabled {
            return Ok(0);
        }
        self.records.load().await
    }

    pub async fn contains(&self, ip: &IpAddr) -> bool {
        self.enabled && self.records.get(ip).await.is_some()
    }

    pub async fn ban(&self, ip: IpAddr) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        warn!("Banning {}", ip);
        self.records.insert(ip, Utc::now()).await
    }

    pub async fn unban(&self, ip: &IpAddr) -> Result<bool> {
        let removed = self.records.remove(ip).await?;
        if removed {
            info!("Unbanned {}", ip);
        }
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<()> {
        info!("Clearing banlist");
        self.records.clear().await
    }

    pub async fn len(&self) -> usize {
        self.records.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
