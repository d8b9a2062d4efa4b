use super::records::AddressRecords;
use crate::bus::MessageBus;
use crate::error::Result;
use crate::utils::KeyLocks;
use chrono::{Duration, Utc};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, info};

/// Account data key of the greylist
pub const GREYLIST_KEY: &str = "mailgate.greylist";

/// Greylist configuration
#[derive(Debug, Clone)]
pub struct GreylistConfig {
    /// How long a new address is asked to retry later; zero disables greylisting
    pub duration: Duration,
    /// Entries first seen longer ago than this are forgotten
    pub cleanup_after: Duration,
}

impl Default for GreylistConfig {
    fn default() -> Self {
        GreylistConfig {
            duration: Duration::minutes(5),
            cleanup_after: Duration::days(30),
        }
    }
}

/// Greylist keyed by remote address
///
/// The first time an address shows up it is recorded and greylisted. It
/// stays greylisted until `duration` has passed since that first sighting.
pub struct Greylist {
    config: GreylistConfig,
    records: AddressRecords,
}

impl Greylist {
    pub fn new(config: GreylistConfig, bus: Arc<dyn MessageBus>, locks: KeyLocks) -> Self {
        Greylist {
            config,
            records: AddressRecords::new(GREYLIST_KEY, bus, locks),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.duration > Duration::zero()
    }

    pub async fn load(&self) -> Result<usize> {
        self.records.load().await
    }

    /// Whether `ip` must retry later. Records unknown addresses.
    pub async fn check(&self, ip: &IpAddr) -> bool {
        if !self.enabled() {
            return false;
        }

        let now = Utc::now();
        match self.records.get(ip).await {
            Some(first_seen) => first_seen + self.config.duration > now,
            None => {
                info!("Greylisting {}", ip);
                if let Err(e) = self.records.insert(*ip, now).await {
                    error!("Cannot persist greylist entry for {}: {}", ip, e);
                }
                true
            }
        }
    }

    /// Forget old entries
    pub async fn cleanup(&self) -> Result<usize> {
        let cutoff = Utc::now() - self.config.cleanup_after;
        self.records.retain_newer(cutoff).await
    }

    pub async fn entry_count(&self) -> usize {
        self.records.len().await
    }

    /// Record `ip` as first seen at `at`
    pub async fn record(&self, ip: IpAddr, at: chrono::DateTime<Utc>) -> Result<()> {
        self.records.insert(ip, at).await
    }
}
