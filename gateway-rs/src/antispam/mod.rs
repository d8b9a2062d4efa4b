//! Spam defense
//!
//! Per-address state for the SMTP listeners:
//! - Banlist: addresses refused at connect time
//! - Greylist: new addresses asked to retry later
//! - Trusted networks: exempt from both
//!
//! Sender validation against a room's [`FilterOptions`] lives in
//! [`validator`]; any failure there escalates to a ban.

pub mod banlist;
pub mod greylist;
mod records;
pub mod types;
pub mod validator;

pub use banlist::{Banlist, BANLIST_KEY};
pub use greylist::{Greylist, GreylistConfig, GREYLIST_KEY};
pub use types::{any_match, FilterOptions, ListEntry, ValidationFailure};
pub use validator::{AddressValidator, DnsProbe, MailProbe};

use crate::bus::MessageBus;
use crate::config::AntispamConfig;
use crate::error::{GatewayError, Result};
use crate::utils::KeyLocks;
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Ban, greylist and trust decisions for remote addresses
pub struct SpamDefense {
    trusted: Vec<IpNet>,
    banlist: Banlist,
    greylist: Greylist,
    validator: AddressValidator,
}

impl SpamDefense {
    pub fn new(
        config: &AntispamConfig,
        bus: Arc<dyn MessageBus>,
        locks: KeyLocks,
        probe: Arc<dyn MailProbe>,
    ) -> Result<Self> {
        let trusted = config
            .trusted
            .iter()
            .map(|net| {
                net.parse::<IpNet>()
                    .or_else(|_| net.parse::<IpAddr>().map(IpNet::from))
                    .map_err(|e| GatewayError::Config(format!("trusted network {}: {}", net, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let greylist = GreylistConfig {
            duration: chrono::Duration::minutes(config.greylist_minutes.max(0)),
            cleanup_after: chrono::Duration::days(config.cleanup_days.max(1)),
        };

        Ok(SpamDefense {
            trusted,
            banlist: Banlist::new(config.banlist_enabled, bus.clone(), locks.clone()),
            greylist: Greylist::new(greylist, bus, locks),
            validator: AddressValidator::new(probe),
        })
    }

    /// Read persisted ban and greylist state
    pub async fn load(&self) -> Result<()> {
        let banned = self.banlist.load().await?;
        let greylisted = self.greylist.load().await?;
        info!(
            "Spam defense loaded: {} banned, {} greylisted",
            banned, greylisted
        );
        Ok(())
    }

    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.trusted.iter().any(|net| net.contains(ip))
    }

    pub async fn is_banned(&self, ip: &IpAddr) -> bool {
        !self.is_trusted(ip) && self.banlist.contains(ip).await
    }

    /// Whether `ip` must retry later; the first sighting is recorded
    pub async fn is_greylisted(&self, ip: &IpAddr) -> bool {
        !self.is_trusted(ip) && self.greylist.check(ip).await
    }

    /// Ban `ip` unless it is trusted. Persistence failures are logged.
    pub async fn ban(&self, ip: &IpAddr) {
        if self.is_trusted(ip) {
            info!("Not banning trusted address {}", ip);
            return;
        }
        if let Err(e) = self.banlist.ban(*ip).await {
            error!("Cannot persist ban of {}: {}", ip, e);
        }
    }

    pub async fn unban(&self, ip: &IpAddr) -> Result<bool> {
        self.banlist.unban(ip).await
    }

    pub async fn clear_banlist(&self) -> Result<()> {
        self.banlist.clear().await
    }

    /// Drop stale greylist entries
    pub async fn cleanup(&self) -> Result<usize> {
        let removed = self.greylist.cleanup().await?;
        if removed > 0 {
            info!("Removed {} stale greylist entries", removed);
        }
        Ok(removed)
    }

    /// Validate a sender; on failure `ip` is banned
    pub async fn check_sender(
        &self,
        ip: &IpAddr,
        from: &str,
        options: &FilterOptions,
    ) -> std::result::Result<(), ValidationFailure> {
        match self.validator.validate(from, options).await {
            Ok(()) => Ok(()),
            Err(failure) => {
                warn!("Sender {} from {} refused: {}", from, ip, failure);
                self.ban(ip).await;
                Err(failure)
            }
        }
    }

    pub fn banlist(&self) -> &Banlist {
        &self.banlist
    }

    pub fn greylist(&self) -> &Greylist {
        &self.greylist
    }
}

#[cfg(test)]
mod tests {
    use super::validator::tests::FakeProbe;
    use super::*;
    use crate::bus::MemoryBus;

    fn config(greylist_minutes: i64) -> AntispamConfig {
        AntispamConfig {
            banlist_enabled: true,
            greylist_minutes,
            trusted: vec!["10.0.0.0/8".to_string(), "::1".to_string()],
            cleanup_days: 30,
        }
    }

    fn defense(greylist_minutes: i64) -> SpamDefense {
        SpamDefense::new(
            &config(greylist_minutes),
            Arc::new(MemoryBus::new()),
            KeyLocks::new(),
            Arc::new(FakeProbe::default()),
        )
        .unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_trusted_networks() {
        let defense = defense(5);
        assert!(defense.is_trusted(&ip("10.1.2.3")));
        assert!(defense.is_trusted(&ip("::1")));
        assert!(!defense.is_trusted(&ip("192.0.2.1")));
    }

    #[tokio::test]
    async fn test_trusted_never_banned_or_greylisted() {
        let defense = defense(5);
        defense.ban(&ip("10.1.2.3")).await;
        assert!(!defense.is_banned(&ip("10.1.2.3")).await);
        assert!(!defense.is_greylisted(&ip("10.1.2.3")).await);
        assert!(defense.banlist().is_empty().await);
    }

    #[tokio::test]
    async fn test_ban_lifecycle() {
        let defense = defense(0);
        defense.ban(&ip("192.0.2.1")).await;
        defense.ban(&ip("192.0.2.2")).await;
        assert!(defense.is_banned(&ip("192.0.2.1")).await);

        assert!(defense.unban(&ip("192.0.2.1")).await.unwrap());
        assert!(!defense.is_banned(&ip("192.0.2.1")).await);

        defense.clear_banlist().await.unwrap();
        assert!(!defense.is_banned(&ip("192.0.2.2")).await);
    }

    #[tokio::test]
    async fn test_greylist_first_sight() {
        let defense = defense(5);
        assert!(defense.is_greylisted(&ip("192.0.2.1")).await);
        assert!(defense.is_greylisted(&ip("192.0.2.1")).await);
        assert!(!defense_disabled_greylist().await);
    }

    async fn defense_disabled_greylist() -> bool {
        defense(0).is_greylisted(&ip("192.0.2.1")).await
    }

    #[tokio::test]
    async fn test_failed_sender_check_bans() {
        let defense = defense(0);
        let options = FilterOptions {
            spamlist_hosts: vec!["spam.example".to_string()],
            ..Default::default()
        };

        let result = defense
            .check_sender(&ip("192.0.2.9"), "bulk@spam.example", &options)
            .await;
        assert!(matches!(result, Err(ValidationFailure::SpamlistHost(_))));
        assert!(defense.is_banned(&ip("192.0.2.9")).await);

        assert!(defense
            .check_sender(&ip("192.0.2.10"), "friend@ok.example", &options)
            .await
            .is_ok());
        assert!(!defense.is_banned(&ip("192.0.2.10")).await);
    }

    #[test]
    fn test_invalid_trusted_network() {
        let mut config = config(0);
        config.trusted = vec!["not a network".to_string()];
        let result = SpamDefense::new(
            &config,
            Arc::new(MemoryBus::new()),
            KeyLocks::new(),
            Arc::new(FakeProbe::default()),
        );
        assert!(result.is_err());
    }
}
