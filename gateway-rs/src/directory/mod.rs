//! Mailbox directory
//!
//! Maps mailbox names to rooms. Room settings persisted on the bus are the
//! source of truth; the in-memory map is a cache rebuilt by [`Directory::resync`].

pub mod settings;

use crate::bus::{MessageBus, RoomId};
use crate::config::DirectoryConfig;
use crate::error::{GatewayError, Result};
use crate::security::verify_password;
use crate::utils::{hostname, mailbox, validate_email, KeyLocks};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

pub use settings::{RoomSettings, SETTINGS_KEY};

pub struct Directory {
    bus: Arc<dyn MessageBus>,
    locks: KeyLocks,
    mailboxes: RwLock<HashMap<String, RoomId>>,
    claims: Mutex<()>,
    domains: Vec<String>,
    no_owner: bool,
    reserved: Vec<String>,
}

fn settings_lock_key(room: &RoomId) -> String {
    format!("{}/{}", room, SETTINGS_KEY)
}

fn valid_mailbox_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+'))
        && !name.starts_with('.')
        && !name.ends_with('.')
}

impl Directory {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        locks: KeyLocks,
        config: &DirectoryConfig,
        domains: Vec<String>,
    ) -> Self {
        Self {
            bus,
            locks,
            mailboxes: RwLock::new(HashMap::new()),
            claims: Mutex::new(()),
            domains: domains.into_iter().map(|d| d.trim().to_lowercase()).collect(),
            no_owner: config.no_owner,
            reserved: config
                .reserved
                .iter()
                .map(|name| mailbox(name))
                .collect(),
        }
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn serves_domain(&self, domain: &str) -> bool {
        let domain = domain.trim().to_lowercase();
        self.domains.iter().any(|d| *d == domain)
    }

    /// Room holding `name` (a mailbox or a full address)
    pub async fn resolve(&self, name: &str) -> Option<RoomId> {
        self.mailboxes.read().await.get(&mailbox(name)).cloned()
    }

    pub async fn mailbox_of(&self, room: &RoomId) -> Option<String> {
        self.mailboxes
            .read()
            .await
            .iter()
            .find(|(_, holder)| *holder == room)
            .map(|(name, _)| name.clone())
    }

    pub async fn len(&self) -> usize {
        self.mailboxes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.mailboxes.read().await.is_empty()
    }

    pub async fn settings(&self, room: &RoomId) -> Result<RoomSettings> {
        let data = self.bus.get_room_account_data(room, SETTINGS_KEY).await?;
        Ok(RoomSettings::from_account_data(data))
    }

    /// Assign `name` to `room` on behalf of `requester`
    ///
    /// Fails when another room holds the name, when the name is reserved or
    /// invalid, or when `requester` does not own the room. The first claim
    /// of a room makes the requester its owner.
    pub async fn claim(&self, room: &RoomId, name: &str, requester: &str) -> Result<()> {
        let name = mailbox(name);
        if !valid_mailbox_name(&name) {
            return Err(GatewayError::InvalidEmail(format!(
                "invalid mailbox name {:?}",
                name
            )));
        }
        if self.reserved.contains(&name) {
            return Err(GatewayError::MailboxReserved(name));
        }

        let _claim = self.claims.lock().await;

        if let Some(holder) = self.resolve(&name).await {
            if &holder != room {
                warn!("{} tried to claim {} held by {}", room, name, holder);
                return Err(GatewayError::MailboxTaken(name));
            }
        }

        let _settings_lock = self.locks.lock(&settings_lock_key(room)).await;
        let mut settings = self.settings(room).await?;

        let owner = settings.owner().to_string();
        if !self.no_owner && !owner.is_empty() && owner != requester {
            return Err(GatewayError::Forbidden(format!(
                "{} is not the owner of {}",
                requester, room
            )));
        }
        if owner.is_empty() {
            settings.set(settings::OWNER, requester);
        }

        let previous = settings.mailbox().to_string();
        settings.set(settings::MAILBOX, &name);
        self.bus
            .set_room_account_data(room, SETTINGS_KEY, settings.to_account_data())
            .await?;

        let mut mailboxes = self.mailboxes.write().await;
        if !previous.is_empty() && previous != name && mailboxes.get(&previous) == Some(room) {
            mailboxes.remove(&previous);
            info!("Released mailbox {} of {}", previous, room);
        }
        mailboxes.insert(name.clone(), room.clone());

        info!("Mailbox {} assigned to {}", name, room);
        Ok(())
    }

    /// Change one room option on behalf of `requester`
    pub async fn set_option(
        &self,
        room: &RoomId,
        requester: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let key = settings::check_key(key)?;
        if key == settings::MAILBOX {
            return self.claim(room, value, requester).await;
        }

        let _settings_lock = self.locks.lock(&settings_lock_key(room)).await;
        let mut settings = self.settings(room).await?;

        let owner = settings.owner();
        if !self.no_owner && !owner.is_empty() && owner != requester {
            return Err(GatewayError::Forbidden(format!(
                "{} is not the owner of {}",
                requester, room
            )));
        }

        if key == settings::PASSWORD {
            settings.set_password(value)?;
        } else {
            settings.set(&key, value);
        }

        self.bus
            .set_room_account_data(room, SETTINGS_KEY, settings.to_account_data())
            .await?;
        debug!("Option {} of {} updated", key, room);
        Ok(())
    }

    /// Forget the mailbox of a room the gateway no longer participates in
    pub async fn release(&self, room: &RoomId) -> Result<()> {
        let _claim = self.claims.lock().await;
        let _settings_lock = self.locks.lock(&settings_lock_key(room)).await;
        let mut settings = self.settings(room).await?;
        let name = settings.mailbox().to_string();

        if !name.is_empty() {
            settings.set(settings::MAILBOX, "");
            self.bus
                .set_room_account_data(room, SETTINGS_KEY, settings.to_account_data())
                .await?;
        }

        let mut mailboxes = self.mailboxes.write().await;
        mailboxes.retain(|_, holder| holder != room);
        info!("Released mailboxes of {}", room);
        Ok(())
    }

    /// Rebuild the mailbox map from the settings of every joined room
    ///
    /// A room whose settings cannot be read keeps its cached mailbox.
    /// Claims wait until the new map is in place.
    pub async fn resync(&self) -> Result<usize> {
        let _claim = self.claims.lock().await;
        let rooms = self.bus.joined_rooms().await?;
        let previous = self.mailboxes.read().await.clone();
        let mut rebuilt: HashMap<String, RoomId> = HashMap::new();

        for room in rooms {
            let name = match self.settings(&room).await {
                Ok(settings) => mailbox(settings.mailbox()),
                Err(e) => {
                    error!("Cannot read settings of {}: {}", room, e);
                    previous
                        .iter()
                        .find(|(_, holder)| **holder == room)
                        .map(|(name, _)| name.clone())
                        .unwrap_or_default()
                }
            };

            if name.is_empty() {
                continue;
            }

            if let Some(holder) = rebuilt.get(&name) {
                warn!("Mailbox {} claimed by both {} and {}, keeping {}", name, holder, room, holder);
                continue;
            }
            rebuilt.insert(name, room);
        }

        let count = rebuilt.len();
        *self.mailboxes.write().await = rebuilt;
        info!("Directory resynced: {} mailboxes", count);
        Ok(count)
    }

    /// Room an SMTP login may send as, if the credentials are right
    ///
    /// The username is `mailbox@served-domain`. Rooms that forbid sending or
    /// have no password never authenticate.
    pub async fn allow_auth(&self, username: &str, password: &str) -> Option<RoomId> {
        if validate_email(username).is_err() {
            return None;
        }
        let domain = hostname(username)?;
        if !self.serves_domain(&domain) {
            return None;
        }

        let room = self.resolve(username).await?;
        let settings = match self.settings(&room).await {
            Ok(settings) => settings,
            Err(e) => {
                error!("Cannot read settings of {}: {}", room, e);
                return None;
            }
        };

        if settings.no_send() || settings.password_hash().is_empty() {
            return None;
        }

        if verify_password(password, settings.password_hash()) {
            Some(room)
        } else {
            None
        }
    }
}
