//! Message bus seam
//!
//! The chat transport is an external collaborator. The gateway only needs
//! account data storage, room sends and the list of joined rooms:
//! - [`MessageBus`]: the capability consumed by every component
//! - [`memory`]: in-process implementation with optional JSON persistence

pub mod memory;

use crate::error::Result;
use crate::mime::File;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

pub use memory::{MemoryBus, TimelineEvent};

/// Flat string map stored under an account data key
pub type AccountData = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomId(String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl EventId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A text message posted into a room
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomMessage {
    /// Markdown body
    pub body: String,
    /// Email headers carried as event metadata
    pub headers: BTreeMap<String, String>,
    /// Thread root this message replies to
    pub thread: Option<EventId>,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn get_room_account_data(&self, room: &RoomId, key: &str) -> Result<AccountData>;

    async fn set_room_account_data(
        &self,
        room: &RoomId,
        key: &str,
        data: AccountData,
    ) -> Result<()>;

    /// Process-scoped account data
    async fn get_account_data(&self, key: &str) -> Result<AccountData>;

    async fn set_account_data(&self, key: &str, data: AccountData) -> Result<()>;

    async fn send_message(&self, room: &RoomId, message: RoomMessage) -> Result<EventId>;

    async fn send_file(
        &self,
        room: &RoomId,
        file: &File,
        thread: Option<&EventId>,
    ) -> Result<EventId>;

    async fn joined_rooms(&self) -> Result<Vec<RoomId>>;
}
