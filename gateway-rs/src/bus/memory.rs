use super::{AccountData, EventId, MessageBus, RoomId, RoomMessage};
use crate::error::{GatewayError, Result};
use crate::mime::File;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// What a room received
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEvent {
    Message {
        id: EventId,
        message: RoomMessage,
    },
    File {
        id: EventId,
        name: String,
        content_type: String,
        size: usize,
        thread: Option<EventId>,
    },
}

impl TimelineEvent {
    pub fn id(&self) -> &EventId {
        match self {
            TimelineEvent::Message { id, .. } | TimelineEvent::File { id, .. } => id,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    account_data: HashMap<String, AccountData>,
    room_account_data: HashMap<String, HashMap<String, AccountData>>,
    rooms: BTreeSet<RoomId>,
}

/// In-process message bus
///
/// Account data survives restarts when a state file is configured. Room
/// timelines are kept in memory only.
pub struct MemoryBus {
    state: RwLock<Snapshot>,
    timelines: RwLock<HashMap<RoomId, Vec<TimelineEvent>>>,
    state_path: Option<PathBuf>,
    fail_writes: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Snapshot::default()),
            timelines: RwLock::new(HashMap::new()),
            state_path: None,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Open a bus persisted to `path`, loading existing state if present
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let snapshot = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No state file at {:?}, starting empty", path);
                Snapshot::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            state: RwLock::new(snapshot),
            timelines: RwLock::new(HashMap::new()),
            state_path: Some(path),
            fail_writes: AtomicBool::new(false),
        })
    }

    pub async fn join(&self, room: &RoomId) -> Result<()> {
        let mut state = self.state.write().await;
        state.rooms.insert(room.clone());
        self.persist(&state).await
    }

    pub async fn leave(&self, room: &RoomId) -> Result<()> {
        let mut state = self.state.write().await;
        state.rooms.remove(room);
        self.persist(&state).await
    }

    /// Events delivered to a room, oldest first
    pub async fn timeline(&self, room: &RoomId) -> Vec<TimelineEvent> {
        self.timelines
            .read()
            .await
            .get(room)
            .cloned()
            .unwrap_or_default()
    }

    /// Make every subsequent account data write fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(GatewayError::Store("account data is read-only".to_string()));
        }
        Ok(())
    }

    async fn persist(&self, state: &Snapshot) -> Result<()> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };

        let raw = serde_json::to_vec_pretty(state)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!("Persisted state to {:?}", path);
        Ok(())
    }

    async fn push(&self, room: &RoomId, event: TimelineEvent) {
        self.timelines
            .write()
            .await
            .entry(room.clone())
            .or_default()
            .push(event);
    }

    fn next_event_id() -> EventId {
        EventId::new(format!("${}", Uuid::new_v4().simple()))
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn get_room_account_data(&self, room: &RoomId, key: &str) -> Result<AccountData> {
        let state = self.state.read().await;
        Ok(state
            .room_account_data
            .get(room.as_str())
            .and_then(|data| data.get(key))
            .cloned()
            .unwrap_or_default())
    }

    async fn set_room_account_data(
        &self,
        room: &RoomId,
        key: &str,
        data: AccountData,
    ) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        state
            .room_account_data
            .entry(room.as_str().to_string())
            .or_default()
            .insert(key.to_string(), data);
        self.persist(&state).await
    }

    async fn get_account_data(&self, key: &str) -> Result<AccountData> {
        let state = self.state.read().await;
        Ok(state.account_data.get(key).cloned().unwrap_or_default())
    }

    async fn set_account_data(&self, key: &str, data: AccountData) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        state.account_data.insert(key.to_string(), data);
        self.persist(&state).await
    }

    async fn send_message(&self, room: &RoomId, message: RoomMessage) -> Result<EventId> {
        let id = Self::next_event_id();
        debug!("Sending message {} to {}", id, room);
        self.push(
            room,
            TimelineEvent::Message {
                id: id.clone(),
                message,
            },
        )
        .await;
        Ok(id)
    }

    async fn send_file(
        &self,
        room: &RoomId,
        file: &File,
        thread: Option<&EventId>,
    ) -> Result<EventId> {
        let id = Self::next_event_id();
        debug!("Sending file {} ({}) to {}", file.name, id, room);
        self.push(
            room,
            TimelineEvent::File {
                id: id.clone(),
                name: file.name.clone(),
                content_type: file.content_type.clone(),
                size: file.data.len(),
                thread: thread.cloned(),
            },
        )
        .await;
        Ok(id)
    }

    async fn joined_rooms(&self) -> Result<Vec<RoomId>> {
        Ok(self.state.read().await.rooms.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_account_data_round_trip() {
        let bus = MemoryBus::new();
        let room = RoomId::new("!room:test");

        assert!(bus.get_room_account_data(&room, "k").await.unwrap().is_empty());

        let mut data = AccountData::new();
        data.insert("mailbox".to_string(), "sales".to_string());
        bus.set_room_account_data(&room, "k", data.clone()).await.unwrap();

        assert_eq!(bus.get_room_account_data(&room, "k").await.unwrap(), data);
        assert!(bus.get_account_data("k").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let bus = MemoryBus::new();
        bus.set_fail_writes(true);
        let result = bus.set_account_data("k", AccountData::new()).await;
        assert!(matches!(result, Err(GatewayError::Store(_))));
    }

    #[tokio::test]
    async fn test_state_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let room = RoomId::new("!persisted:test");

        {
            let bus = MemoryBus::open(&path).await.unwrap();
            bus.join(&room).await.unwrap();
            let mut data = AccountData::new();
            data.insert("1".to_string(), "mailgate.queue.1".to_string());
            bus.set_account_data("mailgate.queue", data).await.unwrap();
        }

        let bus = MemoryBus::open(&path).await.unwrap();
        assert_eq!(bus.joined_rooms().await.unwrap(), vec![room]);
        let index = bus.get_account_data("mailgate.queue").await.unwrap();
        assert_eq!(index.get("1").map(String::as_str), Some("mailgate.queue.1"));
    }

    #[tokio::test]
    async fn test_timeline_records_messages_and_files() {
        let bus = MemoryBus::new();
        let room = RoomId::new("!room:test");

        let root = bus
            .send_message(
                &room,
                RoomMessage {
                    body: "hello".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let file = File::new("a.txt", "text/plain", b"abc".to_vec());
        bus.send_file(&room, &file, Some(&root)).await.unwrap();

        let timeline = bus.timeline(&room).await;
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0].id(), &root);
        match &timeline[1] {
            TimelineEvent::File { name, size, thread, .. } => {
                assert_eq!(name, "a.txt");
                assert_eq!(*size, 3);
                assert_eq!(thread.as_ref(), Some(&root));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
