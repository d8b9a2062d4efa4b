//! Email ↔ room bridge
//!
//! Inbound mail becomes room messages, threaded by In-Reply-To and
//! References. Room-originated mail is composed, signed and handed to the
//! outbox.

use crate::bus::{AccountData, EventId, MessageBus, RoomId};
use crate::directory::Directory;
use crate::error::{GatewayError, Result};
use crate::mime::{self, DkimKey, Email, File};
use crate::smtp::{IncomingMail, Outbox};
use crate::utils::address_valid;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Room account data key prefix mapping a Message-ID to its thread root
pub const THREAD_KEY_PREFIX: &str = "mailgate.thread.";

const EVENT_ID: &str = "event_id";

fn thread_key(message_id: &str) -> String {
    format!("{}{}", THREAD_KEY_PREFIX, message_id)
}

/// Mail written in a room
#[derive(Debug, Clone, Default)]
pub struct RoomEmail {
    /// Comma-separated recipients
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
    pub in_reply_to: String,
    pub references: String,
    pub files: Vec<File>,
}

pub struct Bridge {
    bus: Arc<dyn MessageBus>,
    directory: Arc<Directory>,
    outbox: Arc<dyn Outbox>,
    dkim: Option<Arc<DkimKey>>,
}

impl Bridge {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        directory: Arc<Directory>,
        outbox: Arc<dyn Outbox>,
        dkim: Option<Arc<DkimKey>>,
    ) -> Self {
        Self {
            bus,
            directory,
            outbox,
            dkim,
        }
    }

    /// Thread root of the first known message this email refers to
    pub async fn thread_root(&self, room: &RoomId, email: &Email) -> Option<EventId> {
        for message_id in email.thread_candidates() {
            match self
                .bus
                .get_room_account_data(room, &thread_key(message_id))
                .await
            {
                Ok(data) => {
                    if let Some(event) = data.get(EVENT_ID).filter(|id| !id.is_empty()) {
                        return Some(EventId::new(event.clone()));
                    }
                }
                Err(e) => warn!("Cannot read thread of {}: {}", message_id, e),
            }
        }
        None
    }

    async fn remember_thread(&self, room: &RoomId, message_id: &str, root: &EventId) -> Result<()> {
        if message_id.is_empty() {
            return Ok(());
        }
        let mut data = AccountData::new();
        data.insert(EVENT_ID.to_string(), root.to_string());
        self.bus
            .set_room_account_data(room, &thread_key(message_id), data)
            .await
    }

    /// Send mail written in `room` as `event_id`
    ///
    /// Returns the Message-ID of the sent email.
    pub async fn send_from_room(
        &self,
        room: &RoomId,
        event_id: &EventId,
        mail: RoomEmail,
    ) -> Result<String> {
        let settings = self.directory.settings(room).await?;
        if settings.no_send() {
            return Err(GatewayError::Forbidden(format!("{} may not send mail", room)));
        }
        if settings.mailbox().is_empty() {
            return Err(GatewayError::Forbidden(format!("{} has no mailbox", room)));
        }

        let domain = self
            .directory
            .domains()
            .first()
            .cloned()
            .ok_or_else(|| GatewayError::Config("no domain configured".to_string()))?;
        let from = format!("{}@{}", settings.mailbox(), domain);
        let message_id = mime::message_id(event_id.as_str(), &domain);

        let recipients: Vec<&str> = mail
            .to
            .split(',')
            .map(str::trim)
            .filter(|rcpt| !rcpt.is_empty())
            .collect();
        if recipients.is_empty() || recipients.iter().any(|rcpt| !address_valid(rcpt)) {
            return Err(GatewayError::InvalidEmail(mail.to.clone()));
        }

        let email = Email::new(
            message_id.clone(),
            from.clone(),
            recipients.join(", "),
            mail.subject,
            mail.text,
        )
        .with_html(mail.html)
        .with_reply(mail.in_reply_to, mail.references)
        .with_files(mail.files);

        for rcpt in &recipients {
            let data = mime::compose(&email.for_recipient(rcpt), self.dkim.as_deref())
                .ok_or_else(|| GatewayError::Parse("nothing to send".to_string()))?;
            self.outbox
                .send(&format!("{}:{}", message_id, rcpt), &from, rcpt, data)
                .await?;
        }

        let root = self
            .thread_root(room, &email)
            .await
            .unwrap_or_else(|| event_id.clone());
        self.remember_thread(room, &message_id, &root).await?;

        info!("Room {} sent {} to {}", room, message_id, mail.to);
        Ok(message_id)
    }
}

#[async_trait]
impl IncomingMail for Bridge {
    async fn incoming(&self, email: Email) -> Result<()> {
        let room = self
            .directory
            .resolve(&email.rcpt_to)
            .await
            .ok_or_else(|| GatewayError::NotFound(format!("mailbox {}", email.rcpt_to)))?;
        let settings = self.directory.settings(&room).await?;
        let options = settings.content_options();

        let thread = if options.threads {
            self.thread_root(&room, &email).await
        } else {
            None
        };

        let event = self
            .bus
            .send_message(&room, email.content(thread.as_ref(), &options))
            .await?;
        debug!("Email {} posted to {} as {}", email.message_id, room, event);

        let root = thread.unwrap_or_else(|| event.clone());
        if let Err(e) = self.remember_thread(&room, &email.message_id, &root).await {
            warn!("Cannot remember thread of {}: {}", email.message_id, e);
        }

        if settings.no_files() {
            return Ok(());
        }
        let file_thread = options.threads.then_some(&root);
        for file in &email.files {
            self.bus.send_file(&room, file, file_thread).await?;
        }

        Ok(())
    }
}
