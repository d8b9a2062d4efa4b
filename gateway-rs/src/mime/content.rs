use super::types::Email;
use crate::bus::{EventId, RoomMessage};
use std::collections::BTreeMap;

pub const HEADER_MESSAGE_ID: &str = "mailgate.message_id";
pub const HEADER_IN_REPLY_TO: &str = "mailgate.in_reply_to";
pub const HEADER_SUBJECT: &str = "mailgate.subject";
pub const HEADER_FROM: &str = "mailgate.from";
pub const HEADER_TO: &str = "mailgate.to";
pub const HEADER_RCPT_TO: &str = "mailgate.rcpt_to";

/// Which parts of an email end up in the room message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentOptions {
    pub sender: bool,
    pub recipient: bool,
    pub subject: bool,
    pub html: bool,
    pub threads: bool,
}

impl Default for ContentOptions {
    fn default() -> Self {
        Self {
            sender: true,
            recipient: true,
            subject: true,
            html: true,
            threads: true,
        }
    }
}

impl Email {
    /// Render as a room message, replying in `thread` when threads are enabled
    pub fn content(&self, thread: Option<&EventId>, options: &ContentOptions) -> RoomMessage {
        let thread = thread.filter(|_| options.threads);
        let mut body = String::new();

        if options.sender {
            body.push_str(&self.from);
        }
        if options.recipient {
            body.push_str(" ➡️ ");
            body.push_str(&self.rcpt_to);
        }
        if options.sender || options.recipient {
            body.push_str("\n\n");
        }
        if options.subject && thread.is_none() && !self.subject.is_empty() {
            body.push_str("# ");
            body.push_str(&self.subject);
            body.push_str("\n\n");
        }
        if options.html && !self.html.is_empty() {
            body.push_str(&self.html);
        } else {
            body.push_str(&self.text);
        }

        let mut headers = BTreeMap::new();
        headers.insert(HEADER_MESSAGE_ID.to_string(), self.message_id.clone());
        headers.insert(HEADER_IN_REPLY_TO.to_string(), self.in_reply_to.clone());
        headers.insert(HEADER_SUBJECT.to_string(), self.subject.clone());
        headers.insert(HEADER_FROM.to_string(), self.from.clone());
        headers.insert(HEADER_TO.to_string(), self.to.clone());
        headers.insert(HEADER_RCPT_TO.to_string(), self.rcpt_to.clone());

        RoomMessage {
            body,
            headers,
            thread: thread.cloned(),
        }
    }
}
