use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// RFC 1123 with numeric zone
pub const DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S %z";

pub fn email_date<Tz: TimeZone>(date: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    date.format(DATE_FORMAT).to_string()
}

pub fn now() -> String {
    email_date(&Utc::now())
}

/// Message-Id for mail originating from a room event: `<event@domain>`
pub fn message_id(event_id: &str, domain: &str) -> String {
    format!("<{}@{}>", event_id, domain)
}

/// Email attachment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl File {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            data,
        }
    }
}

/// Canonical email
///
/// Message ids keep their angle brackets. `references` is space separated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Email {
    pub message_id: String,
    pub in_reply_to: String,
    pub references: String,
    pub date: String,
    pub from: String,
    pub to: String,
    /// Envelope recipient of this delivery, may differ from `to`
    pub rcpt_to: String,
    pub cc: Vec<String>,
    pub subject: String,
    pub text: String,
    pub html: String,
    pub files: Vec<File>,
}

impl Email {
    /// Email originating from a room, dated now
    pub fn new(
        message_id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let to = to.into();
        Self {
            message_id: message_id.into(),
            date: now(),
            from: from.into(),
            rcpt_to: to.clone(),
            to,
            subject: subject.into(),
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = super::strip_styles(&html.into());
        self
    }

    pub fn with_reply(mut self, in_reply_to: impl Into<String>, references: impl Into<String>) -> Self {
        self.in_reply_to = in_reply_to.into();
        self.references = references.into();
        self
    }

    pub fn with_files(mut self, files: Vec<File>) -> Self {
        self.files = files;
        self
    }

    /// Copy addressed to a single envelope recipient
    pub fn for_recipient(&self, rcpt_to: &str) -> Self {
        Self {
            rcpt_to: rcpt_to.to_string(),
            ..self.clone()
        }
    }

    /// Whether there is a body worth composing
    pub fn has_body(&self) -> bool {
        !self.text.is_empty() || !self.html.is_empty()
    }

    /// Message ids this email refers to, most specific first
    pub fn thread_candidates(&self) -> Vec<&str> {
        let mut ids = Vec::new();
        if !self.in_reply_to.is_empty() {
            ids.push(self.in_reply_to.as_str());
        }
        ids.extend(self.references.split_whitespace().rev());
        ids
    }
}
