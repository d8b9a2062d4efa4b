use crate::antispam::FilterOptions;
use crate::bus::AccountData;
use crate::error::{GatewayError, Result};
use crate::mime::ContentOptions;
use crate::security::hash_password;
use std::collections::HashMap;

/// Room account data key holding the settings map
pub const SETTINGS_KEY: &str = "mailgate.settings";

pub const OWNER: &str = "owner";
pub const MAILBOX: &str = "mailbox";
pub const PASSWORD: &str = "password";
pub const NO_SEND: &str = "nosend";
pub const NO_SENDER: &str = "nosender";
pub const NO_RECIPIENT: &str = "norecipient";
pub const NO_SUBJECT: &str = "nosubject";
pub const NO_HTML: &str = "nohtml";
pub const NO_THREADS: &str = "nothreads";
pub const NO_FILES: &str = "nofiles";
pub const SPAMCHECK_SMTP: &str = "spamcheck:smtp";
pub const SPAMCHECK_MX: &str = "spamcheck:mx";
pub const SPAMLIST_EMAILS: &str = "spamlist:emails";
pub const SPAMLIST_HOSTS: &str = "spamlist:hosts";
pub const SPAMLIST_MAILBOXES: &str = "spamlist:mailboxes";

/// Every option a room may set
pub const KNOWN_KEYS: [&str; 15] = [
    OWNER,
    MAILBOX,
    PASSWORD,
    NO_SEND,
    NO_SENDER,
    NO_RECIPIENT,
    NO_SUBJECT,
    NO_HTML,
    NO_THREADS,
    NO_FILES,
    SPAMCHECK_SMTP,
    SPAMCHECK_MX,
    SPAMLIST_EMAILS,
    SPAMLIST_HOSTS,
    SPAMLIST_MAILBOXES,
];

/// Per-room settings
///
/// Flat map with trimmed, lower-cased keys. Values are kept as given
/// except for list options, which are normalized on write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomSettings {
    values: HashMap<String, String>,
}

fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

fn is_list(key: &str) -> bool {
    key.starts_with("spamlist:")
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(|item| item.trim().to_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

impl RoomSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_account_data(data: AccountData) -> Self {
        let mut settings = Self::new();
        for (key, value) in data {
            settings.set(&key, &value);
        }
        settings
    }

    pub fn to_account_data(&self) -> AccountData {
        self.values.clone()
    }

    pub fn get(&self, key: &str) -> &str {
        self.values
            .get(&normalize_key(key))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Store a raw value; empty values remove the key
    pub fn set(&mut self, key: &str, value: &str) {
        let key = normalize_key(key);
        let value = if is_list(&key) {
            split_list(value).join(",")
        } else {
            value.trim().to_string()
        };

        if value.is_empty() {
            self.values.remove(&key);
        } else {
            self.values.insert(key, value);
        }
    }

    pub fn bool(&self, key: &str) -> bool {
        matches!(
            self.get(key).to_lowercase().as_str(),
            "true" | "yes" | "1" | "on"
        )
    }

    pub fn list(&self, key: &str) -> Vec<String> {
        split_list(self.get(key))
    }

    pub fn owner(&self) -> &str {
        self.get(OWNER)
    }

    pub fn mailbox(&self) -> &str {
        self.get(MAILBOX)
    }

    pub fn password_hash(&self) -> &str {
        self.get(PASSWORD)
    }

    /// Hash and store a password; an empty password clears it
    pub fn set_password(&mut self, password: &str) -> Result<()> {
        if password.is_empty() {
            self.values.remove(PASSWORD);
            return Ok(());
        }
        let hash = hash_password(password)?;
        self.values.insert(PASSWORD.to_string(), hash);
        Ok(())
    }

    pub fn no_send(&self) -> bool {
        self.bool(NO_SEND)
    }

    pub fn no_files(&self) -> bool {
        self.bool(NO_FILES)
    }

    pub fn no_threads(&self) -> bool {
        self.bool(NO_THREADS)
    }

    pub fn content_options(&self) -> ContentOptions {
        ContentOptions {
            sender: !self.bool(NO_SENDER),
            recipient: !self.bool(NO_RECIPIENT),
            subject: !self.bool(NO_SUBJECT),
            html: !self.bool(NO_HTML),
            threads: !self.bool(NO_THREADS),
        }
    }

    pub fn filter_options(&self) -> FilterOptions {
        FilterOptions {
            check_mx: self.bool(SPAMCHECK_MX),
            check_smtp: self.bool(SPAMCHECK_SMTP),
            spamlist_emails: self.list(SPAMLIST_EMAILS),
            spamlist_hosts: self.list(SPAMLIST_HOSTS),
            spamlist_mailboxes: self.list(SPAMLIST_MAILBOXES),
        }
    }
}

/// Reject option names the gateway does not know
pub fn check_key(key: &str) -> Result<String> {
    let key = normalize_key(key);
    if KNOWN_KEYS.contains(&key.as_str()) {
        Ok(key)
    } else {
        Err(GatewayError::NotFound(format!("unknown option {}", key)))
    }
}
