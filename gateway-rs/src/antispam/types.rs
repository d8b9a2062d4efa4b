use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-room sender filtering, read from room settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterOptions {
    /// Sender domain must publish an MX record
    pub check_mx: bool,
    /// Sender mailbox must be accepted by its own MX
    pub check_smtp: bool,
    /// Sender addresses to refuse (`*` wildcards, `@domain` shorthand)
    pub spamlist_emails: Vec<String>,
    /// Sender hosts to refuse
    pub spamlist_hosts: Vec<String>,
    /// Sender local parts to refuse
    pub spamlist_mailboxes: Vec<String>,
}

impl FilterOptions {
    pub fn needs_dns(&self) -> bool {
        self.check_mx || self.check_smtp
    }
}

/// Why a sender was refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    #[error("invalid address syntax: {0}")]
    Syntax(String),

    #[error("sender {0} is spamlisted")]
    SpamlistEmail(String),

    #[error("sender host {0} is spamlisted")]
    SpamlistHost(String),

    #[error("sender mailbox {0} is spamlisted")]
    SpamlistMailbox(String),

    #[error("no MX record for {0}")]
    NoMx(String),

    #[error("no MX of {0} accepted the sender")]
    SmtpProbe(String),
}

/// Spamlist pattern
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListEntry {
    /// Pattern to match: exact value, `@domain`, or with `*` wildcards
    pub pattern: String,
    /// When this entry was added
    pub added_at: DateTime<Utc>,
}

impl ListEntry {
    pub fn new(pattern: impl Into<String>) -> Self {
        ListEntry {
            pattern: pattern.into().trim().to_lowercase(),
            added_at: Utc::now(),
        }
    }

    /// Check if this entry matches a value (address, host or local part)
    pub fn matches(&self, value: &str) -> bool {
        let value = value.trim().to_lowercase();
        if self.pattern.is_empty() {
            return false;
        }

        if self.pattern == value {
            return true;
        }

        // Domain match (e.g., "@example.com" matches "user@example.com")
        if self.pattern.starts_with('@') && !self.pattern.contains('*') {
            if let Some((_, domain)) = value.rsplit_once('@') {
                return format!("@{}", domain) == self.pattern;
            }
            return false;
        }

        if self.pattern.contains('*') {
            let expression = format!(
                "^{}$",
                regex::escape(&self.pattern).replace(r"\*", ".*")
            );
            return Regex::new(&expression)
                .map(|re| re.is_match(&value))
                .unwrap_or(false);
        }

        false
    }
}

/// Whether any of `patterns` matches `value`
pub fn any_match(patterns: &[String], value: &str) -> bool {
    patterns
        .iter()
        .any(|pattern| ListEntry::new(pattern.as_str()).matches(value))
}
