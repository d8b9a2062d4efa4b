//! Sender address validation
//!
//! Checks run cheapest first: syntax, spamlists, then the optional DNS
//! and SMTP probes against the sender's own domain.

use super::types::{any_match, FilterOptions, ValidationFailure};
use crate::error::Result;
use crate::smtp::SmtpClient;
use crate::utils::{address_valid, dns, hostname, mailbox};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Network lookups used by sender validation
#[async_trait]
pub trait MailProbe: Send + Sync {
    /// MX hosts of `domain`, most preferred first
    async fn mx_hosts(&self, domain: &str) -> Result<Vec<String>>;

    /// Whether the SMTP server at `mx_host` accepts `email` as a recipient
    async fn smtp_probe(&self, mx_host: &str, email: &str) -> Result<bool>;
}

/// Probe backed by the system resolver and plain SMTP on port 25
pub struct DnsProbe {
    timeout: Duration,
}

impl DnsProbe {
    pub fn new(timeout: Duration) -> Self {
        DnsProbe { timeout }
    }
}

impl Default for DnsProbe {
    fn default() -> Self {
        DnsProbe::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl MailProbe for DnsProbe {
    async fn mx_hosts(&self, domain: &str) -> Result<Vec<String>> {
        dns::mx_hosts(domain).await
    }

    async fn smtp_probe(&self, mx_host: &str, email: &str) -> Result<bool> {
        SmtpClient::new(format!("{}:25", mx_host))
            .with_timeout(self.timeout)
            .probe_recipient(email)
            .await
    }
}

/// Validates sender addresses against a room's filter options
#[derive(Clone)]
pub struct AddressValidator {
    probe: Arc<dyn MailProbe>,
}

impl AddressValidator {
    pub fn new(probe: Arc<dyn MailProbe>) -> Self {
        AddressValidator { probe }
    }

    pub async fn validate(
        &self,
        from: &str,
        options: &FilterOptions,
    ) -> std::result::Result<(), ValidationFailure> {
        if !address_valid(from) {
            return Err(ValidationFailure::Syntax(from.to_string()));
        }

        let host = hostname(from).unwrap_or_default();
        let local = mailbox(from);

        if any_match(&options.spamlist_emails, from) {
            return Err(ValidationFailure::SpamlistEmail(from.to_string()));
        }
        if any_match(&options.spamlist_hosts, &host) {
            return Err(ValidationFailure::SpamlistHost(host));
        }
        if any_match(&options.spamlist_mailboxes, &local) {
            return Err(ValidationFailure::SpamlistMailbox(local));
        }

        if !options.needs_dns() {
            return Ok(());
        }

        let hosts = match self.probe.mx_hosts(&host).await {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!("MX lookup for {} failed: {}", host, e);
                Vec::new()
            }
        };
        if hosts.is_empty() {
            return Err(ValidationFailure::NoMx(host));
        }

        if !options.check_smtp {
            return Ok(());
        }

        for mx in &hosts {
            match self.probe.smtp_probe(mx, from).await {
                Ok(true) => {
                    debug!("{} accepted {}", mx, from);
                    return Ok(());
                }
                Ok(false) => debug!("{} refused {}", mx, from),
                Err(e) => debug!("Probe of {} failed: {}", mx, e),
            }
        }

        Err(ValidationFailure::SmtpProbe(host))
    }
}
