//! Outgoing delivery
//!
//! [`Relay`] hands one message to the next hop. [`MxRelay`] goes straight
//! to the recipient's MX hosts or through a configured smarthost.
//! [`Mailer`] is the direct-send [`Outbox`]: relay now, queue on a
//! transient failure.

use crate::config::RelayConfig;
use crate::error::{GatewayError, Result};
use crate::smtp::outbound::Outbox;
use crate::smtp::queue::DeliveryQueue;
use crate::smtp::SmtpClient;
use crate::utils::{dns::lookup_mx, hostname};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[async_trait]
pub trait Relay: Send + Sync {
    async fn relay(&self, from: &str, to: &str, data: &[u8]) -> Result<()>;
}

/// Relay over SMTP
pub struct MxRelay {
    smarthost: Option<RelayConfig>,
    timeout: Duration,
}

impl MxRelay {
    pub fn new(smarthost: Option<RelayConfig>, timeout: Duration) -> Self {
        Self { smarthost, timeout }
    }

    fn client(&self, server: String) -> SmtpClient {
        SmtpClient::new(server).with_timeout(self.timeout)
    }
}

#[async_trait]
impl Relay for MxRelay {
    async fn relay(&self, from: &str, to: &str, data: &[u8]) -> Result<()> {
        if let Some(smarthost) = &self.smarthost {
            let mut client = self.client(format!("{}:{}", smarthost.host, smarthost.port));
            if let (Some(username), Some(password)) = (&smarthost.username, &smarthost.password) {
                client = client.with_credentials(username.clone(), password.clone());
            }
            return client.send_mail(from, to, data).await;
        }

        let domain = hostname(to)
            .ok_or_else(|| GatewayError::InvalidEmail(format!("no domain in {}", to)))?;
        let servers = lookup_mx(&domain).await?;

        let mut last_error = None;
        for server in servers {
            info!("Trying to send via {}", server);
            match self.client(server.clone()).send_mail(from, to, data).await {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    warn!("Failed to send via {}: {}", server, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            GatewayError::SmtpProtocol(format!("no mail server for {}", domain))
        }))
    }
}

/// Send immediately, queue on transient failure
pub struct Mailer {
    relay: Arc<dyn Relay>,
    queue: Arc<DeliveryQueue>,
}

impl Mailer {
    pub fn new(relay: Arc<dyn Relay>, queue: Arc<DeliveryQueue>) -> Self {
        Self { relay, queue }
    }
}

#[async_trait]
impl Outbox for Mailer {
    async fn send(&self, id: &str, from: &str, to: &str, data: Vec<u8>) -> Result<()> {
        match self.relay.relay(from, to, &data).await {
            Ok(()) => {
                info!("Message {} sent to {}", id, to);
                Ok(())
            }
            Err(e) if e.is_transient() => {
                warn!("Cannot send {} to {} now, queueing: {}", id, to, e);
                self.queue.enqueue(id, from, to, &data).await
            }
            Err(e) => Err(e),
        }
    }
}
