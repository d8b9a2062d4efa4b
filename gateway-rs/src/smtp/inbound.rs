//! Anonymous session: mail from the outside world to rooms

use crate::antispam::SpamDefense;
use crate::directory::Directory;
use crate::error::Result;
use crate::mime::{self, Email};
use crate::smtp::backend::MailSession;
use crate::smtp::reply::{ReplyResult, SmtpReply};
use crate::utils::{address_valid, hostname};
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Receives parsed inbound mail, one call per accepted recipient
#[async_trait]
pub trait IncomingMail: Send + Sync {
    async fn incoming(&self, email: Email) -> Result<()>;
}

pub struct InboundSession {
    peer: IpAddr,
    directory: Arc<Directory>,
    spam: Arc<SpamDefense>,
    incoming: Arc<dyn IncomingMail>,
    from: Option<String>,
    to: Vec<String>,
}

impl InboundSession {
    pub fn new(
        peer: IpAddr,
        directory: Arc<Directory>,
        spam: Arc<SpamDefense>,
        incoming: Arc<dyn IncomingMail>,
    ) -> Self {
        Self {
            peer,
            directory,
            spam,
            incoming,
            from: None,
            to: Vec::new(),
        }
    }
}

#[async_trait]
impl MailSession for InboundSession {
    async fn mail(&mut self, from: &str) -> ReplyResult {
        if !address_valid(from) {
            warn!("Invalid sender {:?} from {}", from, self.peer);
            self.spam.ban(&self.peer).await;
            return Err(SmtpReply::banned());
        }

        self.from = Some(from.to_string());
        self.to.clear();
        Ok(())
    }

    async fn rcpt(&mut self, to: &str) -> ReplyResult {
        let from = self.from.clone().ok_or_else(SmtpReply::bad_sequence)?;

        let served = hostname(to)
            .map(|domain| self.directory.serves_domain(&domain))
            .unwrap_or(false);
        if !served {
            info!("Refusing {}: domain not served", to);
            return Err(SmtpReply::no_user());
        }

        let room = match self.directory.resolve(to).await {
            Some(room) => room,
            None => {
                info!("Refusing {}: no such mailbox", to);
                return Err(SmtpReply::no_user());
            }
        };

        let settings = self.directory.settings(&room).await.map_err(|e| {
            error!("Cannot read settings of {}: {}", room, e);
            SmtpReply::local_error()
        })?;

        if self
            .spam
            .check_sender(&self.peer, &from, &settings.filter_options())
            .await
            .is_err()
        {
            return Err(SmtpReply::no_user());
        }

        self.to.push(to.to_string());
        Ok(())
    }

    async fn data(&mut self, body: &[u8]) -> ReplyResult {
        if self.spam.is_greylisted(&self.peer).await {
            info!("{} is greylisted", self.peer);
            return Err(SmtpReply::greylisted());
        }

        let email = mime::parse(body).map_err(|e| {
            warn!("Cannot parse message from {}: {}", self.peer, e);
            SmtpReply::rejected("Cannot parse message")
        })?;

        for rcpt in &self.to {
            if let Err(e) = self.incoming.incoming(email.for_recipient(rcpt)).await {
                error!("Delivery to {} failed: {}", rcpt, e);
                return Err(SmtpReply::local_error());
            }
        }

        info!(
            "Delivered {} from {} to {} recipient(s)",
            email.message_id,
            email.from,
            self.to.len()
        );
        Ok(())
    }

    fn reset(&mut self) {
        self.from = None;
        self.to.clear();
    }
}
