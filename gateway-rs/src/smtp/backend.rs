//! Session factory
//!
//! The connection handler owns the wire protocol; what a transaction
//! means is decided by a [`MailSession`] obtained from the [`Backend`]:
//! an anonymous inbound session at connect, swapped for an outbound one
//! after a successful AUTH.

use crate::antispam::SpamDefense;
use crate::directory::Directory;
use crate::mime::DkimKey;
use crate::smtp::inbound::{InboundSession, IncomingMail};
use crate::smtp::outbound::{OutboundSession, Outbox};
use crate::smtp::reply::{ReplyResult, SmtpReply};
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// Transaction semantics of one SMTP connection
#[async_trait]
pub trait MailSession: Send {
    async fn mail(&mut self, from: &str) -> ReplyResult;

    async fn rcpt(&mut self, to: &str) -> ReplyResult;

    async fn data(&mut self, body: &[u8]) -> ReplyResult;

    fn reset(&mut self);

    fn logout(&mut self) {}
}

/// Everything a session may need, shared by all connections
#[derive(Clone)]
pub struct Backend {
    directory: Arc<Directory>,
    spam: Arc<SpamDefense>,
    incoming: Arc<dyn IncomingMail>,
    outbox: Arc<dyn Outbox>,
    dkim: Option<Arc<DkimKey>>,
}

impl Backend {
    pub fn new(
        directory: Arc<Directory>,
        spam: Arc<SpamDefense>,
        incoming: Arc<dyn IncomingMail>,
        outbox: Arc<dyn Outbox>,
        dkim: Option<Arc<DkimKey>>,
    ) -> Self {
        Self {
            directory,
            spam,
            incoming,
            outbox,
            dkim,
        }
    }

    pub fn spam(&self) -> &Arc<SpamDefense> {
        &self.spam
    }

    pub fn anonymous_login(&self, peer: IpAddr) -> Box<dyn MailSession> {
        Box::new(InboundSession::new(
            peer,
            self.directory.clone(),
            self.spam.clone(),
            self.incoming.clone(),
        ))
    }

    /// Authenticate a room mailbox
    ///
    /// Failures ban the peer and do not say whether the user or the
    /// password was wrong.
    pub async fn login(
        &self,
        peer: IpAddr,
        username: &str,
        password: &str,
    ) -> ReplyResult<Box<dyn MailSession>> {
        let Some(room) = self.directory.allow_auth(username, password).await else {
            warn!("Authentication of {} from {} failed", username, peer);
            self.spam.ban(&peer).await;
            return Err(SmtpReply::banned());
        };

        let mailbox = crate::utils::mailbox(username);
        info!("{} authenticated as {} ({})", peer, mailbox, room);
        Ok(Box::new(OutboundSession::new(
            peer,
            room,
            mailbox,
            self.directory.domains().to_vec(),
            self.outbox.clone(),
            self.dkim.clone(),
        )))
    }
}
