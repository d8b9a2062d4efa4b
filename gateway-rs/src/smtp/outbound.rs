//! Authenticated session: a room's mailbox sending to the outside world

use crate::bus::RoomId;
use crate::error::{GatewayError, Result};
use crate::mime::{self, DkimKey};
use crate::smtp::backend::MailSession;
use crate::smtp::reply::{ReplyResult, SmtpReply};
use crate::utils::{address_valid, hostname, mailbox};
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Accepts composed messages for delivery to a remote recipient
#[async_trait]
pub trait Outbox: Send + Sync {
    /// `id` identifies the message/recipient pair if it ends up queued
    async fn send(&self, id: &str, from: &str, to: &str, data: Vec<u8>) -> Result<()>;
}

pub struct OutboundSession {
    peer: IpAddr,
    room: RoomId,
    mailbox: String,
    domains: Vec<String>,
    outbox: Arc<dyn Outbox>,
    dkim: Option<Arc<DkimKey>>,
    from: Option<String>,
    to: Vec<String>,
}

impl OutboundSession {
    pub fn new(
        peer: IpAddr,
        room: RoomId,
        mailbox: String,
        domains: Vec<String>,
        outbox: Arc<dyn Outbox>,
        dkim: Option<Arc<DkimKey>>,
    ) -> Self {
        Self {
            peer,
            room,
            mailbox,
            domains,
            outbox,
            dkim,
            from: None,
            to: Vec::new(),
        }
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    fn failure_reply(e: &GatewayError) -> SmtpReply {
        match e {
            GatewayError::SmtpReply { code, message } if *code >= 500 => {
                SmtpReply::rejected(message.clone())
            }
            _ => SmtpReply::local_error(),
        }
    }
}

#[async_trait]
impl MailSession for OutboundSession {
    async fn mail(&mut self, from: &str) -> ReplyResult {
        let domain = hostname(from).unwrap_or_default();
        if !address_valid(from)
            || mailbox(from) != self.mailbox
            || !self.domains.iter().any(|d| d.eq_ignore_ascii_case(&domain))
        {
            warn!(
                "{} authenticated as {} tried to send as {}",
                self.peer, self.mailbox, from
            );
            return Err(SmtpReply::sender_not_allowed());
        }

        self.from = Some(from.to_string());
        self.to.clear();
        Ok(())
    }

    async fn rcpt(&mut self, to: &str) -> ReplyResult {
        if !address_valid(to) {
            return Err(SmtpReply::no_user());
        }
        self.to.push(to.to_string());
        Ok(())
    }

    async fn data(&mut self, body: &[u8]) -> ReplyResult {
        let from = self.from.clone().ok_or_else(SmtpReply::bad_sequence)?;

        let mut email = mime::parse(body).map_err(|e| {
            warn!("Cannot parse outgoing message from {}: {}", self.room, e);
            SmtpReply::rejected("Cannot parse message")
        })?;
        if !email.from.eq_ignore_ascii_case(&from) {
            info!(
                "Room {} header sender {:?} replaced by {}",
                self.room, email.from, from
            );
            email.from = from.clone();
        }
        if email.message_id.is_empty() {
            let domain = hostname(&from).unwrap_or_default();
            email.message_id = mime::message_id(&Uuid::new_v4().simple().to_string(), &domain);
        }

        for rcpt in &self.to {
            let copy = email.for_recipient(rcpt);
            let data = mime::compose(&copy, self.dkim.as_deref())
                .ok_or_else(|| SmtpReply::rejected("Message has no body"))?;

            let id = format!("{}:{}", copy.message_id, rcpt);
            if let Err(e) = self.outbox.send(&id, &from, rcpt, data).await {
                error!("Sending {} to {} failed: {}", copy.message_id, rcpt, e);
                return Err(Self::failure_reply(&e));
            }
        }

        info!(
            "Room {} sent {} to {} recipient(s)",
            self.room,
            email.message_id,
            self.to.len()
        );
        Ok(())
    }

    fn reset(&mut self) {
        self.from = None;
        self.to.clear();
    }

    fn logout(&mut self) {
        info!("{} logged out of {}", self.peer, self.room);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingOutbox {
        sent: Mutex<Vec<(String, String, String, Vec<u8>)>>,
        fail_with: Option<u16>,
    }

    #[async_trait]
    impl Outbox for RecordingOutbox {
        async fn send(&self, id: &str, from: &str, to: &str, data: Vec<u8>) -> Result<()> {
            if let Some(code) = self.fail_with {
                return Err(GatewayError::SmtpReply {
                    code,
                    message: format!("{} refused", code),
                });
            }
            self.sent.lock().unwrap().push((
                id.to_string(),
                from.to_string(),
                to.to_string(),
                data,
            ));
            Ok(())
        }
    }

    fn session(outbox: Arc<RecordingOutbox>, dkim: Option<Arc<DkimKey>>) -> OutboundSession {
        OutboundSession::new(
            "127.0.0.1".parse().unwrap(),
            RoomId::new("!sales:chat.test"),
            "sales".to_string(),
            vec!["example.com".to_string()],
            outbox,
            dkim,
        )
    }

    const MESSAGE: &[u8] = b"From: sales@example.com\r\n\
To: client@remote.test\r\n\
Subject: Offer\r\n\
Message-ID: <offer-1@example.com>\r\n\
\r\n\
Hello there\r\n";

    #[tokio::test]
    async fn test_sender_must_be_own_mailbox() {
        let mut session = session(Arc::new(RecordingOutbox::default()), None);
        assert_eq!(
            session.mail("boss@example.com").await.unwrap_err().code,
            550
        );
        assert_eq!(
            session.mail("sales@elsewhere.test").await.unwrap_err().code,
            550
        );
        assert!(session.mail("Sales@example.com").await.is_ok());
    }

    #[tokio::test]
    async fn test_one_message_per_recipient() {
        let outbox = Arc::new(RecordingOutbox::default());
        let mut session = session(outbox.clone(), None);
        session.mail("sales@example.com").await.unwrap();
        session.rcpt("client@remote.test").await.unwrap();
        session.rcpt("other@remote.test").await.unwrap();
        session.data(MESSAGE).await.unwrap();

        let sent = outbox.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "<offer-1@example.com>:client@remote.test");
        assert_eq!(sent[1].2, "other@remote.test");
    }

    #[tokio::test]
    async fn test_signed_with_dkim() {
        let outbox = Arc::new(RecordingOutbox::default());
        let key = DkimKey::from_pem(crate::mime::dkim::tests::TEST_PRIVATE_KEY).unwrap();
        let mut session = session(outbox.clone(), Some(Arc::new(key)));
        session.mail("sales@example.com").await.unwrap();
        session.rcpt("client@remote.test").await.unwrap();
        session.data(MESSAGE).await.unwrap();

        let sent = outbox.sent.lock().unwrap();
        let text = String::from_utf8_lossy(&sent[0].3);
        assert!(text.starts_with("DKIM-Signature:"));
        assert!(text.contains("d=example.com"));
        assert!(text.contains("s=mailgate"));
    }

    #[tokio::test]
    async fn test_header_sender_replaced_by_mailbox() {
        let outbox = Arc::new(RecordingOutbox::default());
        let key = DkimKey::from_pem(crate::mime::dkim::tests::TEST_PRIVATE_KEY).unwrap();
        let mut session = session(outbox.clone(), Some(Arc::new(key)));
        session.mail("sales@example.com").await.unwrap();
        session.rcpt("client@remote.test").await.unwrap();
        session
            .data(b"From: ceo@bank.test\r\nTo: client@remote.test\r\nSubject: Wire\r\n\r\nPay now\r\n")
            .await
            .unwrap();

        let sent = outbox.sent.lock().unwrap();
        let text = String::from_utf8_lossy(&sent[0].3);
        assert!(text.contains("d=example.com"), "{}", text);
        assert!(!text.contains("bank.test"), "{}", text);
        assert!(text.contains("sales@example.com"));
    }

    #[tokio::test]
    async fn test_permanent_failure_replies_554() {
        let outbox = Arc::new(RecordingOutbox {
            fail_with: Some(550),
            ..Default::default()
        });
        let mut session = session(outbox, None);
        session.mail("sales@example.com").await.unwrap();
        session.rcpt("client@remote.test").await.unwrap();
        assert_eq!(session.data(MESSAGE).await.unwrap_err().code, 554);
    }

    #[tokio::test]
    async fn test_empty_body_rejected() {
        let mut session = session(Arc::new(RecordingOutbox::default()), None);
        session.mail("sales@example.com").await.unwrap();
        session.rcpt("client@remote.test").await.unwrap();
        let reply = session
            .data(b"From: sales@example.com\r\nTo: client@remote.test\r\nSubject: x\r\n\r\n")
            .await
            .unwrap_err();
        assert_eq!(reply.code, 554);
    }
}
