//! SMTP gateway (RFC 5321)
//!
//! - [`server`]: plaintext and implicit-TLS accept loops
//! - [`session`]: connection handler and protocol state machine
//! - [`backend`]: session factory and the [`MailSession`] trait
//! - [`inbound`]: anonymous sessions delivering to rooms
//! - [`outbound`]: authenticated sessions sending for a room
//! - [`relay`]: next-hop delivery and the direct-send outbox
//! - [`queue`]: delivery queue with retry
//! - [`client`]: outgoing SMTP client
//! - [`commands`]: command parsing
//! - [`reply`]: reply codes

pub mod backend;
pub mod client;
pub mod commands;
pub mod inbound;
pub mod outbound;
pub mod queue;
pub mod relay;
pub mod reply;
pub mod server;
pub mod session;

pub use backend::{Backend, MailSession};
pub use client::SmtpClient;
pub use commands::SmtpCommand;
pub use inbound::{InboundSession, IncomingMail};
pub use outbound::{OutboundSession, Outbox};
pub use queue::{CycleSummary, DeliveryQueue, QueueItem, QUEUE_KEY};
pub use relay::{Mailer, MxRelay, Relay};
pub use reply::{ReplyResult, SmtpReply};
pub use server::SmtpServer;
pub use session::{SessionConfig, SmtpSession};
