//! gateway-rs: email ↔ chat room gateway
//!
//! Each room can claim a mailbox on the served domains. Mail sent to
//! that mailbox shows up in the room, and the room can send mail back.
//!
//! # Features
//!
//! - **Inbound SMTP**: Anonymous delivery into rooms, with attachments and threading
//! - **Outbound SMTP**: Authenticated submission as a room mailbox, DKIM-signed
//! - **Delivery queue**: Transient failures are retried on an interval
//! - **Spam defense**: Banlist, greylist, trusted networks and per-room sender checks
//! - **Email transform**: MIME parsing and composition, HTML style stripping
//!
//! # Example
//!
//! ```no_run
//! use gateway_rs::bus::MemoryBus;
//! use gateway_rs::config::Config;
//! use gateway_rs::directory::Directory;
//! use gateway_rs::utils::KeyLocks;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let bus = Arc::new(MemoryBus::new());
//!     let directory = Directory::new(
//!         bus,
//!         KeyLocks::new(),
//!         &config.directory,
//!         config.server.domains.clone(),
//!     );
//!     directory.resync().await?;
//!     println!("{} mailboxes", directory.len().await);
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`antispam`]: Banlist, greylist and sender validation
//! - [`bridge`]: Email to room and room to email
//! - [`bus`]: Chat transport seam
//! - [`config`]: Configuration management
//! - [`directory`]: Mailbox to room mapping and room settings
//! - [`error`]: Error types and handling
//! - [`mime`]: Parsing, composition and DKIM
//! - [`security`]: TLS and authentication
//! - [`smtp`]: SMTP server, client and delivery queue
//! - [`tasks`]: Periodic background work
//! - [`utils`]: Utility functions (validation, DNS, locks)

pub mod antispam;
pub mod bridge;
pub mod bus;
pub mod config;
pub mod directory;
pub mod error;
pub mod mime;
pub mod security;
pub mod smtp;
pub mod tasks;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use error::{GatewayError, Result};
