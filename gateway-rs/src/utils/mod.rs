//! Utility modules
//!
//! - [`dns`]: MX lookups
//! - [`email`]: Address validation and splitting
//! - [`locks`]: Per-key advisory locks

pub mod dns;
pub mod email;
pub mod locks;

pub use email::{address_valid, hostname, mailbox, validate_email};
pub use locks::KeyLocks;
