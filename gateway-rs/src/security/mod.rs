//! Security module
//!
//! - [`auth`]: SMTP AUTH decoding and room password hashing
//! - [`tls`]: TLS acceptor for the implicit-TLS listener and STARTTLS

pub mod auth;
pub mod tls;

pub use auth::{
    decode_login_credential, decode_plain_auth, hash_password, verify_password, AuthMechanism,
};
pub use tls::TlsConfig;
