//! SMTP AUTH support
//!
//! # Supported mechanisms
//! - PLAIN (RFC 4616)
//! - LOGIN (common but not standardized)
//!
//! Room passwords are stored as Argon2 PHC strings, never in clear.

use crate::error::{GatewayError, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// SMTP authentication mechanisms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    /// PLAIN mechanism (RFC 4616)
    Plain,
    /// LOGIN mechanism
    Login,
}

impl AuthMechanism {
    /// Parse mechanism from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        }
    }
}

/// Decode PLAIN authentication data
///
/// Format: `authzid\0username\0password` (base64 encoded)
pub fn decode_plain_auth(auth_data: &str) -> Result<(String, String)> {
    let decoded = BASE64
        .decode(auth_data.trim())
        .map_err(|e| GatewayError::SmtpProtocol(format!("Invalid base64: {}", e)))?;

    let text = std::str::from_utf8(&decoded)
        .map_err(|e| GatewayError::SmtpProtocol(format!("Invalid UTF-8: {}", e)))?;
    let parts: Vec<&str> = text.split('\0').collect();

    if parts.len() != 3 {
        return Err(GatewayError::SmtpProtocol(
            "Invalid PLAIN auth format".to_string(),
        ));
    }

    Ok((parts[1].to_string(), parts[2].to_string()))
}

/// Decode one LOGIN step (username or password)
pub fn decode_login_credential(credential: &str) -> Result<String> {
    let decoded = BASE64
        .decode(credential.trim())
        .map_err(|e| GatewayError::SmtpProtocol(format!("Invalid base64: {}", e)))?;

    String::from_utf8(decoded)
        .map_err(|e| GatewayError::SmtpProtocol(format!("Invalid UTF-8: {}", e)))
}

/// Hash password with Argon2
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);

    let password_hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| GatewayError::Config(format!("Failed to hash password: {}", e)))?;

    Ok(password_hash.to_string())
}

/// Check a password against a stored Argon2 hash. Malformed hashes never verify.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed_hash) = PasswordHash::new(stored_hash) else {
        return false;
    };

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}
