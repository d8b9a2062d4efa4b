use crate::error::{GatewayError, Result};
use mail_auth::common::crypto::{RsaKey, Sha256};
use mail_auth::common::headers::HeaderWriter;
use mail_auth::dkim::DkimSigner;
use std::path::Path;
use tracing::{debug, info};

/// Selector published for every signing domain
pub const DKIM_SELECTOR: &str = "mailgate";

const SIGNED_HEADERS: [&str; 8] = [
    "From",
    "To",
    "Cc",
    "Subject",
    "Date",
    "Message-ID",
    "In-Reply-To",
    "References",
];

/// RSA private key used to sign outgoing mail
#[derive(Clone)]
pub struct DkimKey {
    pem: String,
}

impl std::fmt::Debug for DkimKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DkimKey(..)")
    }
}

impl DkimKey {
    /// Accepts PKCS#8 or PKCS#1 PEM
    pub fn from_pem(pem: impl Into<String>) -> Result<Self> {
        let key = Self { pem: pem.into() };
        key.rsa_key()?;
        Ok(key)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        info!("Loading DKIM key from {:?}", path.as_ref());
        let pem = std::fs::read_to_string(path.as_ref())?;
        Self::from_pem(pem)
    }

    fn rsa_key(&self) -> Result<RsaKey<Sha256>> {
        RsaKey::<Sha256>::from_pkcs8_pem(&self.pem)
            .or_else(|_| RsaKey::<Sha256>::from_rsa_pem(&self.pem))
            .map_err(|e| GatewayError::Dkim(format!("Failed to load RSA key: {}", e)))
    }

    /// Sign `message` for `domain` and return it with the `DKIM-Signature`
    /// header prepended
    pub fn sign(&self, message: &[u8], domain: &str) -> Result<Vec<u8>> {
        let signature = DkimSigner::from_key(self.rsa_key()?)
            .domain(domain)
            .selector(DKIM_SELECTOR)
            .headers(SIGNED_HEADERS)
            .sign(message)
            .map_err(|e| GatewayError::Dkim(format!("DKIM signing failed: {}", e)))?;

        debug!("Signed message for {} (selector {})", domain, DKIM_SELECTOR);

        let header = signature.to_header();
        let mut signed = Vec::with_capacity(header.len() + message.len());
        signed.extend_from_slice(header.as_bytes());
        signed.extend_from_slice(message);
        Ok(signed)
    }
}
