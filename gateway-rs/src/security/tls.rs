//! TLS for SMTP
//!
//! Serves both the implicit-TLS listener and STARTTLS upgrades on the
//! plaintext listener.

use crate::error::{GatewayError, Result};
use rustls::ServerConfig;
use rustls_pemfile::{certs, read_all, Item};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// TLS configuration for SMTP
#[derive(Clone)]
pub struct TlsConfig {
    server_config: Arc<ServerConfig>,
}

impl TlsConfig {
    /// Create TLS config from certificate and key files
    ///
    /// The key may be PKCS#8, PKCS#1 or SEC1.
    pub fn from_pem_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        info!("Loading TLS certificate from {:?}", cert_path.as_ref());

        let cert_file = File::open(cert_path.as_ref())
            .map_err(|e| GatewayError::Tls(format!("Failed to open certificate file: {}", e)))?;
        let certs = certs(&mut BufReader::new(cert_file))
            .map_err(|e| GatewayError::Tls(format!("Failed to read certificates: {}", e)))?;

        if certs.is_empty() {
            return Err(GatewayError::Tls("No certificates found in file".to_string()));
        }
        debug!("Loaded {} certificate(s)", certs.len());

        let key_file = File::open(key_path.as_ref())
            .map_err(|e| GatewayError::Tls(format!("Failed to open key file: {}", e)))?;
        let private_key = read_all(&mut BufReader::new(key_file))
            .map_err(|e| GatewayError::Tls(format!("Failed to read private keys: {}", e)))?
            .into_iter()
            .find_map(|item| match item {
                Item::PKCS8Key(key) | Item::RSAKey(key) | Item::ECKey(key) => Some(key),
                _ => None,
            })
            .ok_or_else(|| GatewayError::Tls("No private key found in file".to_string()))?;

        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                certs.into_iter().map(rustls::Certificate).collect(),
                rustls::PrivateKey(private_key),
            )
            .map_err(|e| GatewayError::Tls(format!("Failed to create TLS config: {}", e)))?;

        Ok(Self {
            server_config: Arc::new(config),
        })
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.server_config.clone()
    }

    /// Acceptor upgrading a TcpStream to TLS
    pub fn acceptor(&self) -> tokio_rustls::TlsAcceptor {
        tokio_rustls::TlsAcceptor::from(self.server_config.clone())
    }
}
