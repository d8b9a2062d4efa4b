use crate::error::Result;
use crate::security::TlsConfig;
use crate::smtp::backend::Backend;
use crate::smtp::session::{SessionConfig, SmtpSession};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Accept loops for the plaintext and implicit-TLS listeners
#[derive(Clone)]
pub struct SmtpServer {
    config: Arc<SessionConfig>,
    backend: Backend,
    tls: Option<Arc<TlsConfig>>,
}

impl SmtpServer {
    pub fn new(config: SessionConfig, backend: Backend, tls: Option<Arc<TlsConfig>>) -> Self {
        Self {
            config: Arc::new(config),
            backend,
            tls,
        }
    }

    /// Serve plaintext SMTP (with STARTTLS when TLS is configured)
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    debug!("New SMTP connection from {}", addr);

                    let session = SmtpSession::new(
                        self.config.clone(),
                        self.backend.clone(),
                        self.tls.clone(),
                        addr.ip(),
                    );

                    tokio::spawn(async move {
                        if let Err(e) = session.handle(socket).await {
                            error!("Session error with {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Serve implicit TLS
    pub async fn serve_tls(&self, listener: TcpListener) -> Result<()> {
        let Some(tls) = self.tls.clone() else {
            warn!("TLS listener started without TLS configuration");
            return Ok(());
        };

        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    debug!("New SMTP TLS connection from {}", addr);

                    let session = SmtpSession::new(
                        self.config.clone(),
                        self.backend.clone(),
                        self.tls.clone(),
                        addr.ip(),
                    );
                    let acceptor = tls.acceptor();
                    let handshake_timeout = self.config.read_timeout;

                    tokio::spawn(async move {
                        let stream = match timeout(handshake_timeout, acceptor.accept(socket)).await {
                            Ok(Ok(stream)) => stream,
                            Ok(Err(e)) => {
                                warn!("TLS handshake with {} failed: {}", addr, e);
                                return;
                            }
                            Err(_) => {
                                warn!("TLS handshake with {} timed out", addr);
                                return;
                            }
                        };
                        if let Err(e) = session.handle_tls(stream).await {
                            error!("Session error with {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept TLS connection: {}", e);
                }
            }
        }
    }
}
