use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SMTP protocol error: {0}")]
    SmtpProtocol(String),

    /// Reply received from a remote SMTP server that was not the expected one
    #[error("SMTP server replied {code}: {message}")]
    SmtpReply { code: u16, message: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Invalid email address: {0}")]
    InvalidEmail(String),

    #[error("Mailbox {0} is already taken")]
    MailboxTaken(String),

    #[error("Mailbox {0} is reserved")]
    MailboxReserved(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("DNS lookup failed: {0}")]
    DnsLookup(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("DKIM error: {0}")]
    Dkim(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    /// Whether a failed relay attempt is worth retrying later.
    ///
    /// 5xx replies are permanent; everything network-shaped is transient.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::SmtpReply { code, .. } => *code < 500,
            GatewayError::Io(_)
            | GatewayError::Timeout(_)
            | GatewayError::DnsLookup(_)
            | GatewayError::SmtpProtocol(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
