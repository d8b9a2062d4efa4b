//! Gateway configuration
//!
//! Loaded from an optional TOML file, then overridden by `MAILGATE__SECTION__KEY`
//! environment variables (for example `MAILGATE__SMTP__LISTEN_ADDR=0.0.0.0:2525`).

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "MAILGATE";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub smtp: SmtpConfig,
    /// Optional smarthost; when absent mail goes straight to the recipient's MX
    pub relay: Option<RelayConfig>,
    pub dkim: DkimConfig,
    pub queue: QueueConfig,
    pub directory: DirectoryConfig,
    pub antispam: AntispamConfig,
    pub store: StoreConfig,
    /// Mailboxes claimed at startup
    pub mailboxes: Vec<MailboxSeed>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Served domains, the first one is used for room-originated mail
    pub domains: Vec<String>,
    pub hostname: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub listen_addr: String,
    /// Implicit-TLS listener, only started when certificates are configured
    pub tls_listen_addr: Option<String>,
    /// PEM certificate chain
    pub tls_cert_path: Option<String>,
    /// PEM private key
    pub tls_key_path: Option<String>,
    pub require_tls: bool,
    pub max_message_size_mb: usize,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    pub host: String,
    #[serde(default = "default_relay_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DkimConfig {
    /// PEM private key (PKCS#8 or PKCS#1)
    pub private_key_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Items visited per processing cycle
    pub max_items: usize,
    /// Attempts allowed before an item is dropped
    pub max_retries: u32,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Skip owner checks on mailbox claims
    pub no_owner: bool,
    /// Mailbox names nobody may claim
    pub reserved: Vec<String>,
    pub resync_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AntispamConfig {
    pub banlist_enabled: bool,
    /// Greylist duration; 0 disables greylisting
    pub greylist_minutes: i64,
    /// Networks in CIDR notation that are never banned nor greylisted
    pub trusted: Vec<String>,
    /// Greylist entries older than this are forgotten
    pub cleanup_days: i64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON file holding account data between restarts
    pub state_path: Option<String>,
    /// Rooms the gateway participates in
    pub rooms: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MailboxSeed {
    pub room: String,
    pub mailbox: String,
    pub owner: String,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" or "json"
    pub format: String,
}

fn default_relay_port() -> u16 {
    25
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            domains: vec!["localhost".to_string()],
            hostname: "localhost".to_string(),
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:2525".to_string(),
            tls_listen_addr: None,
            tls_cert_path: None,
            tls_key_path: None,
            require_tls: false,
            max_message_size_mb: 25,
            read_timeout_secs: 10,
            write_timeout_secs: 10,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_items: 1,
            max_retries: 100,
            interval_secs: 60,
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            no_owner: false,
            reserved: vec!["postmaster".to_string(), "abuse".to_string()],
            resync_interval_secs: 300,
        }
    }
}

impl Default for AntispamConfig {
    fn default() -> Self {
        Self {
            banlist_enabled: true,
            greylist_minutes: 0,
            trusted: Vec::new(),
            cleanup_days: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| GatewayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.domains.iter().all(|d| d.trim().is_empty()) {
            return Err(GatewayError::Config(
                "at least one served domain is required".to_string(),
            ));
        }

        if self.smtp.tls_cert_path.is_some() != self.smtp.tls_key_path.is_some() {
            return Err(GatewayError::Config(
                "tls_cert_path and tls_key_path must be set together".to_string(),
            ));
        }

        for network in &self.antispam.trusted {
            network.parse::<ipnet::IpNet>().map_err(|e| {
                GatewayError::Config(format!("invalid trusted network {}: {}", network, e))
            })?;
        }

        if self.smtp.max_message_size_mb == 0 {
            return Err(GatewayError::Config(
                "max_message_size_mb must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Domain used for mail sent from rooms
    pub fn primary_domain(&self) -> &str {
        self.server
            .domains
            .first()
            .map(String::as_str)
            .unwrap_or("localhost")
    }

    pub fn max_message_size(&self) -> usize {
        self.smtp.max_message_size_mb * 1024 * 1024
    }

    pub fn tls_enabled(&self) -> bool {
        self.smtp.tls_cert_path.is_some()
    }
}
