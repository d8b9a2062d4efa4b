use anyhow::Context;
use clap::Parser;
use gateway_rs::antispam::{DnsProbe, SpamDefense};
use gateway_rs::bridge::Bridge;
use gateway_rs::bus::{MemoryBus, MessageBus, RoomId};
use gateway_rs::config::{Config, LoggingConfig};
use gateway_rs::directory::{settings, Directory};
use gateway_rs::mime::DkimKey;
use gateway_rs::security::TlsConfig;
use gateway_rs::smtp::{Backend, DeliveryQueue, Mailer, MxRelay, SessionConfig, SmtpServer};
use gateway_rs::tasks::Scheduler;
use gateway_rs::utils::KeyLocks;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const RELAY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "mail-gateway", version, about = "Email to chat room gateway")]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.pretty().init();
    }
}

async fn open_bus(config: &Config) -> anyhow::Result<Arc<MemoryBus>> {
    let bus = match &config.store.state_path {
        Some(path) => MemoryBus::open(path)
            .await
            .with_context(|| format!("Failed to open state file {}", path))?,
        None => {
            warn!("No state path configured, account data is not persisted");
            MemoryBus::new()
        }
    };

    for room in &config.store.rooms {
        bus.join(&RoomId::new(room.as_str())).await?;
    }
    Ok(Arc::new(bus))
}

async fn seed_mailboxes(config: &Config, directory: &Directory) {
    for seed in &config.mailboxes {
        let room = RoomId::new(seed.room.as_str());
        if let Err(e) = directory.claim(&room, &seed.mailbox, &seed.owner).await {
            error!("Cannot assign mailbox {} to {}: {}", seed.mailbox, room, e);
            continue;
        }
        if let Some(password) = &seed.password {
            if let Err(e) = directory
                .set_option(&room, &seed.owner, settings::PASSWORD, password)
                .await
            {
                error!("Cannot set password of {}: {}", seed.mailbox, e);
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    init_logging(&config.logging);

    info!("Starting mail gateway");
    info!("  SMTP listening on: {}", config.smtp.listen_addr);
    if let Some(addr) = &config.smtp.tls_listen_addr {
        info!("  SMTP TLS listening on: {}", addr);
    }
    info!("  Domains: {}", config.server.domains.join(", "));

    let locks = KeyLocks::new();
    let shared_bus: Arc<dyn MessageBus> = open_bus(&config).await?;

    let directory = Arc::new(Directory::new(
        shared_bus.clone(),
        locks.clone(),
        &config.directory,
        config.server.domains.clone(),
    ));
    directory.resync().await?;
    seed_mailboxes(&config, &directory).await;

    let spam = Arc::new(SpamDefense::new(
        &config.antispam,
        shared_bus.clone(),
        locks.clone(),
        Arc::new(DnsProbe::default()),
    )?);
    spam.load().await?;

    let relay = Arc::new(MxRelay::new(config.relay.clone(), RELAY_TIMEOUT));
    let queue = Arc::new(DeliveryQueue::new(shared_bus.clone(), locks.clone(), relay.clone()));
    let outbox = Arc::new(Mailer::new(relay, queue.clone()));

    let dkim = match &config.dkim.private_key_path {
        Some(path) => Some(Arc::new(DkimKey::from_file(path)?)),
        None => {
            warn!("No DKIM key configured, outgoing mail is not signed");
            None
        }
    };

    let bridge = Arc::new(Bridge::new(
        shared_bus,
        directory.clone(),
        outbox.clone(),
        dkim.clone(),
    ));
    let backend = Backend::new(directory.clone(), spam.clone(), bridge, outbox, dkim);

    let tls = match (&config.smtp.tls_cert_path, &config.smtp.tls_key_path) {
        (Some(cert), Some(key)) => Some(Arc::new(TlsConfig::from_pem_files(cert, key)?)),
        _ => {
            info!("TLS not configured, STARTTLS disabled");
            None
        }
    };

    let server = SmtpServer::new(SessionConfig::from_config(&config), backend, tls.clone());

    // Bind before serving so a taken port fails startup
    let listener = bind_listener("SMTP", &config.smtp.listen_addr).await?;

    let tls_listener = match (&config.smtp.tls_listen_addr, &tls) {
        (Some(addr), Some(_)) => {
            Some(bind_listener("SMTP TLS", addr).await?)
        }
        (Some(_), None) => {
            warn!("TLS listener configured without certificates, not started");
            None
        }
        _ => None,
    };

    let tasks = Scheduler::new(&config, queue, directory, spam).spawn();

    let smtp_server = server.clone();
    let smtp_handle = tokio::spawn(async move { smtp_server.serve(listener).await });
    let tls_handle =
        tls_listener.map(|listener| tokio::spawn(async move { server.serve_tls(listener).await }));

    let tls_wait = async {
        match tls_handle {
            Some(handle) => handle.await,
            None => std::future::pending().await,
        }
    };

    let outcome = tokio::select! {
        result = smtp_handle => server_outcome("SMTP", result),
        result = tls_wait => server_outcome("SMTP TLS", result),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    };

    for task in tasks {
        task.abort();
    }

    outcome
}

async fn bind_listener(name: &str, addr: &str) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot listen on {}", addr))?;
    info!("{} server listening on {}", name, addr);
    Ok(listener)
}

/// Map a finished server task to the process result
fn server_outcome(
    name: &str,
    result: std::result::Result<gateway_rs::Result<()>, tokio::task::JoinError>,
) -> anyhow::Result<()> {
    match result {
        Ok(Ok(())) => {
            info!("{} server exited", name);
            Ok(())
        }
        Ok(Err(e)) => {
            error!("{} server error: {}", name, e);
            Err(e).with_context(|| format!("{} server failed", name))
        }
        Err(e) => {
            error!("{} task panic: {}", name, e);
            Err(e).with_context(|| format!("{} task failed", name))
        }
    }
}
