//! Shared harness for the SMTP integration tests
//!
//! Starts a full gateway on 127.0.0.1:0 backed by a [`MemoryBus`], with
//! network lookups and relaying replaced by in-process fakes.

#![allow(dead_code)]

use async_trait::async_trait;
use gateway_rs::antispam::{MailProbe, SpamDefense};
use gateway_rs::bridge::Bridge;
use gateway_rs::bus::{MemoryBus, MessageBus, RoomId};
use gateway_rs::config::Config;
use gateway_rs::directory::{settings, Directory};
use gateway_rs::mime::DkimKey;
use gateway_rs::security::TlsConfig;
use gateway_rs::smtp::{Backend, DeliveryQueue, Mailer, Relay, SessionConfig, SmtpServer};
use gateway_rs::utils::KeyLocks;
use gateway_rs::{GatewayError, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const DOMAIN: &str = "example.com";
pub const ROOM: &str = "!sales:example.com";
pub const OWNER: &str = "@alice:example.com";
pub const MAILBOX: &str = "sales";
pub const PASSWORD: &str = "correct horse";

/// DNS and SMTP lookups answered from memory
pub struct StaticProbe {
    pub mx: Vec<String>,
    pub accepting: bool,
}

#[async_trait]
impl MailProbe for StaticProbe {
    async fn mx_hosts(&self, _domain: &str) -> Result<Vec<String>> {
        Ok(self.mx.clone())
    }

    async fn smtp_probe(&self, _mx_host: &str, _email: &str) -> Result<bool> {
        Ok(self.accepting)
    }
}

/// Relay that records messages, or fails with a 421 while `failing` is set
#[derive(Default)]
pub struct TestRelay {
    failing: AtomicBool,
    sent: Mutex<Vec<(String, String, Vec<u8>)>>,
}

impl TestRelay {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(String, String, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Relay for TestRelay {
    async fn relay(&self, from: &str, to: &str, data: &[u8]) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(GatewayError::SmtpReply {
                code: 421,
                message: "try again later".to_string(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((from.to_string(), to.to_string(), data.to_vec()));
        Ok(())
    }
}

pub struct TestGateway {
    pub addr: String,
    pub bus: Arc<MemoryBus>,
    pub directory: Arc<Directory>,
    pub spam: Arc<SpamDefense>,
    pub queue: Arc<DeliveryQueue>,
    pub relay: Arc<TestRelay>,
    pub bridge: Arc<Bridge>,
    handle: JoinHandle<()>,
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.domains = vec![DOMAIN.to_string()];
    config.server.hostname = format!("mx.{}", DOMAIN);
    config.smtp.read_timeout_secs = 5;
    config.smtp.write_timeout_secs = 5;
    config
}

/// Self-signed `localhost` certificate written to `dir`, with a root store trusting it
pub fn test_tls(dir: &Path) -> (Arc<TlsConfig>, rustls::RootCertStore) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
    std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(&rustls::Certificate(cert.serialize_der().unwrap()))
        .unwrap();

    let tls = TlsConfig::from_pem_files(&cert_path, &key_path).unwrap();
    (Arc::new(tls), roots)
}

pub fn test_dkim_key() -> DkimKey {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/dkim_test_key.pem");
    DkimKey::from_file(path).unwrap()
}

/// Start a gateway with one room holding the `sales` mailbox
pub async fn start_gateway(
    config: Config,
    probe: StaticProbe,
    dkim: Option<DkimKey>,
) -> TestGateway {
    start_gateway_with_tls(config, probe, dkim, None).await
}

pub async fn start_gateway_with_tls(
    config: Config,
    probe: StaticProbe,
    dkim: Option<DkimKey>,
    tls: Option<Arc<TlsConfig>>,
) -> TestGateway {
    let locks = KeyLocks::new();
    let bus = Arc::new(MemoryBus::new());
    let shared_bus: Arc<dyn MessageBus> = bus.clone();

    let room = RoomId::new(ROOM);
    bus.join(&room).await.unwrap();

    let directory = Arc::new(Directory::new(
        shared_bus.clone(),
        locks.clone(),
        &config.directory,
        config.server.domains.clone(),
    ));
    directory.claim(&room, MAILBOX, OWNER).await.unwrap();
    directory
        .set_option(&room, OWNER, settings::PASSWORD, PASSWORD)
        .await
        .unwrap();

    let spam = Arc::new(
        SpamDefense::new(&config.antispam, shared_bus.clone(), locks.clone(), Arc::new(probe))
            .unwrap(),
    );

    let relay = Arc::new(TestRelay::default());
    let queue = Arc::new(DeliveryQueue::new(shared_bus.clone(), locks, relay.clone()));
    let outbox = Arc::new(Mailer::new(relay.clone(), queue.clone()));
    let dkim = dkim.map(Arc::new);

    let bridge = Arc::new(Bridge::new(
        shared_bus,
        directory.clone(),
        outbox.clone(),
        dkim.clone(),
    ));
    let backend = Backend::new(directory.clone(), spam.clone(), bridge.clone(), outbox, dkim);

    let server = SmtpServer::new(SessionConfig::from_config(&config), backend, tls);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handle = tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    TestGateway {
        addr,
        bus,
        directory,
        spam,
        queue,
        relay,
        bridge,
        handle,
    }
}

/// Line-oriented SMTP client speaking raw commands
pub struct SmtpTestClient<S = TcpStream> {
    stream: BufReader<S>,
}

impl SmtpTestClient<TcpStream> {
    /// Connect and return the client with the server's first reply
    pub async fn connect(addr: &str) -> (Self, String) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = Self {
            stream: BufReader::new(stream),
        };
        let greeting = client.read_response().await;
        (client, greeting)
    }

    /// Issue STARTTLS and complete the handshake, trusting `roots`
    pub async fn starttls(
        mut self,
        roots: rustls::RootCertStore,
    ) -> SmtpTestClient<tokio_rustls::client::TlsStream<TcpStream>> {
        let response = self.command("STARTTLS").await;
        assert!(response.starts_with("220"), "STARTTLS: {}", response);

        let config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let server_name = rustls::ServerName::try_from("localhost").unwrap();
        let stream = connector
            .connect(server_name, self.stream.into_inner())
            .await
            .unwrap();

        SmtpTestClient {
            stream: BufReader::new(stream),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> SmtpTestClient<S> {
    pub async fn command(&mut self, command: &str) -> String {
        self.send_line(command).await;
        self.read_response().await
    }

    pub async fn ehlo(&mut self) -> String {
        self.command("EHLO client.test").await
    }

    /// Send DATA, the message and the final dot
    pub async fn data(&mut self, content: &str) -> String {
        let response = self.command("DATA").await;
        if !response.starts_with("354") {
            return response;
        }
        for line in content.split("\r\n") {
            if line.starts_with('.') {
                self.send_line(&format!(".{}", line)).await;
            } else {
                self.send_line(line).await;
            }
        }
        self.command(".").await
    }

    pub async fn send_line(&mut self, line: &str) {
        let stream = self.stream.get_mut();
        stream
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .unwrap();
        stream.flush().await.unwrap();
    }

    /// Read a possibly multi-line reply; empty when the server closed
    pub async fn read_response(&mut self) -> String {
        let mut full_response = String::new();
        let mut line = String::new();

        loop {
            line.clear();
            let n = self.stream.read_line(&mut line).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            full_response.push_str(&line);
            if line.as_bytes().get(3) != Some(&b'-') {
                break;
            }
        }

        full_response.trim().to_string()
    }
}

pub fn message(from: &str, to: &str, subject: &str, body: &str) -> String {
    format!(
        "From: {}\r\nTo: {}\r\nSubject: {}\r\nMessage-ID: <test-{}@client.test>\r\n\r\n{}",
        from,
        to,
        subject,
        subject.replace(' ', "-").to_lowercase(),
        body
    )
}
