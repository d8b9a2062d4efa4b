use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::security::{decode_login_credential, decode_plain_auth, AuthMechanism, TlsConfig};
use crate::smtp::backend::{Backend, MailSession};
use crate::smtp::commands::SmtpCommand;
use crate::smtp::reply::{ReplyResult, SmtpReply};
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf,
};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tracing::{debug, error, info, warn};

/// Maximum number of recipients per message
const MAX_RECIPIENTS: usize = 100;

/// Maximum line length in SMTP protocol (RFC 5321)
const MAX_LINE_LENGTH: usize = 1000;

/// Errors tolerated before disconnecting
const MAX_ERRORS: usize = 10;

/// Plain or TLS connection, upgradable in place by STARTTLS
enum SmtpStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    /// Placeholder while the handshake owns the socket
    Upgrading,
}

fn upgrading_error() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "I/O on SMTP stream during STARTTLS upgrade",
    )
}

impl AsyncRead for SmtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SmtpState {
    Fresh,
    Greeted,
    MailFrom,
    RcptTo,
}

enum Flow {
    /// Restart command processing on an upgraded stream
    Continue,
    Quit,
}

/// Protocol limits and identity shared by every connection
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub hostname: String,
    pub max_message_size: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub require_tls: bool,
}

impl SessionConfig {
    pub fn from_config(config: &Config) -> Self {
        let hostname = if config.server.hostname.is_empty() {
            gethostname::gethostname().to_string_lossy().to_string()
        } else {
            config.server.hostname.clone()
        };

        SessionConfig {
            hostname,
            max_message_size: config.max_message_size(),
            read_timeout: Duration::from_secs(config.smtp.read_timeout_secs),
            write_timeout: Duration::from_secs(config.smtp.write_timeout_secs),
            require_tls: config.smtp.require_tls,
        }
    }
}

/// One SMTP connection
///
/// Owns the framing: greeting, EHLO, STARTTLS, AUTH, DATA with
/// dot-unstuffing, size cap, timeouts and the error budget. What MAIL,
/// RCPT and DATA mean is up to the current [`MailSession`].
pub struct SmtpSession {
    config: Arc<SessionConfig>,
    backend: Backend,
    tls: Option<Arc<TlsConfig>>,
    peer: IpAddr,
    session: Box<dyn MailSession>,
    state: SmtpState,
    recipients: usize,
    error_count: usize,
    is_encrypted: bool,
    authenticated: bool,
}

impl SmtpSession {
    pub fn new(
        config: Arc<SessionConfig>,
        backend: Backend,
        tls: Option<Arc<TlsConfig>>,
        peer: IpAddr,
    ) -> Self {
        let session = backend.anonymous_login(peer);
        Self {
            config,
            backend,
            tls,
            peer,
            session,
            state: SmtpState::Fresh,
            recipients: 0,
            error_count: 0,
            is_encrypted: false,
            authenticated: false,
        }
    }

    /// Serve a plaintext connection
    pub async fn handle(self, stream: TcpStream) -> Result<()> {
        self.run(SmtpStream::Plain(stream), false).await
    }

    /// Serve an implicit-TLS connection
    pub async fn handle_tls(self, stream: TlsStream<TcpStream>) -> Result<()> {
        self.run(SmtpStream::Tls(Box::new(stream)), true).await
    }

    async fn run(mut self, mut stream: SmtpStream, encrypted: bool) -> Result<()> {
        self.is_encrypted = encrypted;

        if self.backend.spam().is_banned(&self.peer).await {
            info!("Refusing banned address {}", self.peer);
            self.respond(&mut stream, &SmtpReply::banned().to_wire())
                .await?;
            let _ = stream.shutdown().await;
            return Ok(());
        }

        let greeting = format!("220 {} ESMTP Service Ready\r\n", self.config.hostname);
        self.respond(&mut stream, &greeting).await?;

        loop {
            match self.process_commands(&mut stream).await? {
                Flow::Continue => continue,
                Flow::Quit => break,
            }
        }

        self.session.logout();
        let _ = stream.shutdown().await;
        Ok(())
    }

    /// Write a response; negative replies count against the error budget
    async fn respond<W>(&mut self, writer: &mut W, response: &str) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        debug!("Sent: {}", response.trim_end());
        if response.starts_with('4') || response.starts_with('5') {
            self.error_count += 1;
        }

        let write = async {
            writer.write_all(response.as_bytes()).await?;
            writer.flush().await
        };
        timeout(self.config.write_timeout, write)
            .await
            .map_err(|_| GatewayError::Timeout(format!("write to {}", self.peer)))??;
        Ok(())
    }

    async fn process_commands(&mut self, stream: &mut SmtpStream) -> Result<Flow> {
        let mut buf_reader = BufReader::new(&mut *stream);
        let mut raw = Vec::new();

        loop {
            if self.error_count > MAX_ERRORS {
                warn!("Too many errors from {}, disconnecting", self.peer);
                self.respond(
                    &mut buf_reader,
                    "421 4.7.0 Too many errors, closing connection\r\n",
                )
                .await?;
                return Ok(Flow::Quit);
            }

            raw.clear();

            let read = read_line_limited(&mut buf_reader, &mut raw, MAX_LINE_LENGTH + 1);
            let n = match timeout(self.config.read_timeout, read).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    error!("IO error reading line: {}", e);
                    return Err(e.into());
                }
                Err(_) => {
                    warn!("Command timeout, disconnecting {}", self.peer);
                    self.respond(
                        &mut buf_reader,
                        "421 4.4.2 Timeout, closing connection\r\n",
                    )
                    .await?;
                    return Ok(Flow::Quit);
                }
            };

            if n == 0 {
                debug!("Client {} disconnected", self.peer);
                return Ok(Flow::Quit);
            }

            if n > MAX_LINE_LENGTH {
                warn!("Line too long: {} bytes", n);
                self.respond(&mut buf_reader, "500 5.5.6 Line too long\r\n")
                    .await?;
                continue;
            }

            let Ok(line) = std::str::from_utf8(&raw) else {
                self.respond(&mut buf_reader, &SmtpReply::syntax_error().to_wire())
                    .await?;
                continue;
            };

            let line_trimmed = line.trim_end();
            debug!("Received: {}", line_trimmed);

            let cmd = match SmtpCommand::parse(line_trimmed) {
                Ok(cmd) => cmd,
                Err(e) => {
                    debug!("Command parse error: {}", e);
                    self.respond(&mut buf_reader, &SmtpReply::syntax_error().to_wire())
                        .await?;
                    continue;
                }
            };

            match cmd {
                SmtpCommand::Starttls => {
                    drop(buf_reader);
                    if self.starttls(stream).await? {
                        return Ok(Flow::Continue);
                    }
                    buf_reader = BufReader::new(&mut *stream);
                }
                SmtpCommand::Auth(mechanism, initial_response) => {
                    if let Flow::Quit = self
                        .handle_auth(&mechanism, initial_response, &mut buf_reader)
                        .await?
                    {
                        return Ok(Flow::Quit);
                    }
                }
                SmtpCommand::Data => self.handle_data(&mut buf_reader).await?,
                SmtpCommand::Quit => {
                    info!("QUIT from {}", self.peer);
                    let bye = format!("221 2.0.0 {} closing connection\r\n", self.config.hostname);
                    self.respond(&mut buf_reader, &bye).await?;
                    return Ok(Flow::Quit);
                }
                cmd => {
                    let response = self.handle_command(cmd).await;
                    self.respond(&mut buf_reader, &response).await?;
                }
            }
        }
    }

    /// Start a new transaction after HELO/EHLO
    fn greeted(&mut self) {
        self.session.reset();
        self.recipients = 0;
        self.state = SmtpState::Greeted;
    }

    fn ehlo_response(&self, domain: &str) -> String {
        let mut lines = vec![
            format!("{} Hello {}", self.config.hostname, domain),
            format!("SIZE {}", self.config.max_message_size),
            "8BITMIME".to_string(),
            "SMTPUTF8".to_string(),
        ];
        if self.config.require_tls {
            lines.push("REQUIRETLS".to_string());
        }
        if self.tls.is_some() && !self.is_encrypted {
            lines.push("STARTTLS".to_string());
        }
        if !self.authenticated && (self.is_encrypted || !self.config.require_tls) {
            lines.push("AUTH PLAIN LOGIN".to_string());
        }
        lines.push("HELP".to_string());

        let last = lines.len() - 1;
        lines
            .iter()
            .enumerate()
            .map(|(i, line)| {
                let sep = if i == last { ' ' } else { '-' };
                format!("250{}{}\r\n", sep, line)
            })
            .collect()
    }

    async fn handle_command(&mut self, cmd: SmtpCommand) -> String {
        match cmd {
            SmtpCommand::Helo(domain) => {
                info!("HELO {} from {}", domain, self.peer);
                self.greeted();
                format!("250 {} Hello {}\r\n", self.config.hostname, domain)
            }
            SmtpCommand::Ehlo(domain) => {
                info!("EHLO {} from {}", domain, self.peer);
                self.greeted();
                self.ehlo_response(&domain)
            }
            SmtpCommand::MailFrom(from) => {
                if self.state != SmtpState::Greeted {
                    return SmtpReply::bad_sequence().to_wire();
                }
                if self.config.require_tls && !self.is_encrypted {
                    warn!("MAIL FROM rejected: TLS required");
                    return SmtpReply::tls_required().to_wire();
                }

                info!("MAIL FROM: {}", from);
                let result = self.session.mail(&from).await;
                self.reply(result, SmtpState::MailFrom)
            }
            SmtpCommand::RcptTo(to) => {
                if !matches!(self.state, SmtpState::MailFrom | SmtpState::RcptTo) {
                    return SmtpReply::bad_sequence().to_wire();
                }
                if self.recipients >= MAX_RECIPIENTS {
                    warn!("Too many recipients: {}", self.recipients);
                    return format!("452 4.5.3 Too many recipients (max {})\r\n", MAX_RECIPIENTS);
                }

                info!("RCPT TO: {}", to);
                let result = self.session.rcpt(&to).await;
                if result.is_ok() {
                    self.recipients += 1;
                }
                self.reply(result, SmtpState::RcptTo)
            }
            SmtpCommand::Rset => {
                self.session.reset();
                self.recipients = 0;
                if self.state != SmtpState::Fresh {
                    self.state = SmtpState::Greeted;
                }
                SmtpReply::ok().to_wire()
            }
            SmtpCommand::Noop => SmtpReply::ok().to_wire(),
            SmtpCommand::Unknown(cmd) => {
                debug!("Unknown command: {}", cmd);
                SmtpReply::not_implemented().to_wire()
            }
            SmtpCommand::Data
            | SmtpCommand::Quit
            | SmtpCommand::Starttls
            | SmtpCommand::Auth(_, _) => SmtpReply::bad_sequence().to_wire(),
        }
    }

    /// Move to `next` on success
    fn reply(&mut self, result: ReplyResult, next: SmtpState) -> String {
        match result {
            Ok(()) => {
                self.state = next;
                SmtpReply::ok().to_wire()
            }
            Err(reply) => reply.to_wire(),
        }
    }

    async fn handle_data<S>(&mut self, buf_reader: &mut BufReader<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.state != SmtpState::RcptTo {
            return self
                .respond(buf_reader, &SmtpReply::bad_sequence().to_wire())
                .await;
        }

        self.respond(
            buf_reader,
            "354 Start mail input; end with <CRLF>.<CRLF>\r\n",
        )
        .await?;

        let response = match self.receive_data(buf_reader).await? {
            Some(body) => match self.session.data(&body).await {
                Ok(()) => "250 2.0.0 OK: Message accepted\r\n".to_string(),
                Err(reply) => reply.to_wire(),
            },
            None => SmtpReply::too_large(self.config.max_message_size).to_wire(),
        };

        self.session.reset();
        self.recipients = 0;
        self.state = SmtpState::Greeted;

        self.respond(buf_reader, &response).await
    }

    /// Read DATA up to the lone dot; `None` when the size cap was exceeded
    async fn receive_data<S>(&mut self, buf_reader: &mut BufReader<S>) -> Result<Option<Vec<u8>>>
    where
        S: AsyncRead + Unpin,
    {
        let mut data = Vec::new();
        let mut line = Vec::new();
        let mut overflow = false;

        loop {
            line.clear();

            // Past the cap only the terminating dot matters
            let limit = if overflow {
                3
            } else {
                self.config.max_message_size.saturating_sub(data.len()) + 3
            };
            let n = timeout(
                self.config.read_timeout,
                read_line_limited(buf_reader, &mut line, limit),
            )
            .await
            .map_err(|_| GatewayError::Timeout("DATA".to_string()))??;

            if n == 0 {
                return Err(GatewayError::SmtpProtocol(
                    "Connection closed during DATA".to_string(),
                ));
            }

            if line == b".\r\n" || line == b".\n" {
                break;
            }

            if overflow {
                continue;
            }
            if n > line.len() {
                warn!(
                    "Message too large (max {} bytes)",
                    self.config.max_message_size
                );
                overflow = true;
                continue;
            }

            let content = line.strip_prefix(b".").unwrap_or(&line);
            if data.len() + content.len() > self.config.max_message_size {
                warn!(
                    "Message too large (max {} bytes)",
                    self.config.max_message_size
                );
                overflow = true;
                continue;
            }
            data.extend_from_slice(content);
        }

        if overflow {
            return Ok(None);
        }

        info!("End of DATA received, total size: {} bytes", data.len());
        Ok(Some(data))
    }

    /// Upgrade the plaintext stream in place
    ///
    /// Returns `Ok(false)` when STARTTLS was refused and the stream is
    /// unchanged. After an upgrade the client must EHLO again (RFC 3207).
    async fn starttls(&mut self, stream: &mut SmtpStream) -> Result<bool> {
        let tls = match &self.tls {
            Some(tls) => tls.clone(),
            None => {
                self.respond(stream, "502 5.5.1 STARTTLS not available\r\n")
                    .await?;
                return Ok(false);
            }
        };

        if self.is_encrypted {
            self.respond(stream, "503 5.5.1 Already using TLS\r\n").await?;
            return Ok(false);
        }

        if self.state != SmtpState::Greeted {
            self.respond(stream, &SmtpReply::bad_sequence().to_wire())
                .await?;
            return Ok(false);
        }

        self.respond(stream, "220 2.0.0 Ready to start TLS\r\n").await?;

        let tcp_stream = match std::mem::replace(stream, SmtpStream::Upgrading) {
            SmtpStream::Plain(tcp) => tcp,
            other => {
                *stream = other;
                return Err(GatewayError::SmtpProtocol(
                    "STARTTLS on a stream that is not plaintext".to_string(),
                ));
            }
        };

        let tls_stream = tls.acceptor().accept(tcp_stream).await.map_err(|e| {
            error!("TLS handshake with {} failed: {}", self.peer, e);
            GatewayError::Tls(format!("handshake failed: {}", e))
        })?;

        *stream = SmtpStream::Tls(Box::new(tls_stream));
        self.is_encrypted = true;
        self.session.reset();
        self.recipients = 0;
        self.state = SmtpState::Fresh;

        info!("STARTTLS completed for {}", self.peer);
        Ok(true)
    }

    async fn handle_auth<S>(
        &mut self,
        mechanism: &str,
        initial_response: Option<String>,
        buf_reader: &mut BufReader<S>,
    ) -> Result<Flow>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let refusal = if self.config.require_tls && !self.is_encrypted {
            Some(SmtpReply::tls_required())
        } else if self.authenticated {
            Some(SmtpReply::new(503, Some("5.5.1"), "Already authenticated"))
        } else if self.state != SmtpState::Greeted {
            Some(SmtpReply::bad_sequence())
        } else {
            None
        };
        if let Some(reply) = refusal {
            self.respond(buf_reader, &reply.to_wire()).await?;
            return Ok(Flow::Continue);
        }

        let Some(mechanism) = AuthMechanism::parse(mechanism) else {
            self.respond(
                buf_reader,
                "504 5.5.4 Authentication mechanism not supported\r\n",
            )
            .await?;
            return Ok(Flow::Continue);
        };

        info!("AUTH {} from {}", mechanism.as_str(), self.peer);

        let (username, password) = match self
            .read_credentials(mechanism, initial_response, buf_reader)
            .await?
        {
            Ok(credentials) => credentials,
            Err(reply) => {
                self.respond(buf_reader, &reply.to_wire()).await?;
                return Ok(Flow::Continue);
            }
        };

        match self.backend.login(self.peer, &username, &password).await {
            Ok(session) => {
                self.session = session;
                self.authenticated = true;
                self.respond(buf_reader, "235 2.7.0 Authentication successful\r\n")
                    .await?;
                Ok(Flow::Continue)
            }
            Err(reply) => {
                self.respond(buf_reader, &reply.to_wire()).await?;
                Ok(Flow::Quit)
            }
        }
    }

    async fn read_credentials<S>(
        &mut self,
        mechanism: AuthMechanism,
        initial_response: Option<String>,
        buf_reader: &mut BufReader<S>,
    ) -> Result<ReplyResult<(String, String)>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let malformed = || SmtpReply::new(535, Some("5.7.8"), "Authentication credentials invalid");

        match mechanism {
            AuthMechanism::Plain => {
                let auth_data = match initial_response {
                    Some(data) => data,
                    None => match self.challenge(buf_reader, "334 \r\n").await? {
                        Some(line) => line,
                        None => return Ok(Err(cancelled())),
                    },
                };
                Ok(decode_plain_auth(&auth_data).map_err(|_| malformed()))
            }
            AuthMechanism::Login => {
                let username = match initial_response {
                    Some(data) => data,
                    None => match self.challenge(buf_reader, "334 VXNlcm5hbWU6\r\n").await? {
                        Some(line) => line,
                        None => return Ok(Err(cancelled())),
                    },
                };
                let Ok(username) = decode_login_credential(&username) else {
                    return Ok(Err(malformed()));
                };

                let password = match self.challenge(buf_reader, "334 UGFzc3dvcmQ6\r\n").await? {
                    Some(line) => line,
                    None => return Ok(Err(cancelled())),
                };
                let Ok(password) = decode_login_credential(&password) else {
                    return Ok(Err(malformed()));
                };

                Ok(Ok((username, password)))
            }
        }
    }

    /// Send a 334 challenge and read the answer; `None` if the client cancelled
    async fn challenge<S>(
        &mut self,
        buf_reader: &mut BufReader<S>,
        prompt: &str,
    ) -> Result<Option<String>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.respond(buf_reader, prompt).await?;

        let mut raw = Vec::new();
        let n = timeout(
            self.config.read_timeout,
            read_line_limited(buf_reader, &mut raw, MAX_LINE_LENGTH),
        )
        .await
        .map_err(|_| GatewayError::Timeout("AUTH".to_string()))??;
        if n == 0 {
            return Err(GatewayError::SmtpProtocol(
                "Connection closed during AUTH".to_string(),
            ));
        }

        let line = String::from_utf8_lossy(&raw);
        let line = line.trim();
        if line == "*" {
            return Ok(None);
        }
        Ok(Some(line.to_string()))
    }
}

/// Read one line into `buf`, keeping at most `limit` bytes of it
///
/// The rest of an overlong line is read and dropped. Returns the number of
/// bytes taken from the stream, 0 at end of stream.
async fn read_line_limited<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut total = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(total);
        }

        let (used, done) = match available.iter().position(|&b| b == b'\n') {
            Some(end) => (end + 1, true),
            None => (available.len(), false),
        };
        let keep = used.min(limit.saturating_sub(buf.len()));
        buf.extend_from_slice(&available[..keep]);

        reader.consume(used);
        total += used;
        if done {
            return Ok(total);
        }
    }
}

fn cancelled() -> SmtpReply {
    SmtpReply::new(501, Some("5.7.0"), "Authentication cancelled")
}
