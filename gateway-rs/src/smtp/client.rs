//! SMTP client for outgoing connections
//!
//! Used to relay mail to remote MX hosts or a smarthost, and to probe
//! whether a remote server accepts a given recipient.

use crate::error::{GatewayError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info};

/// SMTP client for sending emails to external servers
///
/// # Examples
/// ```no_run
/// use gateway_rs::smtp::SmtpClient;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = SmtpClient::new("mx.example.com:25".to_string());
/// client.send_mail(
///     "sender@example.com",
///     "recipient@other.com",
///     b"Subject: Test\r\n\r\nHello!"
/// ).await?;
/// # Ok(())
/// # }
/// ```
pub struct SmtpClient {
    server_addr: String,
    timeout: Duration,
    credentials: Option<(String, String)>,
}

impl SmtpClient {
    pub fn new(server_addr: String) -> Self {
        Self {
            server_addr,
            timeout: Duration::from_secs(30),
            credentials: None,
        }
    }

    /// Bound every connect, read and write
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Authenticate with AUTH PLAIN after EHLO
    pub fn with_credentials(mut self, username: String, password: String) -> Self {
        self.credentials = Some((username, password));
        self
    }

    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    /// Send an email to one recipient
    ///
    /// # Errors
    /// `GatewayError::SmtpReply` carries the remote reply code when the server
    /// refused a step; connection problems surface as `Io` or `Timeout`.
    pub async fn send_mail(&self, from: &str, to: &str, data: &[u8]) -> Result<()> {
        info!("Sending mail from {} to {} via {}", from, to, self.server_addr);

        let stream = self
            .bounded(TcpStream::connect(&self.server_addr), "connect")
            .await??;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        self.read_response(&mut reader, 220).await?;

        self.write_line(&mut writer, &format!("EHLO {}", local_hostname()))
            .await?;
        self.read_response(&mut reader, 250).await?;

        if let Some((username, password)) = &self.credentials {
            let token = BASE64.encode(format!("\0{}\0{}", username, password));
            self.write_line(&mut writer, &format!("AUTH PLAIN {}", token))
                .await?;
            self.read_response(&mut reader, 235).await?;
        }

        self.write_line(&mut writer, &format!("MAIL FROM:<{}>", from))
            .await?;
        self.read_response(&mut reader, 250).await?;

        self.write_line(&mut writer, &format!("RCPT TO:<{}>", to))
            .await?;
        self.read_response(&mut reader, 250).await?;

        self.write_line(&mut writer, "DATA").await?;
        self.read_response(&mut reader, 354).await?;

        let mut payload = dot_stuff(data);
        if !payload.ends_with(b"\r\n") {
            payload.extend_from_slice(b"\r\n");
        }
        payload.extend_from_slice(b".\r\n");
        self.bounded(writer.write_all(&payload), "write").await??;

        self.read_response(&mut reader, 250).await?;

        self.write_line(&mut writer, "QUIT").await?;
        let _ = self.read_response(&mut reader, 221).await;

        info!("Mail sent successfully to {}", to);
        Ok(())
    }

    /// Ask the server whether it would accept mail for `email`
    ///
    /// Uses the null sender and quits before DATA.
    pub async fn probe_recipient(&self, email: &str) -> Result<bool> {
        debug!("Probing {} for {}", self.server_addr, email);

        let stream = self
            .bounded(TcpStream::connect(&self.server_addr), "connect")
            .await??;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        self.read_response(&mut reader, 220).await?;
        self.write_line(&mut writer, &format!("EHLO {}", local_hostname()))
            .await?;
        self.read_response(&mut reader, 250).await?;
        self.write_line(&mut writer, "MAIL FROM:<>").await?;
        self.read_response(&mut reader, 250).await?;

        self.write_line(&mut writer, &format!("RCPT TO:<{}>", email))
            .await?;
        let accepted = match self.read_response(&mut reader, 250).await {
            Ok(_) => true,
            Err(GatewayError::SmtpReply { code, .. }) if code == 251 || code == 252 => true,
            Err(GatewayError::SmtpReply { code, .. }) if code >= 500 => false,
            Err(e) => return Err(e),
        };

        self.write_line(&mut writer, "QUIT").await?;
        let _ = self.read_response(&mut reader, 221).await;

        Ok(accepted)
    }

    async fn bounded<F, T>(&self, future: F, what: &str) -> Result<T>
    where
        F: Future<Output = T>,
    {
        timeout(self.timeout, future).await.map_err(|_| {
            GatewayError::Timeout(format!("{} to {} timed out", what, self.server_addr))
        })
    }

    async fn read_line<R>(&self, reader: &mut BufReader<R>) -> Result<String>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut line = String::new();
        let n = self.bounded(reader.read_line(&mut line), "read").await??;
        if n == 0 {
            return Err(GatewayError::SmtpProtocol(format!(
                "{} closed the connection",
                self.server_addr
            )));
        }
        Ok(line)
    }

    /// Read a possibly multi-line response and check its code
    async fn read_response<R>(&self, reader: &mut BufReader<R>, expected: u16) -> Result<String>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut full_response = String::new();

        loop {
            let line = self.read_line(reader).await?;
            debug!("< {}", line.trim());

            full_response.push_str(&line);

            if line.as_bytes().get(3) != Some(&b'-') {
                break;
            }
        }

        let code = full_response
            .get(..3)
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| {
                GatewayError::SmtpProtocol(format!("Malformed response: {}", full_response.trim()))
            })?;

        if code != expected {
            error!("Unexpected response from {}: {}", self.server_addr, full_response.trim());
            return Err(GatewayError::SmtpReply {
                code,
                message: full_response.trim().to_string(),
            });
        }

        Ok(full_response)
    }

    async fn write_line<W>(&self, writer: &mut W, line: &str) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        debug!("> {}", line);
        self.bounded(writer.write_all(format!("{}\r\n", line).as_bytes()), "write")
            .await??;
        Ok(())
    }
}

fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().to_string()
}

/// Double leading dots (RFC 5321 section 4.5.2)
pub fn dot_stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 16);
    let mut line_start = true;
    for &byte in data {
        if line_start && byte == b'.' {
            out.push(b'.');
        }
        out.push(byte);
        line_start = byte == b'\n';
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_client_creation() {
        let client = SmtpClient::new("mail.example.com:25".to_string());
        assert_eq!(client.server_addr(), "mail.example.com:25");
    }

    #[test]
    fn test_dot_stuff() {
        assert_eq!(dot_stuff(b".hidden\r\nline\r\n..x"), b"..hidden\r\nline\r\n...x".to_vec());
        assert_eq!(dot_stuff(b"a.b\r\n"), b"a.b\r\n".to_vec());
    }

    /// Minimal server answering a scripted sequence of replies
    async fn scripted_server(replies: Vec<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            for (i, reply) in replies.iter().enumerate() {
                if i > 0 {
                    let _ = socket.read(&mut buf).await;
                }
                if socket.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_probe_accepted() {
        let addr = scripted_server(vec![
            "220 mx ready\r\n",
            "250-mx\r\n250 SIZE 1000\r\n",
            "250 OK\r\n",
            "250 OK\r\n",
            "221 Bye\r\n",
        ])
        .await;

        let client = SmtpClient::new(addr).with_timeout(Duration::from_secs(5));
        assert!(client.probe_recipient("someone@example.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_probe_refused() {
        let addr = scripted_server(vec![
            "220 mx ready\r\n",
            "250 mx\r\n",
            "250 OK\r\n",
            "550 No such user\r\n",
            "221 Bye\r\n",
        ])
        .await;

        let client = SmtpClient::new(addr).with_timeout(Duration::from_secs(5));
        assert!(!client.probe_recipient("ghost@example.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_send_reports_reply_code() {
        let addr = scripted_server(vec![
            "220 mx ready\r\n",
            "250 mx\r\n",
            "451 Try later\r\n",
        ])
        .await;

        let client = SmtpClient::new(addr).with_timeout(Duration::from_secs(5));
        let err = client
            .send_mail("a@example.com", "b@example.org", b"Subject: x\r\n\r\nbody")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::SmtpReply { code: 451, .. }));
        assert!(err.is_transient());
    }
}
