//! One SMTP session against a single remote host.
//!
//! Covers connect, EHLO/HELO negotiation, the opportunistic STARTTLS
//! upgrade, and one mail transaction. Per-recipient soft refusals are
//! collected, session-level failures map onto the transport error
//! taxonomy.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::core::error::{AppError, Result};

/// A parsed (possibly multi-line) SMTP reply.
#[derive(Debug, Clone)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    fn parse(raw: &str) -> Result<Reply> {
        let mut code = 0;
        let mut lines = Vec::new();
        for line in raw.lines() {
            if line.len() < 3 {
                continue;
            }
            code = line[..3]
                .parse::<u16>()
                .map_err(|_| AppError::Protocol {
                    code: 0,
                    text: format!("Unparsable reply line: {}", line),
                })?;
            lines.push(line[3..].trim_start_matches([' ', '-']).to_string());
        }
        if lines.is_empty() {
            return Err(AppError::Disconnected);
        }
        Ok(Reply { code, lines })
    }

    /// The reply text with continuation lines joined.
    pub fn text(&self) -> String {
        self.lines.join(" ")
    }

    fn is_completed(&self) -> bool {
        (200..300).contains(&self.code)
    }

    fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }
}

/// A per-recipient soft refusal returned within a transaction.
#[derive(Debug, Clone)]
pub struct Refusal {
    pub recipient: String,
    pub code: u16,
    pub reason: String,
}

enum SessionStream {
    Plain(BufReader<TcpStream>),
    Tls(BufReader<TlsStream<TcpStream>>),
}

/// An open SMTP session.
pub struct SmtpSession {
    stream: Option<SessionStream>,
    host: String,
    port: u16,
    timeout: Duration,
    local_name: String,
    extensions: Vec<String>,
}

impl std::fmt::Debug for SmtpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpSession")
            .field("connected", &self.stream.is_some())
            .field("host", &self.host)
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .field("local_name", &self.local_name)
            .field("extensions", &self.extensions)
            .finish()
    }
}

impl SmtpSession {
    /// Connect, read the greeting and negotiate EHLO (HELO fallback).
    pub async fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
        local_name: &str,
    ) -> Result<SmtpSession> {
        info!(
            "Connecting to remote server. [host={}, port={}, helo={}]",
            host, port, local_name
        );

        let tcp = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| AppError::ConnectionTimeout {
                host: host.to_string(),
                port,
            })?
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::TimedOut => AppError::ConnectionTimeout {
                    host: host.to_string(),
                    port,
                },
                _ => AppError::ConnectionRefused {
                    host: host.to_string(),
                    port,
                },
            })?;

        let mut session = SmtpSession {
            stream: Some(SessionStream::Plain(BufReader::new(tcp))),
            host: host.to_string(),
            port,
            timeout,
            local_name: local_name.to_string(),
            extensions: Vec::new(),
        };

        let greeting = session.read_reply().await?;
        if !session_opened(greeting.code) {
            return Err(AppError::Protocol {
                code: greeting.code,
                text: greeting.text(),
            });
        }

        session.hello().await?;
        Ok(session)
    }

    /// Whether the remote advertised an ESMTP keyword.
    pub fn supports(&self, extension: &str) -> bool {
        self.extensions.iter().any(|e| e == extension)
    }

    /// Upgrade the connection with STARTTLS and renegotiate EHLO.
    ///
    /// Callers check [`SmtpSession::supports`] first; a handshake
    /// failure here is fatal for the session.
    pub async fn starttls(&mut self) -> Result<()> {
        let reply = self.command("STARTTLS").await?;
        if reply.code != 220 {
            return Err(AppError::StartTls(format!(
                "STARTTLS rejected: {}",
                reply.text()
            )));
        }

        let tcp = match self.stream.take() {
            Some(SessionStream::Plain(reader)) => reader.into_inner(),
            Some(other) => {
                self.stream = Some(other);
                return Err(AppError::StartTls("Session already encrypted".to_string()));
            }
            None => return Err(AppError::Disconnected),
        };

        let connector = tls_connector().map_err(AppError::StartTls)?;
        let server_name = rustls::ServerName::try_from(self.host.as_str())
            .map_err(|err| AppError::StartTls(format!("Invalid server name: {}", err)))?;

        let tls = tokio::time::timeout(self.timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| AppError::ConnectionTimeout {
                host: self.host.clone(),
                port: self.port,
            })?
            .map_err(|err| AppError::StartTls(format!("TLS handshake failed: {}", err)))?;

        self.stream = Some(SessionStream::Tls(BufReader::new(tls)));
        info!(
            "STARTTLS upgrade successful. [host={}, port={}]",
            self.host, self.port
        );

        // RFC 3207: the session state resets after the handshake
        self.hello().await
    }

    /// Submit one transaction: envelope-from, the recipients, the body.
    ///
    /// Individual recipient refusals are returned, not raised; the
    /// transaction only fails when the sender or every recipient is
    /// rejected, the connection drops, or a reply is negative.
    pub async fn send_mail(
        &mut self,
        from: &str,
        recipients: &[String],
        body: &str,
    ) -> Result<Vec<Refusal>> {
        let reply = self.command(&format!("MAIL FROM:<{}>", from)).await?;
        if !reply.is_completed() {
            let _ = self.command("RSET").await;
            return Err(AppError::SenderRejected {
                code: reply.code,
                reason: reply.text(),
            });
        }

        let mut refused = Vec::new();
        let mut accepted = 0usize;
        for recipient in recipients {
            let reply = self.command(&format!("RCPT TO:<{}>", recipient)).await?;
            if reply.code == 250 || reply.code == 251 {
                accepted += 1;
            } else {
                refused.push(Refusal {
                    recipient: recipient.clone(),
                    code: reply.code,
                    reason: reply.text(),
                });
            }
        }
        if accepted == 0 {
            let _ = self.command("RSET").await;
            return Err(AppError::RecipientsRefused);
        }

        let reply = self.command("DATA").await?;
        if !reply.is_intermediate() {
            return Err(AppError::Protocol {
                code: reply.code,
                text: reply.text(),
            });
        }

        let stuffed = dot_stuff(body);
        self.write_raw(stuffed.as_bytes()).await?;
        self.write_raw(b".\r\n").await?;
        self.flush().await?;

        let reply = self.read_reply().await?;
        if !reply.is_completed() {
            return Err(AppError::Protocol {
                code: reply.code,
                text: reply.text(),
            });
        }

        Ok(refused)
    }

    /// Close the session gracefully.
    pub async fn quit(&mut self) {
        if self.stream.is_some() {
            let _ = self.command("QUIT").await;
            self.stream = None;
        }
    }

    async fn hello(&mut self) -> Result<()> {
        let reply = self.command(&format!("EHLO {}", self.local_name)).await?;
        if reply.is_completed() {
            // the first line names the server, the rest are keywords
            self.extensions = reply
                .lines
                .iter()
                .skip(1)
                .filter_map(|line| line.split_whitespace().next())
                .map(|word| word.to_ascii_uppercase())
                .collect();
            return Ok(());
        }

        debug!("EHLO rejected, trying HELO. [host={}]", self.host);
        let reply = self.command(&format!("HELO {}", self.local_name)).await?;
        if reply.is_completed() {
            self.extensions.clear();
            Ok(())
        } else {
            Err(AppError::Protocol {
                code: reply.code,
                text: reply.text(),
            })
        }
    }

    async fn command(&mut self, line: &str) -> Result<Reply> {
        debug!("C: {}", line);
        self.write_raw(format!("{}\r\n", line).as_bytes()).await?;
        self.flush().await?;
        self.read_reply().await
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let mut raw = String::new();
        loop {
            let mut line = String::new();
            let read = {
                let stream = self.stream.as_mut().ok_or(AppError::Disconnected)?;
                tokio::time::timeout(self.timeout, read_line(stream, &mut line))
                    .await
                    .map_err(|_| AppError::ConnectionTimeout {
                        host: self.host.clone(),
                        port: self.port,
                    })??
            };
            if read == 0 {
                self.stream = None;
                return Err(AppError::Disconnected);
            }

            debug!("S: {}", line.trim_end());
            raw.push_str(&line);

            // final line: code followed by a space, not a dash
            if line.len() >= 4 && line.as_bytes()[3] == b' ' {
                break;
            }
            if line.len() == 5 && !line.contains('-') {
                // bare "250\r\n" style reply
                break;
            }
        }

        Reply::parse(&raw)
    }

    async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(AppError::Disconnected)?;
        let result = match stream {
            SessionStream::Plain(reader) => reader.get_mut().write_all(data).await,
            SessionStream::Tls(reader) => reader.get_mut().write_all(data).await,
        };
        result.map_err(|_| {
            self.stream = None;
            AppError::Disconnected
        })
    }

    async fn flush(&mut self) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(AppError::Disconnected)?;
        let result = match stream {
            SessionStream::Plain(reader) => reader.get_mut().flush().await,
            SessionStream::Tls(reader) => reader.get_mut().flush().await,
        };
        result.map_err(|_| {
            self.stream = None;
            AppError::Disconnected
        })
    }
}

async fn read_line(stream: &mut SessionStream, buf: &mut String) -> Result<usize> {
    let result = match stream {
        SessionStream::Plain(reader) => reader.read_line(buf).await,
        SessionStream::Tls(reader) => reader.read_line(buf).await,
    };
    result.map_err(|_| AppError::Disconnected)
}

fn session_opened(code: u16) -> bool {
    code == 220
}

/// Byte-stuff the message body for the DATA phase: CRLF line endings
/// and a doubled leading dot.
fn dot_stuff(body: &str) -> String {
    let mut out = String::with_capacity(body.len() + 64);
    for line in body.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out
}

fn tls_connector() -> std::result::Result<TlsConnector, String> {
    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs().map_err(|err| err.to_string())?;
    for cert in native {
        roots
            .add(&rustls::Certificate(cert.0))
            .map_err(|err| err.to_string())?;
    }

    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}
