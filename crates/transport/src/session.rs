//! One authenticated NNTP session over TCP or TLS.
//!
//! A session is exclusive-use: no internal locking, the pool guarantees a
//! single owner for the duration of an operation. Every command runs under
//! a timeout; full-article transfers scale the timeout with payload size.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{rustls, TlsConnector};
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use common::{MessageId, ServerProfile};

use crate::error::{Result, TransportError};
use crate::response::Response;

/// Suggested Message-ID for a POST. The server may assign its own; when it
/// echoes only the `<posted>` placeholder this one is the retrievable id,
/// because the article was accepted carrying it in its headers.
pub fn suggest_message_id(domain: &str) -> String {
    format!("<{}@{}>", Uuid::new_v4().simple(), domain)
}

#[derive(Debug)]
enum Stream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[derive(Debug)]
pub struct NntpSession {
    io: BufReader<Stream>,
    profile: ServerProfile,
    current_group: Option<String>,
    capabilities: Vec<String>,
}

async fn io_timeout<T>(
    duration: Duration,
    operation: &'static str,
    fut: impl std::future::Future<Output = std::io::Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(duration, fut).await {
        Ok(inner) => Ok(inner?),
        Err(_) => Err(TransportError::Timeout { operation }),
    }
}

/// Escape lines starting with `.` per the POST convention and terminate
/// the body with the lone-dot line.
fn dot_stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 16);
    for line in body.split_inclusive(|&b| b == b'\n') {
        if line.first() == Some(&b'.') {
            out.push(b'.');
        }
        out.extend_from_slice(line);
    }
    if !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

impl NntpSession {
    /// Connect, handshake TLS when configured, consume the greeting, and
    /// authenticate.
    #[instrument(skip(profile), fields(host = %profile.host, port = profile.port))]
    pub async fn connect(profile: &ServerProfile) -> Result<Self> {
        let tcp = match tokio::time::timeout(
            profile.connect_timeout(),
            TcpStream::connect((profile.host.as_str(), profile.port)),
        )
        .await
        {
            Ok(conn) => conn?,
            Err(_) => return Err(TransportError::Timeout { operation: "connect" }),
        };
        tcp.set_nodelay(true)?;

        let stream = if profile.tls {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let config = rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            let connector = TlsConnector::from(Arc::new(config));
            let server_name = ServerName::try_from(profile.host.clone())
                .map_err(|e| TransportError::Tls(e.to_string()))?;
            let tls = match tokio::time::timeout(
                profile.connect_timeout(),
                connector.connect(server_name, tcp),
            )
            .await
            {
                Ok(conn) => conn.map_err(|e| TransportError::Tls(e.to_string()))?,
                Err(_) => return Err(TransportError::Timeout { operation: "tls handshake" }),
            };
            Stream::Tls(Box::new(tls))
        } else {
            Stream::Plain(tcp)
        };

        let mut session = Self {
            io: BufReader::new(stream),
            profile: profile.clone(),
            current_group: None,
            capabilities: Vec::new(),
        };

        let greeting = session.read_response("greeting").await?;
        if !matches!(greeting.code, 200 | 201) {
            return Err(TransportError::classify("greeting", greeting.code, greeting.message));
        }

        session.authenticate().await?;
        session.load_capabilities().await;
        session.validate_article_limit()?;
        debug!("nntp session established");
        Ok(session)
    }

    async fn authenticate(&mut self) -> Result<()> {
        let (Some(user), Some(pass)) = (
            self.profile.username.clone(),
            self.profile.password.clone(),
        ) else {
            return Ok(());
        };
        let response = self
            .command(&format!("AUTHINFO USER {user}"), "authinfo")
            .await?;
        match response.code {
            281 => return Ok(()),
            381 => {}
            code => return Err(TransportError::classify("AUTHINFO", code, response.message)),
        }
        let response = self
            .command(&format!("AUTHINFO PASS {pass}"), "authinfo")
            .await?;
        if response.code != 281 {
            return Err(TransportError::classify("AUTHINFO", response.code, response.message));
        }
        Ok(())
    }

    async fn load_capabilities(&mut self) {
        // Capability discovery is best-effort; old servers answer 500 here.
        let Ok(response) = self.command("CAPABILITIES", "capabilities").await else {
            return;
        };
        if response.code != 101 {
            return;
        }
        if let Ok(block) = self.read_multiline(self.profile.command_timeout()).await {
            self.capabilities = String::from_utf8_lossy(&block)
                .lines()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect();
        }
    }

    /// First-connect validation of the configured article size against the
    /// server's advertised limit, when it advertises one.
    fn validate_article_limit(&self) -> Result<()> {
        for cap in &self.capabilities {
            let mut parts = cap.split_whitespace();
            if parts.next().map(|w| w.eq_ignore_ascii_case("MAXARTSIZE")) == Some(true) {
                if let Some(limit) = parts.next().and_then(|v| v.parse::<usize>().ok()) {
                    // yEnc expands ~2% plus headers; require slack.
                    let needed = self.profile.max_article + self.profile.max_article / 32 + 2048;
                    if needed > limit {
                        return Err(TransportError::ArticleTooLarge { limit });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    async fn read_response(&mut self, operation: &'static str) -> Result<Response> {
        let line = self.read_line(self.profile.command_timeout(), operation).await?;
        Response::parse(&line)
    }

    async fn read_line(&mut self, duration: Duration, operation: &'static str) -> Result<String> {
        let mut raw = Vec::new();
        let n = io_timeout(duration, operation, self.io.read_until(b'\n', &mut raw)).await?;
        if n == 0 {
            return Err(TransportError::ConnectionClosed);
        }
        trace!(line = %String::from_utf8_lossy(&raw).trim_end(), "<<");
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    async fn command(&mut self, cmd: &str, operation: &'static str) -> Result<Response> {
        trace!(%cmd, ">>");
        let timeout = self.profile.command_timeout();
        io_timeout(timeout, operation, async {
            self.io.write_all(cmd.as_bytes()).await?;
            self.io.write_all(b"\r\n").await?;
            self.io.flush().await
        })
        .await?;
        self.read_response(operation).await
    }

    /// Read a dot-terminated block, undoing dot-stuffing. The terminating
    /// `.` line is not included.
    async fn read_multiline(&mut self, duration: Duration) -> Result<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + duration;
        let mut out = Vec::new();
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(TransportError::Timeout { operation: "multiline read" })?;
            let mut raw = Vec::new();
            let n = io_timeout(remaining, "multiline read", self.io.read_until(b'\n', &mut raw))
                .await?;
            if n == 0 {
                return Err(TransportError::ConnectionClosed);
            }
            if raw == b".\r\n" || raw == b".\n" {
                return Ok(out);
            }
            if raw.first() == Some(&b'.') {
                out.extend_from_slice(&raw[1..]);
            } else {
                out.extend_from_slice(&raw);
            }
        }
    }

    /// `GROUP`; cached per session.
    pub async fn select_group(&mut self, name: &str) -> Result<()> {
        if self.current_group.as_deref() == Some(name) {
            return Ok(());
        }
        let response = self.command(&format!("GROUP {name}"), "group").await?;
        if response.code != 211 {
            return Err(TransportError::classify("GROUP", response.code, response.message));
        }
        self.current_group = Some(name.to_string());
        Ok(())
    }

    /// POST an article and return its Message-ID: the server-assigned one
    /// from the 240 response when it is concrete, otherwise the suggested
    /// id the article was submitted under.
    #[instrument(skip(self, extra_headers, body), fields(subject, body_len = body.len()))]
    pub async fn post(
        &mut self,
        subject: &str,
        extra_headers: &[(&str, String)],
        body: &[u8],
    ) -> Result<MessageId> {
        if body.len() > self.profile.max_article + self.profile.max_article / 32 + 2048 {
            return Err(TransportError::ArticleTooLarge {
                limit: self.profile.max_article,
            });
        }

        let response = self.command("POST", "post").await?;
        if response.code != 340 {
            return Err(TransportError::classify("POST", response.code, response.message));
        }

        let suggested = suggest_message_id(&self.profile.host);
        let mut article = Vec::with_capacity(body.len() + 512);
        article.extend_from_slice(
            format!(
                "From: {}\r\nNewsgroups: {}\r\nSubject: {}\r\nMessage-ID: {}\r\nX-UsenetSync-Version: 1\r\n",
                self.profile.posting_identity, self.profile.group, subject, suggested
            )
            .as_bytes(),
        );
        for (name, value) in extra_headers {
            article.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        article.extend_from_slice(b"\r\n");
        article.extend_from_slice(&dot_stuff(body));

        let timeout = self.profile.transfer_timeout(article.len());
        io_timeout(timeout, "post transfer", async {
            self.io.write_all(&article).await?;
            self.io.flush().await
        })
        .await?;

        let line = self.read_line(timeout, "post ack").await?;
        let ack = Response::parse(&line)?;
        if ack.code != 240 {
            return Err(TransportError::classify("POST", ack.code, ack.message));
        }

        let assigned = ack
            .angle_token()
            .filter(|tok| *tok != "<posted>")
            .and_then(MessageId::parse);
        let message_id = match assigned {
            Some(id) => id,
            None => MessageId::parse(&suggested)
                .ok_or_else(|| TransportError::Protocol("unusable message id".to_string()))?,
        };
        debug!(%message_id, "article posted");
        Ok(message_id)
    }

    /// `ARTICLE <id>`: returns the body (bytes after the header block).
    pub async fn fetch(&mut self, message_id: &MessageId) -> Result<Vec<u8>> {
        let response = self
            .command(&format!("ARTICLE {}", message_id.as_str()), "article")
            .await?;
        if response.code != 220 {
            return Err(TransportError::classify("ARTICLE", response.code, response.message));
        }
        let timeout = self.profile.transfer_timeout(self.profile.max_article);
        let full = self.read_multiline(timeout).await?;

        // Headers end at the first blank line.
        let split = full
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|p| p + 4)
            .or_else(|| full.windows(2).position(|w| w == b"\n\n").map(|p| p + 2))
            .ok_or_else(|| TransportError::Protocol("article without header split".to_string()))?;
        Ok(full[split..].to_vec())
    }

    /// `STAT <id>`: existence check without transfer.
    pub async fn exists(&mut self, message_id: &MessageId) -> Result<bool> {
        let response = self
            .command(&format!("STAT {}", message_id.as_str()), "stat")
            .await?;
        match response.code {
            223 => Ok(true),
            430 => Ok(false),
            code => Err(TransportError::classify("STAT", code, response.message)),
        }
    }

    /// Polite shutdown; errors are irrelevant at this point.
    pub async fn quit(mut self) {
        let _ = self.command("QUIT", "quit").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_stuffing_escapes_and_terminates() {
        let body = b".leading dot\r\nplain line\r\n..double\r\n";
        let stuffed = dot_stuff(body);
        let text = String::from_utf8(stuffed).unwrap();
        assert!(text.starts_with("..leading dot\r\n"));
        assert!(text.contains("\r\nplain line\r\n"));
        assert!(text.contains("\r\n...double\r\n"));
        assert!(text.ends_with("\r\n.\r\n"));
    }

    #[test]
    fn suggested_ids_are_concrete() {
        let id = suggest_message_id("news.example.com");
        let parsed = MessageId::parse(&id).unwrap();
        assert!(parsed.as_str().ends_with("@news.example.com>"));
        assert_ne!(suggest_message_id("h"), suggest_message_id("h"));
    }
}
