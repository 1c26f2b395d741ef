// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Minimal async SMTP transport.
//!
//! Dials with a 10-second timeout and runs the whole session under a
//! 30-second deadline. Port 465 means implicit TLS: the handshake happens
//! before any SMTP byte is exchanged (SNI = server host). On other ports
//! the connection upgrades via STARTTLS when the server offers it, and
//! stays plaintext otherwise. AUTH PLAIN runs when advertised and
//! credentials were configured. Any unexpected reply code aborts the
//! session with the server's text.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::debugf;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const SESSION_DEADLINE: Duration = Duration::from_secs(30);

/// Port 465 is SMTPS: TLS from the first byte, never STARTTLS.
pub fn needs_implicit_tls(port: u16) -> bool {
    port == 465
}

/// Connection facts for one delivery.
pub struct SmtpParams<'a> {
    pub server: &'a str,
    pub port: u16,
    pub user: &'a str,
    pub pass: &'a str,
    pub from: &'a str,
    pub to: &'a str,
}

/// Deliver one message. `message` must be a full RFC 5322 payload
/// (headers, blank line, body).
pub async fn send_mail(params: &SmtpParams<'_>, message: &str) -> Result<()> {
    send_mail_opts(params, message, needs_implicit_tls(params.port)).await
}

pub(crate) async fn send_mail_opts(
    params: &SmtpParams<'_>,
    message: &str,
    implicit_tls: bool,
) -> Result<()> {
    match tokio::time::timeout(SESSION_DEADLINE, session(params, message, implicit_tls)).await {
        Ok(result) => result,
        Err(_) => bail!("smtp session deadline ({}s) exceeded", SESSION_DEADLINE.as_secs()),
    }
}

trait Conn: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Conn for T {}

async fn session(params: &SmtpParams<'_>, message: &str, implicit_tls: bool) -> Result<()> {
    let addr = format!("{}:{}", params.server, params.port);
    debugf!("smtp: connecting to {addr}");

    let tcp = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(conn) => conn.with_context(|| format!("failed to connect to smtp server {addr}"))?,
        Err(_) => bail!("timed out connecting to smtp server {addr}"),
    };

    let stream: Box<dyn Conn> = if implicit_tls {
        debugf!("smtp: implicit TLS handshake with {}", params.server);
        Box::new(tls_handshake(tcp, params.server).await?)
    } else {
        Box::new(tcp)
    };

    let mut client = SmtpClient::new(stream);
    client.expect_greeting().await?;

    let local_name = crate::util::hostname();
    let mut caps = client.ehlo(&local_name).await?;

    if !implicit_tls && caps.starttls {
        debugf!("smtp: server offers STARTTLS, upgrading");
        client.command("STARTTLS", &[220]).await?;
        let plain = client.into_inner();
        let tls: Box<dyn Conn> = Box::new(tls_handshake_boxed(plain, params.server).await?);
        client = SmtpClient::new(tls);
        // Capabilities may differ on the encrypted channel.
        caps = client.ehlo(&local_name).await?;
    }

    if !params.user.is_empty() {
        if !caps.auth {
            bail!("smtp server does not support AUTH");
        }
        let creds = base64::engine::general_purpose::STANDARD
            .encode(format!("\0{}\0{}", params.user, params.pass));
        client
            .command(&format!("AUTH PLAIN {creds}"), &[235])
            .await
            .context("smtp auth failed")?;
    }

    client
        .command(&format!("MAIL FROM:<{}>", params.from), &[250])
        .await
        .context("smtp mail from failed")?;
    client
        .command(&format!("RCPT TO:<{}>", params.to), &[250, 251])
        .await
        .context("smtp rcpt to failed")?;
    client.command("DATA", &[354]).await.context("smtp data begin failed")?;
    client.send_data(message).await.context("smtp data write failed")?;
    client.command("QUIT", &[221]).await.context("smtp quit failed")?;

    debugf!("smtp: delivery to {} complete", params.to);
    Ok(())
}

async fn tls_handshake(
    tcp: TcpStream,
    server: &str,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let name = rustls::ServerName::try_from(server)
        .with_context(|| format!("invalid TLS server name {server:?}"))?;
    tls_connector()
        .connect(name, tcp)
        .await
        .context("smtp tls handshake failed")
}

async fn tls_handshake_boxed(
    conn: Box<dyn Conn>,
    server: &str,
) -> Result<tokio_rustls::client::TlsStream<Box<dyn Conn>>> {
    let name = rustls::ServerName::try_from(server)
        .with_context(|| format!("invalid TLS server name {server:?}"))?;
    tls_connector()
        .connect(name, conn)
        .await
        .context("smtp starttls handshake failed")
}

fn tls_connector() -> TlsConnector {
    static CONNECTOR: OnceLock<TlsConnector> = OnceLock::new();
    CONNECTOR
        .get_or_init(|| {
            let mut roots = rustls::RootCertStore::empty();
            roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
                rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                    ta.subject,
                    ta.spki,
                    ta.name_constraints,
                )
            }));
            let config = rustls::ClientConfig::builder()
                .with_safe_defaults()
                .with_root_certificates(roots)
                .with_no_client_auth();
            TlsConnector::from(Arc::new(config))
        })
        .clone()
}

/// What the EHLO reply advertised.
struct Capabilities {
    starttls: bool,
    auth: bool,
}

#[derive(Debug)]
struct SmtpReply {
    code: u16,
    lines: Vec<String>,
}

impl SmtpReply {
    fn text(&self) -> String {
        self.lines.join(" / ")
    }
}

struct SmtpClient {
    stream: BufReader<Box<dyn Conn>>,
}

impl SmtpClient {
    fn new(conn: Box<dyn Conn>) -> Self {
        SmtpClient {
            stream: BufReader::new(conn),
        }
    }

    fn into_inner(self) -> Box<dyn Conn> {
        self.stream.into_inner()
    }

    async fn expect_greeting(&mut self) -> Result<()> {
        let reply = self.read_reply().await?;
        if reply.code != 220 {
            bail!("unexpected smtp greeting: {} {}", reply.code, reply.text());
        }
        Ok(())
    }

    async fn ehlo(&mut self, local_name: &str) -> Result<Capabilities> {
        let reply = self.command(&format!("EHLO {local_name}"), &[250]).await?;
        let mut caps = Capabilities {
            starttls: false,
            auth: false,
        };
        for line in &reply.lines {
            let upper = line.to_uppercase();
            if upper == "STARTTLS" {
                caps.starttls = true;
            }
            if upper == "AUTH" || upper.starts_with("AUTH ") {
                caps.auth = true;
            }
        }
        Ok(caps)
    }

    /// Send one command line and expect one of the given reply codes.
    async fn command(&mut self, line: &str, expect: &[u16]) -> Result<SmtpReply> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;

        let reply = self.read_reply().await?;
        if !expect.contains(&reply.code) {
            let verb = line.split_whitespace().next().unwrap_or(line);
            bail!("{} rejected: {} {}", verb, reply.code, reply.text());
        }
        Ok(reply)
    }

    /// Transmit the message payload after a 354 and wait for the 250.
    async fn send_data(&mut self, message: &str) -> Result<()> {
        let payload = dot_stuff(message);
        self.stream.write_all(payload.as_bytes()).await?;
        self.stream.write_all(b".\r\n").await?;
        self.stream.flush().await?;

        let reply = self.read_reply().await?;
        if reply.code != 250 {
            bail!("message rejected: {} {}", reply.code, reply.text());
        }
        Ok(())
    }

    /// Read one (possibly multi-line) reply.
    async fn read_reply(&mut self) -> Result<SmtpReply> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = self.stream.read_line(&mut line).await?;
            if n == 0 {
                bail!("smtp server closed the connection");
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.len() < 3 {
                bail!("malformed smtp reply {line:?}");
            }
            let code: u16 = line[..3]
                .parse()
                .with_context(|| format!("malformed smtp reply {line:?}"))?;
            let more = line.as_bytes().get(3) == Some(&b'-');
            lines.push(line.get(4..).unwrap_or("").to_string());
            if !more {
                return Ok(SmtpReply { code, lines });
            }
        }
    }
}

/// Normalize line endings to CRLF and double leading dots (RFC 5321 §4.5.2).
fn dot_stuff(message: &str) -> String {
    let mut out = String::with_capacity(message.len() + 16);
    for line in message.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    // split('\n') on a trailing newline yields a final empty segment that
    // would add a blank line; drop it.
    if message.ends_with('\n') {
        out.truncate(out.len() - 2);
    }
    out
}
