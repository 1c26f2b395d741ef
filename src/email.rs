//! Email channel: message composition and delivery.
//!
//! The message is plain text (UTF-8) with a subject carrying the event
//! type and a body listing every event field. `To`/`From` are rejected
//! before any connection when they contain CR/LF (header injection).

use anyhow::{bail, Result};

use crate::channels::EmailChannel;
use crate::event::LoginEvent;
use crate::smtp::{self, SmtpParams};
use crate::timeutil::DisplayZone;

/// One configured email channel.
pub struct EmailNotifier {
    to: String,
    from: String,
    server: String,
    port: u16,
    user: String,
    pass: String,
}

impl EmailNotifier {
    pub fn from_channel(ch: &EmailChannel) -> Self {
        EmailNotifier {
            to: ch.to.clone(),
            from: ch.from.clone(),
            server: ch.server.clone(),
            port: ch.port,
            user: ch.user.clone(),
            pass: ch.pass.clone(),
        }
    }

    pub async fn send(&self, event: &LoginEvent, zone: &DisplayZone) -> Result<()> {
        reject_crlf(&self.to)?;
        reject_crlf(&self.from)?;

        let message = compose_message(&self.to, &self.from, event, zone);
        let params = SmtpParams {
            server: &self.server,
            port: self.port,
            user: &self.user,
            pass: &self.pass,
            from: &self.from,
            to: &self.to,
        };
        smtp::send_mail(&params, &message).await
    }
}

fn reject_crlf(line: &str) -> Result<()> {
    if line.contains('\r') || line.contains('\n') {
        bail!("smtp address contains CR/LF");
    }
    Ok(())
}

fn compose_message(to: &str, from: &str, event: &LoginEvent, zone: &DisplayZone) -> String {
    let subject = format!("SSH login alert - {}", event.kind);

    let dash_if_empty = |s: &str| {
        if s.trim().is_empty() {
            "-".to_string()
        } else {
            s.to_string()
        }
    };
    let port = if event.port > 0 {
        event.port.to_string()
    } else {
        "-".to_string()
    };
    let message = if event.message.is_empty() {
        "(no raw log line)".to_string()
    } else {
        event.message.clone()
    };

    let body = format!(
        "SSH login alert\r\n\
         -------------------\r\n\
         Event:     {}\r\n\
         Host:      {}\r\n\
         User:      {}\r\n\
         Source IP: {}\r\n\
         Port:      {}\r\n\
         Method:    {}\r\n\
         Location:  {}\r\n\
         Time:      {}\r\n\
         Log path:  {}\r\n\
         Log line:  {}\r\n",
        event.kind,
        event.hostname,
        event.user,
        dash_if_empty(&event.ip),
        port,
        dash_if_empty(&event.method),
        dash_if_empty(&event.location),
        zone.format_rfc3339(event.timestamp),
        dash_if_empty(&event.log_path),
        message,
    );

    format!(
        "To: {to}\r\n\
         From: {from}\r\n\
         Subject: {subject}\r\n\
         Content-Type: text/plain; charset=UTF-8\r\n\
         \r\n\
         {body}"
    )
}
