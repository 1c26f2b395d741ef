//! Login-event data model.
//!
//! A [`LoginEvent`] is built once by the parser from a single source record,
//! enriched with a location by the pipeline, and discarded after dispatch.

use chrono::{DateTime, Utc};

use crate::timeutil::DisplayZone;

/// What the sshd log line reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    LoginSuccess,
    LoginFailed,
    /// Synthetic event used by `sshield test`.
    Test,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::LoginSuccess => "login_success",
            EventType::LoginFailed => "login_failed",
            EventType::Test => "test",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One SSH login event, immutable once the pipeline has enriched it.
#[derive(Debug, Clone)]
pub struct LoginEvent {
    pub kind: EventType,
    /// Login name; `unknown` when the preauth phase never identified one.
    pub user: String,
    /// Source address, IPv4-mapped-IPv6 and zone suffixes stripped.
    pub ip: String,
    /// Source TCP port, 0 when the log line carried none.
    pub port: u16,
    /// `password`, `publickey`, `keyboard-interactive`, `preauth`, or the
    /// raw lowercased token.
    pub method: String,
    pub timestamp: DateTime<Utc>,
    /// Host on which the event occurred (journal `_HOSTNAME` / syslog host).
    pub hostname: String,
    /// Geolocation string; empty or a fixed label for private ranges.
    pub location: String,
    /// Source identifier: a file path or `journald:<unit>`.
    pub log_path: String,
    /// Original raw log payload.
    pub message: String,
}

impl LoginEvent {
    /// The synthetic event sent by `sshield test`.
    pub fn test_event() -> Self {
        LoginEvent {
            kind: EventType::Test,
            user: "sshield".to_string(),
            ip: "127.0.0.1".to_string(),
            port: 0,
            method: "manual".to_string(),
            timestamp: Utc::now(),
            hostname: crate::util::hostname(),
            location: String::new(),
            log_path: "-".to_string(),
            message: "test notification".to_string(),
        }
    }

    /// One-line console summary printed for every processed event.
    pub fn summary_line(&self, zone: &DisplayZone) -> String {
        let port = if self.port > 0 {
            self.port.to_string()
        } else {
            "-".to_string()
        };
        let method = if self.method.is_empty() {
            "-"
        } else {
            self.method.as_str()
        };
        let log_path = if self.log_path.trim().is_empty() {
            "-"
        } else {
            self.log_path.as_str()
        };
        format!(
            "[{}] {} user={} ip={} port={} method={} host={} log_path={}",
            zone.format(self.timestamp),
            self.kind,
            self.user,
            self.ip,
            port,
            method,
            self.hostname,
            log_path,
        )
    }
}
