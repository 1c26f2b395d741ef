// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Stateless translation of raw sshd log lines into [`LoginEvent`]s.
//!
//! Two entry points: [`parse_journal_message`] takes a bare sshd payload
//! (the journal's `MESSAGE` field) with an externally supplied timestamp,
//! and [`parse_auth_log_line`] handles the syslog wrapping of flat auth
//! files (`Jan  2 10:00:00 host sshd[123]: <payload>`), inferring the year.
//!
//! Non-matching lines yield `None` and are dropped by the caller.

use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use regex::Regex;

use crate::event::{EventType, LoginEvent};

/// "Accepted publickey for root from 1.2.3.4 port 5555 ssh2"
static SUCCESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Accepted (\S+) for (\S+) from ([^ ]+) port (\d+)").unwrap());

/// "Failed password for [invalid user ]bob from 9.9.9.9 port 22 ssh2"
static FAILED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Failed (\S+) for (?:invalid user )?(\S+) from ([^ ]+) port (\d+)").unwrap()
});

/// "Disconnected from authenticating user root 1.1.1.1 port 51819 [preauth]"
static DISCONNECT_AUTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Disconnected from authenticating user (\S+) ([^ ]+) port (\d+)").unwrap()
});

/// "Connection closed by [authenticating user root ]1.1.1.1 port 25124 [preauth]"
static CONNECTION_CLOSED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Connection closed by (?:authenticating user (\S+) )?([^ ]+) port (\d+)").unwrap()
});

/// Syslog wrapper: month, day, clock, host, sshd payload.
static SYSLOG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec)\s+(\d{1,2})\s+(\d{2}:\d{2}:\d{2})\s+([^ ]+)\s+sshd(?:\[[^\]]*\])?:\s+(.*)$",
    )
    .unwrap()
});

/// Strip the IPv4-mapped-IPv6 prefix and any zone suffix from an address.
pub fn strip_address(addr: &str) -> String {
    let addr = addr.strip_prefix("::ffff:").unwrap_or(addr);
    match addr.find('%') {
        Some(idx) => addr[..idx].to_string(),
        None => addr.to_string(),
    }
}

/// Collapse sshd method tokens to their canonical lowercase form.
pub fn normalize_method(method: &str) -> String {
    let method = method.to_lowercase();
    match method.as_str() {
        "keyboard-interactive/pam" => "keyboard-interactive".to_string(),
        _ => method,
    }
}

fn build_event(
    kind: EventType,
    user: &str,
    ip: &str,
    method: &str,
    port: &str,
    ts: DateTime<Utc>,
    host: &str,
    message: &str,
) -> LoginEvent {
    LoginEvent {
        kind,
        user: user.to_string(),
        ip: strip_address(ip),
        port: port.parse().unwrap_or(0),
        method: method.to_string(),
        timestamp: ts,
        hostname: host.to_string(),
        location: String::new(),
        log_path: String::new(),
        message: message.to_string(),
    }
}

/// Parse a bare sshd payload. Returns `None` for anything that is not a
/// recognized login success or failure.
pub fn parse_journal_message(message: &str, host: &str, ts: DateTime<Utc>) -> Option<LoginEvent> {
    if message.is_empty() {
        return None;
    }

    if let Some(m) = SUCCESS_RE.captures(message) {
        return Some(build_event(
            EventType::LoginSuccess,
            &m[2],
            &m[3],
            &normalize_method(&m[1]),
            &m[4],
            ts,
            host,
            message,
        ));
    }

    if let Some(m) = FAILED_RE.captures(message) {
        return Some(build_event(
            EventType::LoginFailed,
            &m[2],
            &m[3],
            &normalize_method(&m[1]),
            &m[4],
            ts,
            host,
            message,
        ));
    }

    // Disconnect during authentication: visible at the default LogLevel,
    // classified as a failure with method `preauth`.
    if let Some(m) = DISCONNECT_AUTH_RE.captures(message) {
        return Some(build_event(
            EventType::LoginFailed,
            &m[1],
            &m[2],
            "preauth",
            &m[3],
            ts,
            host,
            message,
        ));
    }

    // Connection closed before authentication completed. Only counted when
    // sshd tagged the line [preauth]; the user may be absent.
    if message.contains("[preauth]") {
        if let Some(m) = CONNECTION_CLOSED_RE.captures(message) {
            let user = m.get(1).map(|u| u.as_str()).unwrap_or("unknown");
            return Some(build_event(
                EventType::LoginFailed,
                user,
                &m[2],
                "preauth",
                &m[3],
                ts,
                host,
                message,
            ));
        }
    }

    None
}

/// Parse one flat-file syslog line. The timestamp is interpreted in the
/// host's local zone; see [`resolve_syslog_timestamp`] for the year rule.
pub fn parse_auth_log_line(line: &str) -> Option<LoginEvent> {
    parse_auth_log_line_at(line, chrono::Local::now())
}

fn parse_auth_log_line_at<Z: TimeZone>(line: &str, now: DateTime<Z>) -> Option<LoginEvent> {
    if line.is_empty() {
        return None;
    }

    let m = SYSLOG_RE.captures(line)?;
    let month = month_number(&m[1])?;
    let day: u32 = m[2].parse().ok()?;
    let clock = &m[3];
    let host = &m[4];
    let message = &m[5];

    let ts = resolve_syslog_timestamp(month, day, clock, now)?;
    parse_journal_message(message, host, ts)
}

/// Attach a year to a syslog `Mon DD HH:MM:SS` stamp.
///
/// The current year is assumed; a result more than 24 hours in the future
/// means the line crossed a year boundary (December log read in January)
/// and is rolled back by one year.
fn resolve_syslog_timestamp<Z: TimeZone>(
    month: u32,
    day: u32,
    clock: &str,
    now: DateTime<Z>,
) -> Option<DateTime<Utc>> {
    let time = NaiveTime::parse_from_str(clock, "%H:%M:%S").ok()?;
    let zone = now.timezone();
    let year = now.year();

    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_time(time);
    let ts = zone.from_local_datetime(&naive).earliest()?;
    let ts = ts.with_timezone(&Utc);

    if ts > now.with_timezone(&Utc) + Duration::hours(24) {
        let naive = NaiveDate::from_ymd_opt(year - 1, month, day)?.and_time(time);
        let ts = zone.from_local_datetime(&naive).earliest()?;
        return Some(ts.with_timezone(&Utc));
    }

    Some(ts)
}

fn month_number(name: &str) -> Option<u32> {
    let n = match name {
        "Jan" => 1,
        "Feb" => 2,
        "Mar" => 3,
        "Apr" => 4,
        "May" => 5,
        "Jun" => 6,
        "Jul" => 7,
        "Aug" => 8,
        "Sep" => 9,
        "Oct" => 10,
        "Nov" => 11,
        "Dec" => 12,
        _ => return None,
    };
    Some(n)
}
