// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Notification filter stack: type filter → deduper → fail-rate limiter.
//!
//! A rejection here only suppresses the notification; the caller still
//! prints/advances the cursor. Both stateful stages key on the *event*
//! timestamp, not wall clock, so replayed history filters deterministically.
//!
//! sshd at VERBOSE level reports one failed attempt as up to three lines
//! (`Failed password`, `Disconnected from authenticating user`,
//! `Connection closed`); the deduper collapses those. The rate limiter
//! keeps a single scanning host from flooding the channels.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::debugf;
use crate::event::{EventType, LoginEvent};

/// Duplicate window for the same `ip:port:user` failure.
const DEDUPE_WINDOW_SECS: i64 = 5;

/// Entries older than 10 windows are pruned on every update.
const DEDUPE_PRUNE_FACTOR: i32 = 10;

/// Which event types are notified at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotifyOn {
    #[default]
    All,
    Success,
    Failed,
}

impl NotifyOn {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyOn::All => "all",
            NotifyOn::Success => "success",
            NotifyOn::Failed => "failed",
        }
    }
}

impl std::str::FromStr for NotifyOn {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "all" => Ok(NotifyOn::All),
            "success" => Ok(NotifyOn::Success),
            "failed" => Ok(NotifyOn::Failed),
            other => anyhow::bail!("invalid notify-on value {other:?} (use all|success|failed)"),
        }
    }
}

/// Collapses repeated failures for the same `ip:port:user` within a short
/// window.
struct EventDeduper {
    window: Duration,
    seen: HashMap<String, DateTime<Utc>>,
}

impl EventDeduper {
    fn new() -> Self {
        EventDeduper {
            window: Duration::seconds(DEDUPE_WINDOW_SECS),
            seen: HashMap::new(),
        }
    }

    /// True when the event repeats a recently seen failure. Successes never
    /// dedupe (they do not multi-report).
    fn is_duplicate(&mut self, event: &LoginEvent) -> bool {
        if event.kind != EventType::LoginFailed {
            return false;
        }

        let key = format!("{}:{}:{}", event.ip, event.port, event.user);
        if let Some(last_seen) = self.seen.get(&key) {
            if event.timestamp - *last_seen < self.window {
                return true;
            }
        }
        self.seen.insert(key, event.timestamp);

        // Bound the map: drop everything stale by 10 windows.
        let horizon = self.window * DEDUPE_PRUNE_FACTOR;
        let now = event.timestamp;
        self.seen.retain(|_, t| now - *t <= horizon);

        false
    }
}

/// Per-IP cap on failure notifications within a rolling window.
struct FailRateLimiter {
    /// 0 disables the limiter.
    limit: usize,
    window: Duration,
    counts: HashMap<String, Vec<DateTime<Utc>>>,
}

impl FailRateLimiter {
    fn new(limit: usize, window: Duration) -> Self {
        FailRateLimiter {
            limit,
            window,
            counts: HashMap::new(),
        }
    }

    /// True when this failure should be suppressed.
    fn should_limit(&mut self, event: &LoginEvent) -> bool {
        if self.limit == 0 || event.kind != EventType::LoginFailed {
            return false;
        }

        let now = event.timestamp;
        let window = self.window;

        let times = self.counts.entry(event.ip.clone()).or_default();
        times.retain(|t| now - *t < window);

        if times.len() >= self.limit {
            debugf!(
                "fail notifications limited: ip={} reached {} within {}s",
                event.ip,
                self.limit,
                window.num_seconds()
            );
            return true;
        }
        times.push(now);

        // Drop IPs with no activity for two windows.
        self.counts
            .retain(|_, ts| ts.last().is_some_and(|t| now - *t <= window * 2));

        false
    }
}

/// The full filter stack applied per event.
pub struct NotifyFilter {
    notify_on: NotifyOn,
    deduper: EventDeduper,
    limiter: FailRateLimiter,
}

impl NotifyFilter {
    pub fn new(notify_on: NotifyOn, fail_limit: usize, fail_window: Duration) -> Self {
        NotifyFilter {
            notify_on,
            deduper: EventDeduper::new(),
            limiter: FailRateLimiter::new(fail_limit, fail_window),
        }
    }

    /// Whether this event should reach the dispatcher.
    pub fn should_notify(&mut self, event: &LoginEvent) -> bool {
        match self.notify_on {
            NotifyOn::Success if event.kind != EventType::LoginSuccess => return false,
            NotifyOn::Failed if event.kind != EventType::LoginFailed => return false,
            _ => {}
        }

        if self.deduper.is_duplicate(event) {
            debugf!(
                "skipping duplicate event {}@{}:{}",
                event.user,
                event.ip,
                event.port
            );
            return false;
        }

        !self.limiter.should_limit(event)
    }
}
