// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Watch/sweep orchestration and the per-event dispatch pipeline.
//!
//! One record is fully processed — enriched, filtered, dispatched, cursor
//! saved — before the next is read. Channel config is re-read from disk on
//! every dispatch so runtime edits apply without a restart. A channel
//! failure is logged and aggregated; it never blocks the other channels or
//! the cursor, so the pipeline trades exactly-once for liveness.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::channels::{ChannelConfig, ChannelKind, ChannelStore};
use crate::cursor::{default_cursor_path, CursorStore, SourceState};
use crate::curl::CurlNotifier;
use crate::email::EmailNotifier;
use crate::event::LoginEvent;
use crate::filter::{NotifyFilter, NotifyOn};
use crate::source::{self, SelectedSource};
use crate::template::EventContext;
use crate::timeutil::DisplayZone;
use crate::{geoip, journal, logfile};

/// Settings for follow mode.
pub struct WatchOptions {
    pub state_file: Option<PathBuf>,
    pub source: String,
    pub journal_units: Vec<String>,
    pub log_paths: Vec<String>,
    pub poll: Duration,
    pub zone: DisplayZone,
    pub notify_on: NotifyOn,
    pub fail_limit: usize,
    pub fail_window: Duration,
    pub channels: ChannelStore,
}

/// Settings for one-shot sweep mode.
pub struct SweepOptions {
    pub state_file: Option<PathBuf>,
    pub source: String,
    pub journal_units: Vec<String>,
    pub log_paths: Vec<String>,
    pub since: Duration,
    pub notify: bool,
    pub zone: DisplayZone,
    pub notify_on: NotifyOn,
    pub fail_limit: usize,
    pub fail_window: Duration,
    pub channels: ChannelStore,
}

/// How the cursor moves after one event.
pub enum Advance {
    /// Record the journal cursor and save immediately.
    Journal(String),
    /// Record a file offset and save immediately (follow mode).
    File { path: String, offset: i64 },
    /// Track the high-water offset in memory; the sweep saves once at the
    /// end.
    FileDeferred { path: String, offset: i64 },
}

/// Shared per-event processing used by both sources.
pub struct Pipeline {
    pub store: CursorStore,
    pub state: SourceState,
    pub filter: NotifyFilter,
    pub zone: DisplayZone,
    /// Whether `Send` runs at all (sweep may print without notifying).
    pub notify: bool,
    /// Sweep prints every parsed event; watch only the ones that pass.
    pub print_all: bool,
    /// Sweep lookback: events older than this are dropped (cursor still
    /// advances).
    pub cutoff: Option<DateTime<Utc>>,
    pub channels: ChannelStore,
}

impl Pipeline {
    /// Process one parsed event and advance the cursor.
    pub async fn handle(&mut self, mut event: LoginEvent, advance: Advance) {
        if let Some(cutoff) = self.cutoff {
            if event.timestamp < cutoff {
                self.advance(advance);
                return;
            }
        }

        event.location = geoip::lookup(&event.ip).await;

        // The filter stack runs even when notifications are off, so a
        // non-notifying sweep mirrors what a notifying run would send.
        let passed = self.filter.should_notify(&event);

        if self.notify && passed {
            if let Err(e) = dispatch_event(&self.channels, &event, &self.zone).await {
                eprintln!("failed to send notification: {e:#}");
            }
        }

        if passed || self.print_all {
            println!("{}", event.summary_line(&self.zone));
        }

        self.advance(advance);
    }

    /// Move the cursor without processing (historical events, cutoff).
    pub fn advance(&mut self, advance: Advance) {
        match advance {
            Advance::Journal(cursor) => {
                self.state.journal_cursor = cursor;
                self.persist();
            }
            Advance::File { path, offset } => {
                self.state.file_offsets.insert(path, offset);
                self.persist();
            }
            Advance::FileDeferred { path, offset } => {
                let slot = self.state.file_offsets.entry(path).or_insert(0);
                if offset > *slot {
                    *slot = offset;
                }
            }
        }
    }

    /// Write the cursor file; a failure is logged, not fatal (events may
    /// replay after a restart).
    pub fn persist(&mut self) {
        if let Err(e) = self.store.save(&self.state) {
            eprintln!("failed to save cursor state: {e:#}");
        }
    }
}

/// Follow the selected source until cancelled.
pub async fn run_watch(cancel: CancellationToken, opts: WatchOptions) -> Result<()> {
    let poll = if opts.poll.is_zero() {
        Duration::from_secs(5)
    } else {
        opts.poll
    };

    let state_path = match opts.state_file {
        Some(path) => path,
        None => default_cursor_path()?,
    };
    let store = CursorStore::new(state_path)?;
    let state = store.load()?;

    let selection = source::determine_source(
        &opts.source,
        &opts.journal_units,
        &opts.log_paths,
        &state,
        None,
        true,
    )
    .await?;

    println!(">>> watch mode: {}", selection.description);
    if opts.notify_on != NotifyOn::All {
        println!(">>> notify filter: {}", opts.notify_on.as_str());
    }
    if opts.fail_limit > 0 {
        println!(
            ">>> fail limit: {} per IP / {}s",
            opts.fail_limit,
            opts.fail_window.as_secs()
        );
    }

    let mut pipeline = Pipeline {
        store,
        state,
        filter: NotifyFilter::new(
            opts.notify_on,
            opts.fail_limit,
            chrono::Duration::from_std(opts.fail_window).unwrap_or_else(|_| chrono::Duration::hours(1)),
        ),
        zone: opts.zone,
        notify: true,
        print_all: false,
        cutoff: None,
        channels: opts.channels,
    };

    match selection.source {
        SelectedSource::Journal(units) => {
            journal::run(&cancel, &mut pipeline, &units, true, None).await
        }
        SelectedSource::File(path) => logfile::follow(&cancel, &mut pipeline, &path, poll).await,
    }
}

/// One-shot scan of records newer than the lookback.
pub async fn run_sweep(cancel: CancellationToken, opts: SweepOptions) -> Result<()> {
    let state_path = match opts.state_file {
        Some(path) => path,
        None => default_cursor_path()?,
    };
    let store = CursorStore::new(state_path)?;
    let state = store.load()?;

    let since = (!opts.since.is_zero()).then_some(opts.since);
    let selection = source::determine_source(
        &opts.source,
        &opts.journal_units,
        &opts.log_paths,
        &state,
        since,
        false,
    )
    .await?;

    println!(">>> sweep mode: {}", selection.description);
    if opts.notify && opts.notify_on != NotifyOn::All {
        println!(">>> notify filter: {}", opts.notify_on.as_str());
    }
    if opts.notify && opts.fail_limit > 0 {
        println!(
            ">>> fail limit: {} per IP / {}s",
            opts.fail_limit,
            opts.fail_window.as_secs()
        );
    }

    let mut pipeline = Pipeline {
        store,
        state,
        filter: NotifyFilter::new(
            opts.notify_on,
            opts.fail_limit,
            chrono::Duration::from_std(opts.fail_window).unwrap_or_else(|_| chrono::Duration::hours(1)),
        ),
        zone: opts.zone,
        notify: opts.notify,
        print_all: true,
        cutoff: None,
        channels: opts.channels,
    };

    match selection.source {
        SelectedSource::Journal(units) => {
            journal::run(&cancel, &mut pipeline, &units, false, since).await
        }
        SelectedSource::File(path) => logfile::sweep(&cancel, &mut pipeline, &path, since).await,
    }
}

/// Fan one event out across every enabled channel.
///
/// The config file is reloaded here, per event. Missing config or zero
/// enabled channels is a silent no-op. Each channel's failure is collected;
/// the others still run.
pub async fn dispatch_event(
    channels: &ChannelStore,
    event: &LoginEvent,
    zone: &DisplayZone,
) -> Result<()> {
    let Some(cfg) = channels.load().context("failed to load notification config")? else {
        return Ok(());
    };

    let enabled: Vec<&ChannelConfig> = cfg.enabled_channels().collect();
    if enabled.is_empty() {
        return Ok(());
    }

    let mut errors = Vec::new();
    for ch in enabled {
        if let Err(e) = send_to_channel(ch, event, zone).await {
            errors.push(format!("channel {}: {e:#}", ch.display_name()));
        }
    }

    if !errors.is_empty() {
        bail!("{}", errors.join("; "));
    }
    Ok(())
}

async fn send_to_channel(ch: &ChannelConfig, event: &LoginEvent, zone: &DisplayZone) -> Result<()> {
    match ch.kind {
        ChannelKind::Curl => {
            let curl = ch.curl.as_ref().context("curl config is empty")?;
            let notifier = CurlNotifier::new(&curl.command)?;
            let ctx = EventContext::new(event, zone);
            notifier.send(&ctx).await
        }
        ChannelKind::Email => {
            let email = ch.email.as_ref().context("email config is empty")?;
            EmailNotifier::from_channel(email).send(event, zone).await
        }
    }
}

/// Send a test event through every enabled channel (`sshield test`).
pub async fn send_test_notification(channels: &ChannelStore, zone: &DisplayZone) -> Result<()> {
    let cfg = channels
        .load()?
        .context("notification is not configured")?;
    if cfg.enabled_channels().next().is_none() {
        bail!("no enabled notification channel");
    }
    let event = LoginEvent::test_event();
    dispatch_event(channels, &event, zone).await
}
