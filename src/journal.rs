// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! systemd-journal source.
//!
//! `journalctl` is spawned as a subprocess (`-o json`, line-delimited)
//! rather than linking a journal library, keeping the daemon statically
//! linkable. The child's stdout pipe is the stream; its lifetime is tied
//! to the cancellation token, and its exit surfaces at end-of-stream.
//!
//! Resume: `--after-cursor <saved>`. Cold start in follow mode uses
//! `--since now`, and events older than start − 1 minute are skipped (the
//! cursor still advances) so a fresh watcher does not replay old backlog.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::debugf;
use crate::parser;
use crate::watcher::{Advance, Pipeline};

/// Tolerance for replayed history on a cold start in follow mode.
const HISTORY_TOLERANCE_SECS: i64 = 60;

/// Probe window when there is no cursor to resume from.
const DEFAULT_PROBE_WINDOW: Duration = Duration::from_secs(30 * 60);

/// One `journalctl -o json` record, reduced to the fields we read.
#[derive(Debug, Default, Deserialize)]
pub struct JournalRecord {
    #[serde(default, rename = "__CURSOR")]
    pub cursor: String,
    #[serde(default, rename = "MESSAGE")]
    pub message: String,
    #[serde(default, rename = "_HOSTNAME")]
    pub hostname: String,
    #[serde(default, rename = "__REALTIME_TIMESTAMP")]
    pub realtime: String,
    #[serde(default, rename = "_SYSTEMD_UNIT")]
    pub unit: String,
}

/// Decode `__REALTIME_TIMESTAMP` (microseconds since epoch). Missing or
/// malformed values fall back to now.
pub fn parse_realtime(raw: &str) -> DateTime<Utc> {
    raw.parse::<i64>()
        .ok()
        .and_then(|micros| Utc.timestamp_micros(micros).single())
        .unwrap_or_else(Utc::now)
}

/// Arguments for the streaming invocation.
pub fn stream_args(
    units: &[String],
    cursor: &str,
    follow: bool,
    since_time: Option<&str>,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["--no-pager".into(), "-o".into(), "json".into()];
    if follow {
        args.push("--follow".into());
    }
    for unit in units {
        args.push("-u".into());
        args.push(unit.clone());
    }
    if let Some(since) = since_time {
        // A sweep lookback always re-reads by time, ignoring the cursor.
        args.push("--since".into());
        args.push(since.into());
    } else if !cursor.is_empty() {
        args.push("--after-cursor".into());
        args.push(cursor.into());
    } else if follow {
        args.push("--since".into());
        args.push("now".into());
    }
    args
}

/// Arguments for the recency probe (`-n 200`, newest records only).
pub fn probe_args(units: &[String], cursor: &str, since: Option<Duration>) -> Vec<String> {
    let mut args: Vec<String> =
        vec!["--no-pager".into(), "-n".into(), "200".into(), "-o".into(), "json".into()];
    if !cursor.is_empty() && since.is_none() {
        args.push("--after-cursor".into());
        args.push(cursor.into());
    } else {
        args.push("--since".into());
        args.push(format_since(since.unwrap_or(DEFAULT_PROBE_WINDOW)));
    }
    for unit in units {
        args.push("-u".into());
        args.push(unit.clone());
    }
    args
}

/// `journalctl --since` wants local wall-clock time.
fn format_since(window: Duration) -> String {
    let lookback =
        chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
    let t = chrono::Local::now() - lookback;
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Stream the journal through the pipeline until cancellation (follow) or
/// end of records (sweep).
pub async fn run(
    cancel: &CancellationToken,
    pipeline: &mut Pipeline,
    units: &[String],
    follow: bool,
    since: Option<Duration>,
) -> Result<()> {
    if crate::util::binary_on_path("journalctl").is_none() {
        bail!("journalctl not found; this system does not appear to provide the systemd journal");
    }

    let since_str = (!follow)
        .then(|| since.map(format_since))
        .flatten();
    let args = stream_args(units, &pipeline.state.journal_cursor, follow, since_str.as_deref());
    debugf!("starting journalctl {}", args.join(" "));

    let mut skip_historical =
        follow && pipeline.state.journal_cursor.is_empty() && since.is_none();

    let mut child = tokio::process::Command::new("journalctl")
        .args(&args)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .context("failed to start journalctl")?;

    let stdout = child
        .stdout
        .take()
        .context("failed to attach to journalctl output")?;
    let mut lines = BufReader::new(stdout).lines();

    let start_time = Utc::now();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                return Ok(());
            }
            line = lines.next_line() => {
                line.context("failed to read journalctl output")?
            }
        };

        let Some(line) = line else {
            break; // child closed its stdout
        };
        if line.trim().is_empty() {
            continue;
        }

        let record: JournalRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                eprintln!("failed to decode journald record: {e}");
                continue;
            }
        };

        let ts = parse_realtime(&record.realtime);
        let Some(mut event) = parser::parse_journal_message(&record.message, &record.hostname, ts)
        else {
            continue;
        };

        if skip_historical
            && ts < start_time - chrono::Duration::seconds(HISTORY_TOLERANCE_SECS)
        {
            debugf!(
                "skipping historical journald event cursor={} ts={}",
                record.cursor,
                ts.to_rfc3339()
            );
            pipeline.advance(Advance::Journal(record.cursor));
            continue;
        }
        skip_historical = false;

        let unit = if record.unit.is_empty() {
            units.join(",")
        } else {
            record.unit
        };
        event.log_path = if unit.is_empty() {
            "journald".to_string()
        } else {
            format!("journald:{unit}")
        };

        pipeline.handle(event, Advance::Journal(record.cursor)).await;
    }

    let status = child.wait().await.context("failed to wait for journalctl")?;
    if cancel.is_cancelled() {
        return Ok(());
    }
    if follow {
        bail!("journalctl exited unexpectedly: {status}");
    }
    if !status.success() {
        bail!("journalctl exited with {status}");
    }
    Ok(())
}
