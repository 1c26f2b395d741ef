// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Log-source probing and selection.
//!
//! One source is active per run. The journal is available when a
//! `journalctl` binary exists on `PATH`; a recency probe reads its last
//! 200 records over the relevant window and checks whether any matches the
//! parser. The file source is the first existing regular file among the
//! candidates.
//!
//! Selection: explicit `journal`/`file` respects the choice or errors.
//! `auto` in follow mode prefers an available journal even without recent
//! matches (new events will stream in); `auto` in sweep mode prefers
//! whichever source actually shows a recent match.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::cursor::SourceState;
use crate::debugf;
use crate::{journal, parser};

pub const DEFAULT_JOURNAL_UNITS: [&str; 2] = ["sshd.service", "ssh.service"];
pub const DEFAULT_LOG_PATHS: [&str; 2] = ["/var/log/auth.log", "/var/log/secure"];

/// The source a run will read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectedSource {
    Journal(Vec<String>),
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct SourceSelection {
    pub source: SelectedSource,
    pub description: String,
}

/// Probe both sources and pick one.
pub async fn determine_source(
    requested: &str,
    units: &[String],
    paths: &[String],
    state: &SourceState,
    since: Option<Duration>,
    follow: bool,
) -> Result<SourceSelection> {
    let units: Vec<String> = if units.is_empty() {
        DEFAULT_JOURNAL_UNITS.iter().map(|s| s.to_string()).collect()
    } else {
        units.to_vec()
    };
    let paths: Vec<String> = if paths.is_empty() {
        DEFAULT_LOG_PATHS.iter().map(|s| s.to_string()).collect()
    } else {
        paths.to_vec()
    };

    let requested = {
        let r = requested.trim().to_lowercase();
        if r.is_empty() {
            "auto".to_string()
        } else {
            r
        }
    };

    let (journal_ok, journal_recent) = probe_journal(&units, state, since).await;
    let file = first_existing(&paths);

    select(&requested, journal_ok, journal_recent, file, units, &paths, follow)
}

/// Pure selection logic over the probe results.
fn select(
    requested: &str,
    journal_ok: bool,
    journal_recent: bool,
    file: Option<PathBuf>,
    units: Vec<String>,
    paths: &[String],
    follow: bool,
) -> Result<SourceSelection> {
    let units_label = units.join(",");
    let journal_desc = move |suffix: &str| format!("journald (units={units_label}){suffix}");
    let file_selection = |path: PathBuf| SourceSelection {
        description: format!("log file: {}", path.display()),
        source: SelectedSource::File(path),
    };

    match requested {
        "journal" => {
            if !journal_ok {
                bail!("journalctl is unavailable on this system");
            }
            Ok(SourceSelection {
                description: journal_desc(""),
                source: SelectedSource::Journal(units),
            })
        }
        "file" => match file {
            Some(path) => Ok(file_selection(path)),
            None => bail!("no usable log file among {}", paths.join(", ")),
        },
        "auto" => {
            if follow {
                if journal_ok {
                    let suffix = if journal_recent { "" } else { ", waiting for new events" };
                    return Ok(SourceSelection {
                        description: journal_desc(suffix),
                        source: SelectedSource::Journal(units),
                    });
                }
                if let Some(path) = file {
                    return Ok(file_selection(path));
                }
            } else {
                if journal_ok && journal_recent {
                    return Ok(SourceSelection {
                        description: journal_desc(", matched recent events"),
                        source: SelectedSource::Journal(units),
                    });
                }
                if let Some(path) = file {
                    return Ok(file_selection(path));
                }
                if journal_ok {
                    return Ok(SourceSelection {
                        description: journal_desc(", no matching events"),
                        source: SelectedSource::Journal(units),
                    });
                }
            }
            bail!(
                "no usable log source (journalctl unavailable, and none of {} exist)",
                paths.join(", ")
            );
        }
        other => bail!("unsupported source {other:?} (use auto|journal|file)"),
    }
}

/// Journal probe: `(available, has_recent_match)`.
async fn probe_journal(
    units: &[String],
    state: &SourceState,
    since: Option<Duration>,
) -> (bool, bool) {
    if crate::util::binary_on_path("journalctl").is_none() {
        debugf!("journalctl not found on PATH");
        return (false, false);
    }

    let args = journal::probe_args(units, &state.journal_cursor, since);
    debugf!("probing journal: journalctl {}", args.join(" "));

    let mut cmd = tokio::process::Command::new("journalctl");
    cmd.args(&args)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            debugf!("journal probe spawn failed: {e}");
            return (false, false);
        }
    };

    let mut matched = false;
    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let Ok(record) = serde_json::from_str::<journal::JournalRecord>(&line) else {
                continue;
            };
            let ts = journal::parse_realtime(&record.realtime);
            if parser::parse_journal_message(&record.message, &record.hostname, ts).is_some() {
                matched = true;
                break;
            }
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;

    debugf!("journal probe result: matched={matched}");
    (true, matched)
}

/// First existing regular file among the candidates.
fn first_existing(paths: &[String]) -> Option<PathBuf> {
    for p in paths {
        if p.is_empty() {
            continue;
        }
        if let Ok(meta) = std::fs::metadata(p) {
            if meta.is_file() {
                return Some(PathBuf::from(p));
            }
        }
    }
    None
}
