// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Flat auth-log source (`/var/log/auth.log`, `/var/log/secure`).
//!
//! Follow mode resumes at the saved byte offset (end of file when there is
//! none), then tails line by line. On EOF it sleeps one poll interval and
//! checks for rotation: the path now resolves to a different inode, or the
//! file shrank below the read offset. Either way the path is reopened from
//! offset 0.
//!
//! Sweep mode reads from the saved offset (or from 0 when a lookback was
//! requested, with old events dropped by the pipeline cutoff) and saves
//! the final offset once at the end.

use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::debugf;
use crate::parser;
use crate::watcher::{Advance, Pipeline};

/// Why one file session ended.
enum SessionEnd {
    /// Sweep finished the file.
    Eof,
    /// Rotation or truncation detected; reopen from offset 0.
    Rotated,
    Cancelled,
}

/// Follow the file until cancelled. Read errors are logged and retried
/// after one poll interval.
pub async fn follow(
    cancel: &CancellationToken,
    pipeline: &mut Pipeline,
    path: &Path,
    poll: Duration,
) -> Result<()> {
    let poll = if poll.is_zero() { Duration::from_secs(1) } else { poll };
    let path_key = path.display().to_string();
    let mut offset = pipeline.state.offset_for(&path_key);
    // Offset 0 means "tail from now" on the first open only; after a
    // rotation the new file is read from the top.
    let mut tail_on_zero = true;

    loop {
        let session = Session {
            start_offset: offset,
            follow: true,
            tail_on_zero,
            poll,
        };
        match read_session(cancel, pipeline, path, session).await {
            Ok((SessionEnd::Cancelled, _)) => return Ok(()),
            Ok((SessionEnd::Rotated, _)) => {
                offset = 0;
                tail_on_zero = false;
            }
            Ok((SessionEnd::Eof, at)) => {
                // Follow sessions only end via rotation or cancellation;
                // treat a stray EOF as a retry point.
                offset = at;
            }
            Err(e) => {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                eprintln!("failed to read {}: {e:#}", path.display());
                tail_on_zero = true;
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }
    }
}

/// One-shot scan. The final offset is recorded and the cursor saved once.
pub async fn sweep(
    cancel: &CancellationToken,
    pipeline: &mut Pipeline,
    path: &Path,
    since: Option<Duration>,
) -> Result<()> {
    let path_key = path.display().to_string();
    let start_offset = if since.is_some() {
        // Re-read from the top; the pipeline cutoff drops stale events.
        0
    } else {
        pipeline.state.offset_for(&path_key)
    };
    if let Some(window) = since {
        let lookback =
            chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        pipeline.cutoff = Some(chrono::Utc::now() - lookback);
    }

    let session = Session {
        start_offset,
        follow: false,
        tail_on_zero: false,
        poll: Duration::ZERO,
    };
    let (_, final_offset) = read_session(cancel, pipeline, path, session).await?;

    pipeline.advance(Advance::FileDeferred {
        path: path_key,
        offset: final_offset,
    });
    pipeline.persist();
    Ok(())
}

/// Parameters for one open-file session.
struct Session {
    start_offset: i64,
    /// EOF behavior: poll + rotation check vs. return.
    follow: bool,
    /// Whether a zero offset means "seek to end" (first follow open).
    tail_on_zero: bool,
    poll: Duration,
}

/// Read one open-file session. Returns how it ended plus the byte offset
/// reached.
async fn read_session(
    cancel: &CancellationToken,
    pipeline: &mut Pipeline,
    path: &Path,
    session: Session,
) -> Result<(SessionEnd, i64)> {
    let Session {
        start_offset,
        follow,
        tail_on_zero,
        poll,
    } = session;

    let file = File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let meta = file
        .metadata()
        .await
        .with_context(|| format!("failed to stat {}", path.display()))?;
    let opened_ino = meta.ino();
    let size = meta.len() as i64;

    let mut offset = start_offset;
    if offset == 0 && follow && tail_on_zero {
        offset = size; // tail from now
    }
    if offset > size {
        offset = size;
    }

    let mut reader = BufReader::new(file);
    reader
        .seek(std::io::SeekFrom::Start(offset as u64))
        .await
        .with_context(|| format!("failed to seek {}", path.display()))?;

    let path_key = path.display().to_string();
    let mut buf = String::new();

    loop {
        if cancel.is_cancelled() {
            return Ok((SessionEnd::Cancelled, offset));
        }

        let n = reader
            .read_line(&mut buf)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;

        if n == 0 {
            // EOF.
            if !follow {
                return Ok((SessionEnd::Eof, offset));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok((SessionEnd::Cancelled, offset)),
                _ = tokio::time::sleep(poll) => {}
            }
            if rotated(path, opened_ino, offset).await {
                debugf!("{} rotated or truncated, reopening", path.display());
                return Ok((SessionEnd::Rotated, offset));
            }
            continue;
        }

        if !buf.ends_with('\n') {
            // Partial line: a writer is mid-append. Leave it in the buffer
            // and wait for the rest.
            continue;
        }

        offset += buf.len() as i64;
        let line = buf.trim_end_matches(['\r', '\n']);
        if let Some(mut event) = parser::parse_auth_log_line(line) {
            event.log_path = path_key.clone();
            let advance = if follow {
                Advance::File {
                    path: path_key.clone(),
                    offset,
                }
            } else {
                Advance::FileDeferred {
                    path: path_key.clone(),
                    offset,
                }
            };
            pipeline.handle(event, advance).await;
        }
        buf.clear();
    }
}

/// Rotation check: the path resolves to a different inode, or its size
/// dropped below our offset (truncation / copytruncate). A missing path
/// (rotated away, not yet recreated) is not a reopen signal.
async fn rotated(path: &Path, opened_ino: u64, offset: i64) -> bool {
    let current = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(_) => return false,
    };
    current.ino() != opened_ino || (current.len() as i64) < offset
}
