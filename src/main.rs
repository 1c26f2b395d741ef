// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! sshield — SSH login-event notification daemon.
//!
//! Entry point: builds the tokio runtime and hands off to [`cli`]. The
//! event path is a single sequential pipeline:
//! source (journald | auth log) → parser → IP enricher → filter stack →
//! dispatcher → channels (curl | email), with a durable cursor advanced
//! after every processed event.

mod channels;
mod cli;
mod curl;
mod cursor;
mod email;
mod event;
mod filter;
mod geoip;
mod journal;
mod logfile;
mod parser;
mod smtp;
mod source;
mod template;
mod timeutil;
mod util;
mod watcher;

#[cfg(test)]
mod integration_tests;

use anyhow::Result;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    tokio::runtime::Runtime::new()?.block_on(cli::run(args))
}
