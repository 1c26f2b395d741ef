// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! CLI subcommand dispatch and flag parsing.
//!
//! No CLI framework: commands are matched by name and flags walked by
//! hand. `--flag value` and `--flag=value` both work; list flags repeat.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::Engine;
use tokio_util::sync::CancellationToken;

use crate::channels::{
    ChannelConfig, ChannelKind, ChannelSelector, ChannelStore, CurlChannel, EmailChannel,
    NotifyConfig,
};
use crate::filter::NotifyOn;
use crate::timeutil::DisplayZone;
use crate::util::parse_duration;
use crate::watcher::{self, SweepOptions, WatchOptions};

const ENV_EMAIL_TO: &str = "SSHIELD_NOTIFY_EMAIL_TO";
const ENV_EMAIL_FROM: &str = "SSHIELD_NOTIFY_EMAIL_FROM";
const ENV_EMAIL_SERVER: &str = "SSHIELD_NOTIFY_EMAIL_SERVER";
const ENV_EMAIL_USER: &str = "SSHIELD_NOTIFY_EMAIL_USER";
const ENV_EMAIL_PASSWORD: &str = "SSHIELD_NOTIFY_EMAIL_PASSWORD";
const ENV_EMAIL_PORT: &str = "SSHIELD_NOTIFY_EMAIL_PORT";

/// Overall deadline for a sweep run.
const SWEEP_DEADLINE: Duration = Duration::from_secs(30);

pub fn print_help() {
    eprintln!(
        r#"sshield — SSH login-event notification daemon

USAGE:
    sshield <COMMAND> [OPTIONS]

COMMANDS:
    watch                Follow SSH login events and send notifications
    sweep                One-shot scan of recent SSH login events
    curl <curl-command>  Add or update a curl (webhook) channel
    email                Add or update an SMTP email channel
    test                 Send a test notification through enabled channels
    status               Show configured notification channels
    enable               Enable channels (--all | --name N | --index I)
    disable              Disable channels (--all | --name N | --index I)
    delete               Delete channels (--all | --name N | --index I | --type T)
    help                 Show this help message
    version              Show version info

WATCH / SWEEP OPTIONS:
    --state-file PATH    Cursor file (default: auto-selected)
    --source S           auto|journal|file (default auto)
    --journal-unit U     Journal unit to read, repeatable
                         (default sshd.service, ssh.service)
    --log-path P         Auth log file candidate, repeatable
                         (default /var/log/auth.log, /var/log/secure)
    --timezone TZ        Display timezone (default Asia/Shanghai)
    --notify-on T        all|success|failed (default all)
    --fail-limit N       Max failure notifications per IP per window (0 = off)
    --fail-window D      Failure limit window (default 1h)
    --poll D             Watch: wait between file polls (default 5s)
    --since D            Sweep: lookback window (default 1h)
    --notify             Sweep: actually send notifications (default print only)

EXAMPLES:
    sshield watch
    sshield sweep --since 2h --notify
    sshield curl --name hook 'curl -X POST -d '\''{{"u":"{{{{.User}}}}"}}'\'' https://example.com/hook'
    sshield email --to ops@example.com --from sshield@example.com \
        --server smtp.example.com --user sshield --password secret
    sshield disable --name hook
"#
    );
}

pub fn print_version() {
    eprintln!("sshield v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("SSH login-event notification daemon");
}

/// Top-level dispatch. `args` excludes the binary name.
pub async fn run(args: Vec<String>) -> Result<()> {
    let subcommand = args.first().map(String::as_str).unwrap_or("help");
    let rest = if args.is_empty() { &[][..] } else { &args[1..] };

    match subcommand {
        "watch" => watch_cmd(rest).await,
        "sweep" => sweep_cmd(rest).await,
        "curl" => curl_cmd(rest),
        "email" => email_cmd(rest),
        "test" => test_cmd(rest).await,
        "status" => status_cmd(),
        "enable" => toggle_cmd(rest, true),
        "disable" => toggle_cmd(rest, false),
        "delete" => delete_cmd(rest),
        "version" | "--version" => {
            print_version();
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            print_help();
            bail!("unknown command: {other}");
        }
    }
}

// ── Flag walking ───────────────────────────────────────────────────────────

/// Split `--flag=value` into `("--flag", Some("value"))`.
fn split_flag(arg: &str) -> (&str, Option<&str>) {
    match arg.split_once('=') {
        Some((flag, value)) if flag.starts_with('-') => (flag, Some(value)),
        _ => (arg, None),
    }
}

/// Value for a flag: inline (`=`) or the next argument.
fn take_value(
    args: &[String],
    i: &mut usize,
    inline: Option<&str>,
    flag: &str,
) -> Result<String> {
    if let Some(v) = inline {
        return Ok(v.to_string());
    }
    *i += 1;
    args.get(*i)
        .cloned()
        .with_context(|| format!("missing value for {flag}"))
}

/// Flags shared by watch and sweep.
#[derive(Default)]
struct CommonFlags {
    state_file: Option<PathBuf>,
    source: String,
    journal_units: Vec<String>,
    log_paths: Vec<String>,
    timezone: String,
    notify_on: NotifyOn,
    fail_limit: usize,
    fail_window: Duration,
}

impl CommonFlags {
    fn new() -> Self {
        CommonFlags {
            source: "auto".to_string(),
            fail_window: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    /// Try to consume one flag; true when it was one of ours.
    fn consume(&mut self, args: &[String], i: &mut usize) -> Result<bool> {
        let (flag, inline) = split_flag(&args[*i]);
        match flag {
            "--state-file" => {
                self.state_file = Some(PathBuf::from(take_value(args, i, inline, flag)?));
            }
            "--source" => self.source = take_value(args, i, inline, flag)?,
            "--journal-unit" => self.journal_units.push(take_value(args, i, inline, flag)?),
            "--log-path" => self.log_paths.push(take_value(args, i, inline, flag)?),
            "--timezone" => self.timezone = take_value(args, i, inline, flag)?,
            "--notify-on" => {
                self.notify_on = take_value(args, i, inline, flag)?.parse()?;
            }
            "--fail-limit" => {
                let raw = take_value(args, i, inline, flag)?;
                self.fail_limit = raw
                    .parse()
                    .with_context(|| format!("invalid --fail-limit {raw:?}"))?;
            }
            "--fail-window" => {
                self.fail_window = parse_duration(&take_value(args, i, inline, flag)?)?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}

// ── watch / sweep ──────────────────────────────────────────────────────────

/// Cancel the token on the first interrupt.
fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupted, shutting down");
            cancel.cancel();
        }
    });
}

async fn watch_cmd(args: &[String]) -> Result<()> {
    let mut common = CommonFlags::new();
    let mut poll = Duration::from_secs(5);

    let mut i = 0;
    while i < args.len() {
        if common.consume(args, &mut i)? {
            i += 1;
            continue;
        }
        let (flag, inline) = split_flag(&args[i]);
        match flag {
            "--poll" => poll = parse_duration(&take_value(args, &mut i, inline, flag)?)?,
            other => bail!("unknown watch flag: {other}"),
        }
        i += 1;
    }

    let opts = WatchOptions {
        state_file: common.state_file,
        source: common.source,
        journal_units: common.journal_units,
        log_paths: common.log_paths,
        poll,
        zone: DisplayZone::resolve(&common.timezone)?,
        notify_on: common.notify_on,
        fail_limit: common.fail_limit,
        fail_window: common.fail_window,
        channels: ChannelStore::system(),
    };

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    watcher::run_watch(cancel, opts).await
}

async fn sweep_cmd(args: &[String]) -> Result<()> {
    let mut common = CommonFlags::new();
    let mut since = Duration::from_secs(3600);
    let mut notify = false;

    let mut i = 0;
    while i < args.len() {
        if common.consume(args, &mut i)? {
            i += 1;
            continue;
        }
        let (flag, inline) = split_flag(&args[i]);
        match flag {
            "--since" => since = parse_duration(&take_value(args, &mut i, inline, flag)?)?,
            "--notify" => notify = true,
            other => bail!("unknown sweep flag: {other}"),
        }
        i += 1;
    }

    let opts = SweepOptions {
        state_file: common.state_file,
        source: common.source,
        journal_units: common.journal_units,
        log_paths: common.log_paths,
        since,
        notify,
        zone: DisplayZone::resolve(&common.timezone)?,
        notify_on: common.notify_on,
        fail_limit: common.fail_limit,
        fail_window: common.fail_window,
        channels: ChannelStore::system(),
    };

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    match tokio::time::timeout(SWEEP_DEADLINE, watcher::run_sweep(cancel, opts)).await {
        Ok(result) => result,
        Err(_) => bail!("sweep did not finish within {}s", SWEEP_DEADLINE.as_secs()),
    }
}

// ── channel management ─────────────────────────────────────────────────────

fn load_or_default(store: &ChannelStore) -> Result<NotifyConfig> {
    Ok(store.load()?.unwrap_or_default())
}

fn auto_name(cfg: &NotifyConfig, kind: ChannelKind) -> String {
    let mut n = cfg.channels.iter().filter(|c| c.kind == kind).count() + 1;
    loop {
        let candidate = format!("{kind}-{n}");
        if !cfg.channels.iter().any(|c| c.name == candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn curl_cmd(args: &[String]) -> Result<()> {
    let mut name = String::new();
    let mut is_base64 = false;
    let mut command: Option<String> = None;

    let mut i = 0;
    while i < args.len() {
        let (flag, inline) = split_flag(&args[i]);
        match flag {
            "--name" => name = take_value(args, &mut i, inline, flag)?,
            "--base64" => is_base64 = true,
            _ if flag.starts_with("--") => bail!("unknown curl flag: {flag}"),
            _ => {
                if command.is_some() {
                    bail!("expected exactly one curl command argument");
                }
                command = Some(args[i].clone());
            }
        }
        i += 1;
    }

    let mut command = command.context("missing curl command argument")?;
    if is_base64 {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(command.trim())
            .context("failed to decode base64 curl command")?;
        command = String::from_utf8(decoded).context("decoded curl command is not UTF-8")?;
        println!("decoded curl command: {command}");
    }

    let store = ChannelStore::system();
    let mut cfg = load_or_default(&store)?;
    if name.is_empty() {
        name = auto_name(&cfg, ChannelKind::Curl);
    }

    cfg.upsert(ChannelConfig {
        name: name.clone(),
        enabled: true,
        kind: ChannelKind::Curl,
        curl: Some(CurlChannel { command }),
        email: None,
    });
    store.save(&cfg)?;
    println!("✓ saved curl channel {name:?} to {}", store.path().display());
    Ok(())
}

/// Flag value, falling back to a `SSHIELD_NOTIFY_EMAIL_*` variable.
fn env_fallback(value: Option<String>, env: &str) -> Option<String> {
    value.or_else(|| std::env::var(env).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty()))
}

fn email_cmd(args: &[String]) -> Result<()> {
    let mut name = String::new();
    let mut to = None;
    let mut from = None;
    let mut server = None;
    let mut user = None;
    let mut pass = None;
    let mut port: Option<String> = None;

    let mut i = 0;
    while i < args.len() {
        let (flag, inline) = split_flag(&args[i]);
        match flag {
            "--name" => name = take_value(args, &mut i, inline, flag)?,
            "--to" | "-t" => to = Some(take_value(args, &mut i, inline, flag)?),
            "--from" | "-f" => from = Some(take_value(args, &mut i, inline, flag)?),
            "--server" => server = Some(take_value(args, &mut i, inline, flag)?),
            "--user" | "-u" => user = Some(take_value(args, &mut i, inline, flag)?),
            "--password" | "-p" => pass = Some(take_value(args, &mut i, inline, flag)?),
            "--port" => port = Some(take_value(args, &mut i, inline, flag)?),
            other => bail!("unknown email flag: {other}"),
        }
        i += 1;
    }

    let to = env_fallback(to, ENV_EMAIL_TO).context("--to is required")?;
    let from = env_fallback(from, ENV_EMAIL_FROM).context("--from is required")?;
    let server = env_fallback(server, ENV_EMAIL_SERVER).context("--server is required")?;
    let user = env_fallback(user, ENV_EMAIL_USER).context("--user is required")?;
    let pass = env_fallback(pass, ENV_EMAIL_PASSWORD).context("--password is required")?;
    let port = match env_fallback(port, ENV_EMAIL_PORT) {
        Some(raw) => raw
            .parse::<u16>()
            .with_context(|| format!("invalid SMTP port {raw:?}"))?,
        None => 587,
    };

    let store = ChannelStore::system();
    let mut cfg = load_or_default(&store)?;
    if name.is_empty() {
        name = auto_name(&cfg, ChannelKind::Email);
    }

    cfg.upsert(ChannelConfig {
        name: name.clone(),
        enabled: true,
        kind: ChannelKind::Email,
        curl: None,
        email: Some(EmailChannel {
            to,
            from,
            server,
            port,
            user,
            pass,
        }),
    });
    store.save(&cfg)?;
    println!("✓ saved email channel {name:?} to {}", store.path().display());
    Ok(())
}

async fn test_cmd(args: &[String]) -> Result<()> {
    let mut timezone = String::new();
    let mut i = 0;
    while i < args.len() {
        let (flag, inline) = split_flag(&args[i]);
        match flag {
            "--timezone" => timezone = take_value(args, &mut i, inline, flag)?,
            other => bail!("unknown test flag: {other}"),
        }
        i += 1;
    }

    let zone = DisplayZone::resolve(&timezone)?;
    watcher::send_test_notification(&ChannelStore::system(), &zone).await?;
    println!("✓ test notification sent");
    Ok(())
}

fn status_cmd() -> Result<()> {
    let store = ChannelStore::system();
    let Some(cfg) = store.load()? else {
        println!("notification is not configured: login events are only printed to the console.");
        return Ok(());
    };

    if cfg.channels.is_empty() {
        println!("no notification channels configured.");
        return Ok(());
    }

    println!("notification channels:");
    for (i, ch) in cfg.channels.iter().enumerate() {
        let state = if ch.enabled { "enabled" } else { "disabled" };
        let target = match (&ch.curl, &ch.email) {
            (Some(curl), _) => {
                let url = crate::curl::parse_curl(&curl.command)
                    .map(|r| r.url)
                    .unwrap_or_else(|_| "<unparsable command>".to_string());
                url
            }
            (_, Some(email)) => format!("{} via {}:{}", email.to, email.server, email.port),
            _ => "-".to_string(),
        };
        println!(
            "  [{}] {} ({}, {}): {}",
            i + 1,
            ch.display_name(),
            ch.kind,
            state,
            target
        );
    }
    Ok(())
}

/// Selector flags for enable/disable/delete: `--all`, `--name`, `--index`,
/// and (delete only) `--type`.
fn parse_selector(args: &[String], allow_kind: bool) -> Result<ChannelSelector> {
    let mut selector = None;

    let mut i = 0;
    while i < args.len() {
        let (flag, inline) = split_flag(&args[i]);
        let next = match flag {
            "--all" => ChannelSelector::All,
            "--name" => ChannelSelector::Name(take_value(args, &mut i, inline, flag)?),
            "--index" => {
                let raw = take_value(args, &mut i, inline, flag)?;
                let index: usize = raw
                    .parse()
                    .with_context(|| format!("invalid --index {raw:?}"))?;
                ChannelSelector::Index(index)
            }
            "--type" if allow_kind => {
                let raw = take_value(args, &mut i, inline, flag)?;
                match raw.to_lowercase().as_str() {
                    "curl" => ChannelSelector::Kind(ChannelKind::Curl),
                    "email" => ChannelSelector::Kind(ChannelKind::Email),
                    other => bail!("unknown channel type {other:?} (use curl|email)"),
                }
            }
            other => bail!("unknown flag: {other}"),
        };
        if selector.is_some() {
            bail!("use exactly one of --all, --name, --index{}", if allow_kind { ", --type" } else { "" });
        }
        selector = Some(next);
        i += 1;
    }

    selector.with_context(|| {
        format!(
            "specify a target: --all, --name, --index{}",
            if allow_kind { ", or --type" } else { "" }
        )
    })
}

fn toggle_cmd(args: &[String], enabled: bool) -> Result<()> {
    let selector = parse_selector(args, false)?;
    let store = ChannelStore::system();
    let count = store.set_enabled(&selector, enabled)?;
    let action = if enabled { "enabled" } else { "disabled" };
    println!("✓ {action} {count} channel(s)");
    Ok(())
}

fn delete_cmd(args: &[String]) -> Result<()> {
    let selector = parse_selector(args, true)?;
    let store = ChannelStore::system();
    if matches!(selector, ChannelSelector::All) {
        store.delete_channels(&selector)?;
        println!("✓ deleted all notification configuration");
        return Ok(());
    }
    let count = store.delete_channels(&selector)?;
    println!("✓ deleted {count} channel(s)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_split_flag() {
        assert_eq!(split_flag("--poll=10s"), ("--poll", Some("10s")));
        assert_eq!(split_flag("--poll"), ("--poll", None));
        assert_eq!(split_flag("plain=notflag"), ("plain=notflag", None));
    }

    #[test]
    fn test_take_value_inline_and_next() {
        let args = strs(&["--source", "journal"]);
        let mut i = 0;
        assert_eq!(take_value(&args, &mut i, None, "--source").unwrap(), "journal");
        assert_eq!(i, 1);

        let args = strs(&["--source=file"]);
        let mut i = 0;
        assert_eq!(take_value(&args, &mut i, Some("file"), "--source").unwrap(), "file");
        assert_eq!(i, 0);

        let args = strs(&["--source"]);
        let mut i = 0;
        assert!(take_value(&args, &mut i, None, "--source").is_err());
    }

    #[test]
    fn test_common_flags_consume() {
        let args = strs(&[
            "--source=journal",
            "--journal-unit",
            "sshd.service",
            "--journal-unit",
            "ssh.service",
            "--notify-on",
            "failed",
            "--fail-limit",
            "3",
            "--fail-window",
            "30m",
        ]);
        let mut common = CommonFlags::new();
        let mut i = 0;
        while i < args.len() {
            assert!(common.consume(&args, &mut i).unwrap());
            i += 1;
        }
        assert_eq!(common.source, "journal");
        assert_eq!(common.journal_units, vec!["sshd.service", "ssh.service"]);
        assert_eq!(common.notify_on, NotifyOn::Failed);
        assert_eq!(common.fail_limit, 3);
        assert_eq!(common.fail_window, Duration::from_secs(1800));
    }

    #[test]
    fn test_selector_parsing() {
        assert!(matches!(
            parse_selector(&strs(&["--all"]), false).unwrap(),
            ChannelSelector::All
        ));
        assert!(matches!(
            parse_selector(&strs(&["--name", "hook"]), false).unwrap(),
            ChannelSelector::Name(n) if n == "hook"
        ));
        assert!(matches!(
            parse_selector(&strs(&["--index=2"]), false).unwrap(),
            ChannelSelector::Index(2)
        ));
        assert!(matches!(
            parse_selector(&strs(&["--type", "email"]), true).unwrap(),
            ChannelSelector::Kind(ChannelKind::Email)
        ));

        // --type needs allow_kind; empty and double selectors are errors.
        assert!(parse_selector(&strs(&["--type", "email"]), false).is_err());
        assert!(parse_selector(&[], false).is_err());
        assert!(parse_selector(&strs(&["--all", "--index", "1"]), false).is_err());
    }

    #[test]
    fn test_auto_name_skips_taken() {
        let mut cfg = NotifyConfig::default();
        assert_eq!(auto_name(&cfg, ChannelKind::Curl), "curl-1");

        cfg.channels.push(ChannelConfig {
            name: "curl-1".to_string(),
            enabled: true,
            kind: ChannelKind::Curl,
            curl: Some(CurlChannel {
                command: "curl https://example.com".to_string(),
            }),
            email: None,
        });
        assert_eq!(auto_name(&cfg, ChannelKind::Curl), "curl-2");
        // Different kind counts separately.
        assert_eq!(auto_name(&cfg, ChannelKind::Email), "email-1");
    }

    #[test]
    fn test_env_fallback_prefers_flag() {
        std::env::set_var("SSHIELD_TEST_FALLBACK", "from-env");
        assert_eq!(
            env_fallback(Some("from-flag".into()), "SSHIELD_TEST_FALLBACK").unwrap(),
            "from-flag"
        );
        assert_eq!(
            env_fallback(None, "SSHIELD_TEST_FALLBACK").unwrap(),
            "from-env"
        );
        std::env::remove_var("SSHIELD_TEST_FALLBACK");
        assert!(env_fallback(None, "SSHIELD_TEST_FALLBACK").is_none());
    }
}
