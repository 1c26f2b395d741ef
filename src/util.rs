//! Shared helpers: debug tracing, host identity, PATH lookup, duration parsing.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns true when `SSHIELD_DEBUG` is set to any non-empty value.
pub fn debug_enabled() -> bool {
    std::env::var_os("SSHIELD_DEBUG").is_some_and(|v| !v.is_empty())
}

/// Debug trace line, gated on `SSHIELD_DEBUG`.
#[macro_export]
macro_rules! debugf {
    ($($arg:tt)*) => {
        if $crate::util::debug_enabled() {
            eprintln!("[sshield-debug] {}", format_args!($($arg)*));
        }
    };
}

/// The local machine's hostname, or `"unknown"` when it cannot be read.
pub fn hostname() -> String {
    let name = gethostname::gethostname();
    let name = name.to_string_lossy();
    if name.is_empty() {
        "unknown".to_string()
    } else {
        name.into_owned()
    }
}

/// Best-effort outbound IP of this host.
///
/// Opens a UDP socket toward a public address (no packets are sent) and
/// reads the kernel-chosen local address. Empty string when the host has
/// no route.
pub fn host_ip() -> String {
    let probe = || -> std::io::Result<String> {
        let sock = std::net::UdpSocket::bind("0.0.0.0:0")?;
        sock.connect("8.8.8.8:80")?;
        Ok(sock.local_addr()?.ip().to_string())
    };
    probe().unwrap_or_default()
}

/// Search `PATH` for an executable with the given name.
pub fn binary_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Whether `euid` is 0. Decides the default state-file location.
pub fn running_as_root() -> bool {
    // SAFETY: geteuid has no failure mode and touches no memory.
    unsafe { libc::geteuid() == 0 }
}

/// The user's config directory: `$XDG_CONFIG_HOME`, else `~/.config`.
pub fn user_config_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        if !dir.is_empty() {
            return Some(PathBuf::from(dir));
        }
    }
    std::env::var_os("HOME").map(|home| Path::new(&home).join(".config"))
}

/// Parse a human duration: `"90s"`, `"10m"`, `"1h"`, `"2d"`, or bare seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("empty duration");
    }

    let (value, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => (&s[..idx], &s[idx..]),
        None => (s, "s"),
    };

    let n: u64 = value
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid duration: {s}"))?;

    let secs = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        "d" => n * 86400,
        _ => anyhow::bail!("invalid duration unit in {s:?} (use s/m/h/d)"),
    };

    Ok(Duration::from_secs(secs))
}
