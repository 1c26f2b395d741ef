// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Notification channel registry.
//!
//! Channels live in `/etc/sshield/notify.json` (mode 0600). The file is
//! re-read on every dispatch so edits apply without a restart; every write
//! validates first, backs the old file up to `<path>.backup`, and lands via
//! temp-file + rename.

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG_PATH: &str = "/etc/sshield/notify.json";

/// The whole config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Curl,
    Email,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Curl => f.write_str("curl"),
            ChannelKind::Email => f.write_str("email"),
        }
    }
}

/// One notification destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curl: Option<CurlChannel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<EmailChannel>,
}

impl ChannelConfig {
    /// Name for operator-facing messages: the channel name, else its type.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            self.kind.to_string()
        } else {
            self.name.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurlChannel {
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailChannel {
    pub to: String,
    pub from: String,
    pub server: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
}

impl NotifyConfig {
    pub fn enabled_channels(&self) -> impl Iterator<Item = &ChannelConfig> {
        self.channels.iter().filter(|c| c.enabled)
    }

    /// Add a channel, or replace the existing one with the same name.
    pub fn upsert(&mut self, channel: ChannelConfig) {
        if !channel.name.is_empty() {
            if let Some(slot) = self.channels.iter_mut().find(|c| c.name == channel.name) {
                *slot = channel;
                return;
            }
        }
        self.channels.push(channel);
    }
}

/// How runtime mutations pick their target channels.
#[derive(Debug, Clone)]
pub enum ChannelSelector {
    All,
    Name(String),
    /// 1-based, as shown by `status`.
    Index(usize),
    Kind(ChannelKind),
}

/// Validate a whole config before it is written or used.
pub fn validate_config(cfg: &NotifyConfig) -> Result<()> {
    let mut seen_names = std::collections::HashSet::new();
    for (i, ch) in cfg.channels.iter().enumerate() {
        validate_channel(ch).with_context(|| format!("channel {} ({})", i + 1, ch.display_name()))?;
        if !ch.name.is_empty() && !seen_names.insert(ch.name.as_str()) {
            bail!("duplicate channel name {:?}", ch.name);
        }
    }
    Ok(())
}

/// Validate a single channel entry.
pub fn validate_channel(ch: &ChannelConfig) -> Result<()> {
    match ch.kind {
        ChannelKind::Curl => {
            if ch.email.is_some() {
                bail!("curl channel must not carry an email section");
            }
            let curl = ch.curl.as_ref().context("curl config is required")?;
            if curl.command.trim().is_empty() {
                bail!("curl command is required");
            }
            crate::curl::parse_curl(&curl.command).context("curl command does not parse")?;
        }
        ChannelKind::Email => {
            if ch.curl.is_some() {
                bail!("email channel must not carry a curl section");
            }
            let email = ch.email.as_ref().context("email config is required")?;
            if !is_valid_email(&email.to) {
                bail!("invalid recipient email {:?}", email.to);
            }
            if !is_valid_email(&email.from) {
                bail!("invalid sender email {:?}", email.from);
            }
            if email.server.trim().is_empty() {
                bail!("SMTP server is required");
            }
            if email.port == 0 {
                bail!("invalid SMTP port");
            }
            if email.user.is_empty() {
                bail!("SMTP username is required");
            }
            if email.pass.is_empty() {
                bail!("SMTP password is required");
            }
        }
    }
    Ok(())
}

/// Good-enough address check: one `@`, non-empty local part, a dot in the
/// domain, no whitespace or CR/LF.
fn is_valid_email(addr: &str) -> bool {
    if addr.is_empty() || addr.chars().any(|c| c.is_whitespace()) {
        return false;
    }
    let Some((local, domain)) = addr.split_once('@') else {
        return false;
    };
    !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
}

/// Loads and stores the channel config file.
pub struct ChannelStore {
    path: PathBuf,
}

impl ChannelStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ChannelStore { path: path.into() }
    }

    pub fn system() -> Self {
        ChannelStore::new(DEFAULT_CONFIG_PATH)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the config; `None` when the file does not exist.
    pub fn load(&self) -> Result<Option<NotifyConfig>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", self.path.display()));
            }
        };
        let cfg: NotifyConfig = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        validate_config(&cfg)?;
        Ok(Some(cfg))
    }

    /// Validate, back up the current file, then write atomically (0600).
    pub fn save(&self, cfg: &NotifyConfig) -> Result<()> {
        validate_config(cfg)?;

        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        if self.path.exists() {
            let backup = self.backup_path();
            std::fs::copy(&self.path, &backup)
                .with_context(|| format!("failed to back up config to {}", backup.display()))?;
        }

        let data = serde_json::to_vec_pretty(cfg).context("failed to encode config")?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp)
                .with_context(|| format!("failed to open {}", tmp.display()))?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }

    /// Remove the config file. Missing file is fine.
    pub fn delete(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete {}", self.path.display())),
        }
    }

    /// Enable/disable channels matched by the selector. Returns how many
    /// entries changed state.
    pub fn set_enabled(&self, selector: &ChannelSelector, enabled: bool) -> Result<usize> {
        let mut cfg = self
            .load()?
            .context("notification is not configured")?;

        let count = match selector {
            ChannelSelector::All => {
                let mut n = 0;
                for ch in &mut cfg.channels {
                    if ch.enabled != enabled {
                        ch.enabled = enabled;
                        n += 1;
                    }
                }
                n
            }
            ChannelSelector::Name(name) => {
                let ch = cfg
                    .channels
                    .iter_mut()
                    .find(|c| &c.name == name)
                    .with_context(|| format!("no channel named {name:?}"))?;
                ch.enabled = enabled;
                1
            }
            ChannelSelector::Index(index) => {
                let len = cfg.channels.len();
                let ch = index
                    .checked_sub(1)
                    .and_then(|i| cfg.channels.get_mut(i))
                    .with_context(|| format!("index {index} out of range ({len} channels)"))?;
                ch.enabled = enabled;
                1
            }
            ChannelSelector::Kind(kind) => {
                let mut n = 0;
                for ch in &mut cfg.channels {
                    if ch.kind == *kind && ch.enabled != enabled {
                        ch.enabled = enabled;
                        n += 1;
                    }
                }
                n
            }
        };

        self.save(&cfg)?;
        Ok(count)
    }

    /// Delete channels matched by the selector. Returns how many were
    /// removed. `All` removes the file itself.
    pub fn delete_channels(&self, selector: &ChannelSelector) -> Result<usize> {
        if matches!(selector, ChannelSelector::All) {
            let existed = self.path.exists();
            self.delete()?;
            return Ok(usize::from(existed));
        }

        let mut cfg = self
            .load()?
            .context("notification is not configured")?;
        let before = cfg.channels.len();

        match selector {
            ChannelSelector::Name(name) => cfg.channels.retain(|c| &c.name != name),
            ChannelSelector::Kind(kind) => cfg.channels.retain(|c| c.kind != *kind),
            ChannelSelector::Index(index) => {
                if *index == 0 || *index > before {
                    bail!("index {index} out of range ({before} channels)");
                }
                cfg.channels.remove(index - 1);
            }
            ChannelSelector::All => unreachable!(),
        }

        let removed = before - cfg.channels.len();
        if removed == 0 {
            bail!("no matching channel");
        }
        self.save(&cfg)?;
        Ok(removed)
    }

    fn backup_path(&self) -> PathBuf {
        let mut os = self.path.as_os_str().to_owned();
        os.push(".backup");
        PathBuf::from(os)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn curl_channel(name: &str, enabled: bool) -> ChannelConfig {
        ChannelConfig {
            name: name.to_string(),
            enabled,
            kind: ChannelKind::Curl,
            curl: Some(CurlChannel {
                command: "curl -d '{\"m\":\"{{.User}}\"}' https://example.com/hook".to_string(),
            }),
            email: None,
        }
    }

    fn email_channel(name: &str) -> ChannelConfig {
        ChannelConfig {
            name: name.to_string(),
            enabled: true,
            kind: ChannelKind::Email,
            curl: None,
            email: Some(EmailChannel {
                to: "ops@example.com".to_string(),
                from: "sshield@example.com".to_string(),
                server: "smtp.example.com".to_string(),
                port: 587,
                user: "sshield".to_string(),
                pass: "secret".to_string(),
            }),
        }
    }

    fn store_in(dir: &TempDir) -> ChannelStore {
        ChannelStore::new(dir.path().join("notify.json"))
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(store_in(&dir).load().unwrap().is_none());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let mut cfg = NotifyConfig::default();
        cfg.channels.push(curl_channel("hook", true));
        cfg.channels.push(email_channel("mail"));
        store.save(&cfg).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.channels.len(), 2);
        assert_eq!(loaded.channels[0].name, "hook");
        assert_eq!(loaded.channels[1].kind, ChannelKind::Email);
    }

    #[test]
    fn test_save_is_0600_and_backs_up() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let mut cfg = NotifyConfig::default();
        cfg.channels.push(curl_channel("a", true));
        store.save(&cfg).unwrap();

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        // Second save must leave a backup of the first content.
        cfg.channels.push(email_channel("b"));
        store.save(&cfg).unwrap();
        let backup = dir.path().join("notify.json.backup");
        let backed: NotifyConfig =
            serde_json::from_str(&std::fs::read_to_string(backup).unwrap()).unwrap();
        assert_eq!(backed.channels.len(), 1);
    }

    #[test]
    fn test_invalid_config_rejected_before_write() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let mut cfg = NotifyConfig::default();
        let mut bad = email_channel("mail");
        bad.email.as_mut().unwrap().to = "not-an-address".to_string();
        cfg.channels.push(bad);

        assert!(store.save(&cfg).is_err());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_validation_rules() {
        let mut ch = email_channel("e");
        ch.email.as_mut().unwrap().port = 0;
        assert!(validate_channel(&ch).is_err());

        let mut ch = curl_channel("c", true);
        ch.curl.as_mut().unwrap().command = "curl -X POST".to_string(); // no URL
        assert!(validate_channel(&ch).is_err());

        let mut ch = curl_channel("c", true);
        ch.email = email_channel("x").email;
        assert!(validate_channel(&ch).is_err());

        let mut cfg = NotifyConfig::default();
        cfg.channels.push(curl_channel("dup", true));
        cfg.channels.push(curl_channel("dup", false));
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_email_address_check() {
        assert!(is_valid_email("ops@example.com"));
        assert!(!is_valid_email("ops"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("ops@nodot"));
        assert!(!is_valid_email("ops @example.com"));
        assert!(!is_valid_email("ops@example.com\r\nBcc: x@y.com"));
    }

    #[test]
    fn test_upsert_by_name() {
        let mut cfg = NotifyConfig::default();
        cfg.upsert(curl_channel("hook", true));
        cfg.upsert(email_channel("mail"));
        assert_eq!(cfg.channels.len(), 2);

        let mut updated = curl_channel("hook", false);
        updated.curl = Some(CurlChannel {
            command: "curl https://example.com/v2".to_string(),
        });
        cfg.upsert(updated);
        assert_eq!(cfg.channels.len(), 2);
        assert!(!cfg.channels[0].enabled);
        assert!(cfg.channels[0].curl.as_ref().unwrap().command.ends_with("/v2"));
    }

    #[test]
    fn test_enabled_channels_filtering() {
        let mut cfg = NotifyConfig::default();
        cfg.channels.push(curl_channel("on", true));
        cfg.channels.push(curl_channel("off", false));
        let names: Vec<_> = cfg.enabled_channels().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["on"]);
    }

    #[test]
    fn test_set_enabled_selectors() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let mut cfg = NotifyConfig::default();
        cfg.channels.push(curl_channel("a", true));
        cfg.channels.push(curl_channel("b", true));
        cfg.channels.push(email_channel("c"));
        store.save(&cfg).unwrap();

        assert_eq!(store.set_enabled(&ChannelSelector::Name("b".into()), false).unwrap(), 1);
        assert_eq!(store.set_enabled(&ChannelSelector::Index(3), false).unwrap(), 1);
        let cfg = store.load().unwrap().unwrap();
        assert!(cfg.channels[0].enabled);
        assert!(!cfg.channels[1].enabled);
        assert!(!cfg.channels[2].enabled);

        // Re-enabling everything counts only the flipped ones.
        assert_eq!(store.set_enabled(&ChannelSelector::All, true).unwrap(), 2);

        assert!(store.set_enabled(&ChannelSelector::Name("zzz".into()), true).is_err());
        assert!(store.set_enabled(&ChannelSelector::Index(9), true).is_err());
    }

    #[test]
    fn test_delete_selectors() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let mut cfg = NotifyConfig::default();
        cfg.channels.push(curl_channel("a", true));
        cfg.channels.push(curl_channel("b", true));
        cfg.channels.push(email_channel("c"));
        store.save(&cfg).unwrap();

        assert_eq!(store.delete_channels(&ChannelSelector::Index(1)).unwrap(), 1);
        assert_eq!(
            store.delete_channels(&ChannelSelector::Kind(ChannelKind::Email)).unwrap(),
            1
        );
        let cfg = store.load().unwrap().unwrap();
        assert_eq!(cfg.channels.len(), 1);
        assert_eq!(cfg.channels[0].name, "b");

        assert_eq!(store.delete_channels(&ChannelSelector::All).unwrap(), 1);
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_display_name() {
        assert_eq!(curl_channel("hook", true).display_name(), "hook");
        assert_eq!(curl_channel("", true).display_name(), "curl");
    }
}
