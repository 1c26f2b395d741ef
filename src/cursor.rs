// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Durable read-position store.
//!
//! One small JSON file holds the journald cursor and the per-file byte
//! offsets. The invariant: after a successful [`CursorStore::save`], every
//! event strictly before the recorded position has been handed to the
//! dispatcher at least once. Saves are atomic (temp file + rename) so a
//! crash never leaves a truncated state file behind.

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const STATE_FILE_NAME: &str = "notify.state";
const DEFAULT_STATE_ROOT: &str = "/var/lib/sshield";

/// Read progress for every source this host has ever tailed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceState {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub journal_cursor: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub file_offsets: HashMap<String, i64>,
}

impl SourceState {
    /// Stored offset for a path, clamped to non-negative.
    pub fn offset_for(&self, path: &str) -> i64 {
        self.file_offsets.get(path).copied().unwrap_or(0).max(0)
    }
}

/// Persists [`SourceState`] at a fixed path.
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    /// Create a store, making the parent directory (mode 0700) if needed.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path: PathBuf = path.into();
        if path.as_os_str().is_empty() {
            anyhow::bail!("cursor path is required");
        }
        if let Some(dir) = path.parent() {
            create_private_dir(dir)?;
        }
        Ok(CursorStore { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the state. A missing or empty file yields an empty state; a
    /// file that is not JSON is the legacy format where the whole content
    /// is the journal cursor.
    pub fn load(&self) -> Result<SourceState> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SourceState::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read cursor {}", self.path.display()));
            }
        };

        if data.is_empty() {
            return Ok(SourceState::default());
        }

        match serde_json::from_str::<SourceState>(&data) {
            Ok(state) => Ok(state),
            Err(_) => Ok(SourceState {
                journal_cursor: data,
                file_offsets: HashMap::new(),
            }),
        }
    }

    /// Write the state atomically: temp file in the same directory, fsync,
    /// rename over the target. File mode 0600.
    pub fn save(&self, state: &SourceState) -> Result<()> {
        let data = serde_json::to_vec_pretty(state).context("failed to encode cursor state")?;

        let tmp = self.path.with_extension("state.tmp");
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
}

/// Default state path: `/var/lib/sshield/notify.state` for root, the user
/// config directory otherwise.
pub fn default_cursor_path() -> Result<PathBuf> {
    if crate::util::running_as_root() {
        create_private_dir(Path::new(DEFAULT_STATE_ROOT))?;
        return Ok(Path::new(DEFAULT_STATE_ROOT).join(STATE_FILE_NAME));
    }

    let config_dir = crate::util::user_config_dir()
        .context("failed to resolve a state directory (no XDG_CONFIG_HOME or HOME)")?;
    let dir = config_dir.join("sshield");
    create_private_dir(&dir)?;
    Ok(dir.join(STATE_FILE_NAME))
}

fn create_private_dir(dir: &Path) -> Result<()> {
    if dir.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create state directory {}", dir.display()))?;
    let perms = std::fs::Permissions::from_mode(0o700);
    std::fs::set_permissions(dir, perms)
        .with_context(|| format!("failed to set permissions on {}", dir.display()))?;
    Ok(())
}
