//! Display-timezone resolution and formatting.
//!
//! Events are stored in UTC; only presentation (console summaries, email
//! bodies, webhook templates) goes through a [`DisplayZone`]. The default
//! zone is Asia/Shanghai; `--timezone` accepts any IANA name plus the
//! aliases `local` and `utc+8`.

use anyhow::Result;
use chrono::{DateTime, FixedOffset, Local, Utc};
use chrono_tz::Tz;

/// A resolved display timezone.
#[derive(Debug, Clone, Copy)]
pub enum DisplayZone {
    /// An IANA zone (the default is Asia/Shanghai).
    Named(Tz),
    /// A fixed UTC offset (the `utc+8` alias).
    Fixed(FixedOffset),
    /// The host's local zone (the `local` alias).
    Local,
}

impl Default for DisplayZone {
    fn default() -> Self {
        DisplayZone::Named(chrono_tz::Asia::Shanghai)
    }
}

impl DisplayZone {
    /// Resolve a zone name. Empty means the default.
    pub fn resolve(name: &str) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(Self::default());
        }
        if name.eq_ignore_ascii_case("local") {
            return Ok(DisplayZone::Local);
        }
        if name.eq_ignore_ascii_case("utc+8") {
            // East offset is always in range, but FixedOffset::east_opt is fallible.
            let offset = FixedOffset::east_opt(8 * 3600)
                .ok_or_else(|| anyhow::anyhow!("invalid fixed offset"))?;
            return Ok(DisplayZone::Fixed(offset));
        }
        let tz: Tz = name
            .parse()
            .map_err(|_| anyhow::anyhow!("unrecognized timezone {name:?}"))?;
        Ok(DisplayZone::Named(tz))
    }

    /// `2006-01-02 15:04:05 +08:00`-style line for console summaries.
    pub fn format(&self, t: DateTime<Utc>) -> String {
        const FMT: &str = "%Y-%m-%d %H:%M:%S %:z";
        match self {
            DisplayZone::Named(tz) => t.with_timezone(tz).format(FMT).to_string(),
            DisplayZone::Fixed(off) => t.with_timezone(off).format(FMT).to_string(),
            DisplayZone::Local => t.with_timezone(&Local).format(FMT).to_string(),
        }
    }

    /// RFC 3339 timestamp in this zone (email bodies, templates).
    pub fn format_rfc3339(&self, t: DateTime<Utc>) -> String {
        match self {
            DisplayZone::Named(tz) => t.with_timezone(tz).to_rfc3339(),
            DisplayZone::Fixed(off) => t.with_timezone(off).to_rfc3339(),
            DisplayZone::Local => t.with_timezone(&Local).to_rfc3339(),
        }
    }
}
