//! IP geolocation enrichment with provider fallback and a process-wide cache.
//!
//! Private ranges short-circuit to a fixed label without any network I/O.
//! Public addresses go through ipinfo.io, then ip-api.com; the first
//! non-empty `Country/Region/City` answer wins and is cached. A total
//! failure caches an empty string so a dead provider never stalls the
//! pipeline twice for the same address.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::debugf;

/// Label for loopback/RFC1918/link-local sources.
pub const PRIVATE_LABEL: &str = "private";

/// Per-request and whole-lookup budget.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct LookupResult {
    country: String,
    region: String,
    city: String,
}

impl LookupResult {
    /// `"Country, Region, City"` with empty parts and the
    /// region-equals-city duplicate removed.
    fn render(&self) -> String {
        let mut parts = Vec::new();
        if !self.country.is_empty() {
            parts.push(self.country.as_str());
        }
        if !self.region.is_empty() && self.region != self.city {
            parts.push(self.region.as_str());
        }
        if !self.city.is_empty() {
            parts.push(self.city.as_str());
        }
        parts.join(", ")
    }
}

struct IpLookup {
    client: reqwest::Client,
    cache: Mutex<HashMap<String, String>>,
}

static LOOKUP: OnceLock<IpLookup> = OnceLock::new();

fn global() -> &'static IpLookup {
    LOOKUP.get_or_init(|| IpLookup {
        client: reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .unwrap_or_default(),
        cache: Mutex::new(HashMap::new()),
    })
}

/// Geolocate an address. Never fails: unknown stays an empty string.
pub async fn lookup(ip: &str) -> String {
    if is_private_ip(ip) {
        return PRIVATE_LABEL.to_string();
    }

    let lookup = global();
    if let Some(cached) = lookup.cache.lock().ok().and_then(|c| c.get(ip).cloned()) {
        return cached;
    }

    let rendered = match tokio::time::timeout(LOOKUP_TIMEOUT, query_providers(lookup, ip)).await {
        Ok(result) => result,
        Err(_) => {
            debugf!("ip lookup timed out for {ip}");
            String::new()
        }
    };

    if let Ok(mut cache) = lookup.cache.lock() {
        cache.insert(ip.to_string(), rendered.clone());
    }
    rendered
}

async fn query_providers(lookup: &IpLookup, ip: &str) -> String {
    match query_ipinfo(&lookup.client, ip).await {
        Ok(result) if !result.render().is_empty() => return result.render(),
        Ok(_) => {}
        Err(e) => debugf!("ip lookup failed provider=ipinfo.io ip={ip} err={e:#}"),
    }
    match query_ip_api(&lookup.client, ip).await {
        Ok(result) if !result.render().is_empty() => result.render(),
        Ok(_) => String::new(),
        Err(e) => {
            debugf!("ip lookup failed provider=ip-api.com ip={ip} err={e:#}");
            String::new()
        }
    }
}

async fn query_ipinfo(client: &reqwest::Client, ip: &str) -> Result<LookupResult> {
    #[derive(Deserialize)]
    struct Reply {
        #[serde(default)]
        country: String,
        #[serde(default)]
        region: String,
        #[serde(default)]
        city: String,
    }

    let url = format!("https://ipinfo.io/{ip}/json");
    let resp = client.get(&url).send().await.context("request failed")?;
    if !resp.status().is_success() {
        bail!("status {}", resp.status().as_u16());
    }
    let reply: Reply = resp.json().await.context("invalid reply")?;
    Ok(LookupResult {
        country: reply.country,
        region: reply.region,
        city: reply.city,
    })
}

async fn query_ip_api(client: &reqwest::Client, ip: &str) -> Result<LookupResult> {
    #[derive(Deserialize)]
    struct Reply {
        #[serde(default)]
        status: String,
        #[serde(default)]
        country: String,
        #[serde(default, rename = "regionName")]
        region_name: String,
        #[serde(default)]
        city: String,
    }

    let url = format!("http://ip-api.com/json/{ip}?fields=status,country,regionName,city");
    let resp = client.get(&url).send().await.context("request failed")?;
    if !resp.status().is_success() {
        bail!("status {}", resp.status().as_u16());
    }
    let reply: Reply = resp.json().await.context("invalid reply")?;
    if reply.status != "success" {
        bail!("lookup failed");
    }
    Ok(LookupResult {
        country: reply.country,
        region: reply.region_name,
        city: reply.city,
    })
}

/// Loopback, RFC1918, unique-local v6 (`fc00::/7`), and link-local
/// (`fe80::/10`) ranges. Unparseable strings are not private.
pub fn is_private_ip(ip: &str) -> bool {
    let Ok(addr) = ip.parse::<IpAddr>() else {
        return false;
    };
    match addr {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => {
            if v6.is_loopback() {
                return true;
            }
            let seg = v6.segments();
            // fc00::/7 unique-local, fe80::/10 link-local
            (seg[0] & 0xfe00) == 0xfc00 || (seg[0] & 0xffc0) == 0xfe80
        }
    }
}
