// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Curl-style webhook channel.
//!
//! The channel config stores a curl command line; we parse it once into a
//! [`CurlRequest`] (method, URL, headers, body) and execute it per event
//! with template rendering applied to the URL, body, and header values.
//!
//! Recognized arguments: `-X/--request`, `-H/--header`, `-d/--data/
//! --data-raw`, and a bare `http(s)://` URL. Anything else is skipped,
//! together with its value when the following token is neither a flag nor
//! a URL.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};

use crate::template::{self, Context};

/// Timeout for the whole webhook request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A curl command parsed down to the parts we execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurlRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Split a command line into tokens, honoring single/double quotes,
/// backslash escapes, and `\`-newline line continuations. An unclosed
/// quote is an error.
pub fn tokenize(cmd: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quote: Option<char> = None;
    let mut escape = false;

    let mut chars = cmd.chars().peekable();
    while let Some(ch) = chars.next() {
        if escape {
            escape = false;
            match ch {
                // An escaped newline is a line continuation and vanishes.
                '\n' => {}
                '\r' => {
                    if chars.peek() == Some(&'\n') {
                        chars.next();
                    }
                }
                _ => current.push(ch),
            }
            continue;
        }
        if ch == '\\' {
            escape = true;
            continue;
        }
        if let Some(q) = in_quote {
            if ch == q {
                in_quote = None;
            } else {
                current.push(ch);
            }
            continue;
        }
        match ch {
            '"' | '\'' => in_quote = Some(ch),
            ' ' | '\t' | '\n' | '\r' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(ch),
        }
    }

    if !current.is_empty() {
        tokens.push(current);
    }
    if in_quote.is_some() {
        bail!("unclosed quote in curl command");
    }
    Ok(tokens)
}

fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

fn parse_header(h: &str) -> Option<(String, String)> {
    let idx = h.find(':')?;
    Some((h[..idx].trim().to_string(), h[idx + 1..].trim().to_string()))
}

/// Parse a curl command string. Fails without a URL or on a flag that is
/// missing its value.
pub fn parse_curl(cmd: &str) -> Result<CurlRequest> {
    let args = tokenize(cmd)?;

    let mut req = CurlRequest {
        method: "GET".to_string(),
        url: String::new(),
        headers: HashMap::new(),
        body: String::new(),
    };

    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "curl" => {}
            "-X" | "--request" => {
                i += 1;
                let value = args.get(i).with_context(|| format!("missing value for {arg}"))?;
                req.method = value.to_uppercase();
            }
            "-H" | "--header" => {
                i += 1;
                let value = args.get(i).with_context(|| format!("missing value for {arg}"))?;
                let (key, val) =
                    parse_header(value).with_context(|| format!("invalid header format: {value}"))?;
                req.headers.insert(key, val);
            }
            "-d" | "--data" | "--data-raw" => {
                i += 1;
                let value = args.get(i).with_context(|| format!("missing value for {arg}"))?;
                req.body = value.clone();
                if req.method == "GET" {
                    req.method = "POST".to_string();
                }
            }
            _ if arg.starts_with('-') => {
                // Unknown flag: skip it, and skip its value when the next
                // token is neither a flag nor the URL.
                if let Some(next) = args.get(i + 1) {
                    if !next.starts_with('-') && !is_url(next) {
                        i += 1;
                    }
                }
            }
            _ => {
                if is_url(arg) {
                    req.url = arg.to_string();
                }
            }
        }
        i += 1;
    }

    if req.url.is_empty() {
        bail!("no URL found in curl command");
    }
    Ok(req)
}

/// One configured curl channel, ready to fire per event.
pub struct CurlNotifier {
    request: CurlRequest,
}

impl CurlNotifier {
    pub fn new(command: &str) -> Result<Self> {
        Ok(CurlNotifier {
            request: parse_curl(command)?,
        })
    }

    /// Render the request against the event context and execute it.
    /// Any status outside `[200, 300)` is an error carrying the response
    /// body text.
    pub async fn send(&self, ctx: &dyn Context) -> Result<()> {
        let url = template::render(&self.request.url, ctx).context("failed to render URL template")?;
        let body = template::render(&self.request.body, ctx).context("failed to render body template")?;

        let method = reqwest::Method::from_bytes(self.request.method.as_bytes())
            .with_context(|| format!("invalid HTTP method {:?}", self.request.method))?;

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;

        let mut builder = client.request(method, &url);
        let mut has_content_type = false;
        for (key, value) in &self.request.headers {
            let rendered =
                template::render(value, ctx).with_context(|| format!("failed to render header {key}"))?;
            if key.eq_ignore_ascii_case("content-type") {
                has_content_type = true;
            }
            builder = builder.header(key, rendered);
        }

        if !body.is_empty() {
            if !has_content_type {
                builder = builder.header("Content-Type", "application/json");
            }
            builder = builder.body(body);
        }

        let resp = builder.send().await.context("webhook request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("webhook returned status {}: {}", status.as_u16(), text);
        }
        Ok(())
    }
}
