//! End-to-end pipeline scenarios: mock webhook and SMTP sinks on loopback,
//! real cursor files in temp dirs. Source IPs in fixtures are private so
//! enrichment never performs network I/O.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::channels::{ChannelConfig, ChannelKind, ChannelStore, CurlChannel, EmailChannel, NotifyConfig};
use crate::cursor::CursorStore;
use crate::event::{EventType, LoginEvent};
use crate::filter::{NotifyFilter, NotifyOn};
use crate::timeutil::DisplayZone;
use crate::watcher::{dispatch_event, Advance, Pipeline};
use crate::{journal, logfile, parser};

/// One captured HTTP request.
#[derive(Debug, Clone)]
struct CapturedRequest {
    request_line: String,
    headers: Vec<String>,
    body: String,
}

impl CapturedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        let prefix = format!("{}:", name.to_lowercase());
        self.headers
            .iter()
            .find(|h| h.to_lowercase().starts_with(&prefix))
            .map(|h| h[prefix.len()..].trim())
    }
}

/// Minimal HTTP sink: answers 200 to every request and records them.
async fn spawn_http_sink() -> (String, Arc<Mutex<Vec<CapturedRequest>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();

    tokio::spawn(async move {
        loop {
            let Ok((sock, _)) = listener.accept().await else {
                return;
            };
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(sock);
                let mut request_line = String::new();
                if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
                    return;
                }

                let mut headers = Vec::new();
                let mut content_length = 0usize;
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                        return;
                    }
                    let line = line.trim_end().to_string();
                    if line.is_empty() {
                        break;
                    }
                    if let Some(v) = line.to_lowercase().strip_prefix("content-length:") {
                        content_length = v.trim().parse().unwrap_or(0);
                    }
                    headers.push(line);
                }

                let mut body = vec![0u8; content_length];
                if content_length > 0 {
                    let _ = reader.read_exact(&mut body).await;
                }

                sink.lock().unwrap().push(CapturedRequest {
                    request_line: request_line.trim_end().to_string(),
                    headers,
                    body: String::from_utf8_lossy(&body).into_owned(),
                });

                let _ = reader
                    .get_mut()
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await;
            });
        }
    });

    (format!("127.0.0.1:{}", addr.port()), captured)
}

/// Scripted SMTP sink for a single session. Returns the client lines seen
/// (commands plus message payload).
async fn spawn_smtp_sink() -> (u16, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let transcript = Arc::new(Mutex::new(Vec::new()));
    let sink = transcript.clone();

    tokio::spawn(async move {
        let Ok((sock, _)) = listener.accept().await else {
            return;
        };
        let mut reader = BufReader::new(sock);
        let record = |sink: &Arc<Mutex<Vec<String>>>, line: &str| {
            sink.lock().unwrap().push(line.trim_end().to_string());
        };

        reader.write_all(b"220 sink ESMTP\r\n").await.unwrap();

        let mut line = String::new();
        let mut in_data = false;
        loop {
            line.clear();
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                return;
            }
            record(&sink, &line);
            let upper = line.trim_end().to_uppercase();

            if in_data {
                if line.trim_end() == "." {
                    in_data = false;
                    reader.write_all(b"250 queued\r\n").await.unwrap();
                }
                continue;
            }

            let reply: &[u8] = if upper.starts_with("EHLO") {
                b"250-sink\r\n250 AUTH PLAIN\r\n"
            } else if upper.starts_with("AUTH") {
                b"235 ok\r\n"
            } else if upper.starts_with("MAIL") || upper.starts_with("RCPT") {
                b"250 ok\r\n"
            } else if upper.starts_with("DATA") {
                in_data = true;
                b"354 go ahead\r\n"
            } else if upper.starts_with("QUIT") {
                reader.write_all(b"221 bye\r\n").await.unwrap();
                return;
            } else {
                b"500 what\r\n"
            };
            reader.write_all(reply).await.unwrap();
        }
    });

    (port, transcript)
}

fn pipeline_with(dir: &tempfile::TempDir, notify: bool, fail_limit: usize) -> Pipeline {
    let store = CursorStore::new(dir.path().join("notify.state")).unwrap();
    let state = store.load().unwrap();
    Pipeline {
        store,
        state,
        filter: NotifyFilter::new(NotifyOn::All, fail_limit, chrono::Duration::hours(1)),
        zone: DisplayZone::default(),
        notify,
        print_all: true,
        cutoff: None,
        channels: ChannelStore::new(dir.path().join("notify.json")),
    }
}

fn save_curl_channel(store: &ChannelStore, command: &str) {
    let mut cfg = NotifyConfig::default();
    cfg.channels.push(ChannelConfig {
        name: "hook".to_string(),
        enabled: true,
        kind: ChannelKind::Curl,
        curl: Some(CurlChannel {
            command: command.to_string(),
        }),
        email: None,
    });
    store.save(&cfg).unwrap();
}

fn save_email_channel(store: &ChannelStore, port: u16) {
    let mut cfg = NotifyConfig::default();
    cfg.channels.push(ChannelConfig {
        name: "mail".to_string(),
        enabled: true,
        kind: ChannelKind::Email,
        curl: None,
        email: Some(EmailChannel {
            to: "ops@example.com".to_string(),
            from: "sshield@example.com".to_string(),
            server: "127.0.0.1".to_string(),
            port,
            user: "sshield".to_string(),
            pass: "secret".to_string(),
        }),
    });
    store.save(&cfg).unwrap();
}

// ── Scenario: journal success event delivered by email ─────────────────────

#[tokio::test]
async fn journal_success_event_reaches_email_channel() {
    let dir = tempfile::TempDir::new().unwrap();
    let (smtp_port, transcript) = spawn_smtp_sink().await;

    let mut pipeline = pipeline_with(&dir, true, 0);
    save_email_channel(&pipeline.channels, smtp_port);

    // A journald record as `journalctl -o json` would emit it.
    let record: journal::JournalRecord = serde_json::from_str(
        r#"{"MESSAGE":"Accepted publickey for root from 10.0.0.4 port 5555 ssh2","_HOSTNAME":"h","__REALTIME_TIMESTAMP":"1730000000000000","__CURSOR":"c1","_SYSTEMD_UNIT":"sshd.service"}"#,
    )
    .unwrap();
    let ts = journal::parse_realtime(&record.realtime);
    let mut event = parser::parse_journal_message(&record.message, &record.hostname, ts).unwrap();
    event.log_path = format!("journald:{}", record.unit);

    pipeline.handle(event, Advance::Journal(record.cursor)).await;

    let lines = transcript.lock().unwrap().clone();
    let all = lines.join("\n");
    assert!(all.contains("MAIL FROM:<sshield@example.com>"), "{all}");
    assert!(all.contains("RCPT TO:<ops@example.com>"), "{all}");
    assert!(all.contains("Subject: SSH login alert - login_success"), "{all}");
    for needle in ["root", "10.0.0.4", "5555", "publickey"] {
        assert!(all.contains(needle), "missing {needle} in session:\n{all}");
    }

    // Cursor advanced to the record's cursor token.
    assert_eq!(pipeline.store.load().unwrap().journal_cursor, "c1");
}

// ── Scenario: VERBOSE-level duplicate failure collapses to one dispatch ────

#[tokio::test]
async fn file_sweep_dedupes_failed_and_disconnect_pair() {
    let dir = tempfile::TempDir::new().unwrap();
    let (sink_addr, captured) = spawn_http_sink().await;

    let log = dir.path().join("auth.log");
    std::fs::write(
        &log,
        "Jan  2 10:00:00 h sshd[1]: Failed password for bob from 192.168.9.9 port 22 ssh2\n\
         Jan  2 10:00:02 h sshd[1]: Disconnected from authenticating user bob 192.168.9.9 port 22 [preauth]\n",
    )
    .unwrap();

    let mut pipeline = pipeline_with(&dir, true, 0);
    save_curl_channel(
        &pipeline.channels,
        &format!("curl -d '{{\"user\":\"{{{{.User}}}}\"}}' http://{sink_addr}/notify"),
    );

    let cancel = CancellationToken::new();
    logfile::sweep(&cancel, &mut pipeline, &log, None).await.unwrap();

    // Exactly one dispatch: the Disconnected line is a duplicate.
    let requests = captured.lock().unwrap();
    assert_eq!(requests.len(), 1, "{requests:#?}");
    assert_eq!(requests[0].body, r#"{"user":"bob"}"#);

    // The offset still advances past both lines.
    let expected = std::fs::metadata(&log).unwrap().len() as i64;
    let state = pipeline.store.load().unwrap();
    assert_eq!(state.file_offsets[&log.display().to_string()], expected);
}

// ── Scenario: per-IP fail-rate limit ───────────────────────────────────────

#[tokio::test]
async fn rate_limit_caps_dispatches_but_not_cursor() {
    let dir = tempfile::TempDir::new().unwrap();
    let (sink_addr, captured) = spawn_http_sink().await;

    let mut pipeline = pipeline_with(&dir, true, 3);
    save_curl_channel(
        &pipeline.channels,
        &format!("curl -d '{{\"n\":\"{{{{.Port}}}}\"}}' http://{sink_addr}/notify"),
    );

    use chrono::TimeZone;
    for i in 0..4i64 {
        let event = LoginEvent {
            kind: EventType::LoginFailed,
            user: "bob".to_string(),
            ip: "172.16.5.5".to_string(),
            // Distinct ports keep the deduper out of the limiter's way.
            port: 40000 + i as u16,
            method: "password".to_string(),
            timestamp: chrono::Utc.timestamp_opt(1_730_000_000 + i * 150, 0).unwrap(),
            hostname: "h".to_string(),
            location: String::new(),
            log_path: String::new(),
            message: String::new(),
        };
        pipeline
            .handle(event, Advance::Journal(format!("c{}", i + 1)))
            .await;
    }

    let requests = captured.lock().unwrap();
    assert_eq!(requests.len(), 3, "fourth event must be suppressed");

    // The cursor advanced for all four events regardless.
    assert_eq!(pipeline.store.load().unwrap().journal_cursor, "c4");
}

// ── Scenario: curl template with conditional ───────────────────────────────

#[tokio::test]
async fn curl_template_renders_conditionals_and_headers() {
    let dir = tempfile::TempDir::new().unwrap();
    let (sink_addr, captured) = spawn_http_sink().await;

    let channels = ChannelStore::new(dir.path().join("notify.json"));
    save_curl_channel(
        &channels,
        &format!(
            "curl -X POST -H \"Content-Type: application/json\" -d '{{\"u\":\"{{{{.User}}}}\",\"c\":\"{{{{if eq .Type \\\"login_success\\\"}}}}g{{{{else}}}}r{{{{end}}}}\"}}' http://{sink_addr}/card"
        ),
    );

    use chrono::TimeZone;
    let event = LoginEvent {
        kind: EventType::LoginSuccess,
        user: "alice".to_string(),
        ip: "10.1.1.1".to_string(),
        port: 22,
        method: "publickey".to_string(),
        timestamp: chrono::Utc.timestamp_opt(1_730_000_000, 0).unwrap(),
        hostname: "h".to_string(),
        location: String::new(),
        log_path: String::new(),
        message: String::new(),
    };

    dispatch_event(&channels, &event, &DisplayZone::default()).await.unwrap();

    let requests = captured.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].request_line.starts_with("POST /card"));
    assert_eq!(requests[0].header("content-type"), Some("application/json"));
    assert_eq!(requests[0].body, r#"{"u":"alice","c":"g"}"#);
}

// ── Scenario: failed dispatch still surfaces per-channel errors ────────────

#[tokio::test]
async fn one_bad_channel_does_not_block_the_other() {
    let dir = tempfile::TempDir::new().unwrap();
    let (sink_addr, captured) = spawn_http_sink().await;

    let channels = ChannelStore::new(dir.path().join("notify.json"));
    let mut cfg = NotifyConfig::default();
    // First channel points at a closed port and fails fast.
    cfg.channels.push(ChannelConfig {
        name: "dead".to_string(),
        enabled: true,
        kind: ChannelKind::Curl,
        curl: Some(CurlChannel {
            command: "curl -d x http://127.0.0.1:9/nope".to_string(),
        }),
        email: None,
    });
    cfg.channels.push(ChannelConfig {
        name: "alive".to_string(),
        enabled: true,
        kind: ChannelKind::Curl,
        curl: Some(CurlChannel {
            command: format!("curl -d '{{\"ok\":1}}' http://{sink_addr}/alive"),
        }),
        email: None,
    });
    channels.save(&cfg).unwrap();

    let event = LoginEvent::test_event();
    let err = dispatch_event(&channels, &event, &DisplayZone::default())
        .await
        .unwrap_err();

    // The healthy channel was still reached.
    let requests = captured.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].request_line.contains("/alive"));

    // And the error names the dead channel.
    assert!(format!("{err:#}").contains("dead"));
}

// ── Scenario: at-least-once replay when the cursor does not advance ────────

#[tokio::test]
async fn unadvanced_cursor_replays_events() {
    let dir = tempfile::TempDir::new().unwrap();
    let (sink_addr, captured) = spawn_http_sink().await;

    let log = dir.path().join("auth.log");
    std::fs::write(
        &log,
        "Jan  2 10:00:00 h sshd[1]: Failed password for eve from 10.2.3.4 port 999 ssh2\n",
    )
    .unwrap();

    {
        let mut pipeline = pipeline_with(&dir, true, 0);
        save_curl_channel(
            &pipeline.channels,
            &format!("curl -d replay http://{sink_addr}/hit"),
        );
        let cancel = CancellationToken::new();
        logfile::sweep(&cancel, &mut pipeline, &log, None).await.unwrap();
    }
    assert_eq!(captured.lock().unwrap().len(), 1);

    // Simulate a crash before the cursor was saved.
    std::fs::write(dir.path().join("notify.state"), "").unwrap();

    {
        let mut pipeline = pipeline_with(&dir, true, 0);
        let cancel = CancellationToken::new();
        logfile::sweep(&cancel, &mut pipeline, &log, None).await.unwrap();
    }

    // The same event was dispatched again: at-least-once, not exactly-once.
    assert_eq!(captured.lock().unwrap().len(), 2);
}

// ── Scenario: journalctl subprocess wiring ─────────────────────────────────

#[tokio::test]
async fn journal_run_consumes_fake_journalctl() {
    let dir = tempfile::TempDir::new().unwrap();

    // A stand-in journalctl that emits two records and exits.
    let bin_dir = dir.path().join("bin");
    std::fs::create_dir(&bin_dir).unwrap();
    let script = bin_dir.join("journalctl");
    std::fs::write(
        &script,
        "#!/bin/sh\n\
         echo '{\"MESSAGE\":\"Accepted publickey for root from 10.9.9.9 port 22 ssh2\",\"_HOSTNAME\":\"h\",\"__REALTIME_TIMESTAMP\":\"1730000000000000\",\"__CURSOR\":\"a1\",\"_SYSTEMD_UNIT\":\"sshd.service\"}'\n\
         echo 'not json'\n\
         echo '{\"MESSAGE\":\"Server listening on 0.0.0.0 port 22.\",\"_HOSTNAME\":\"h\",\"__REALTIME_TIMESTAMP\":\"1730000001000000\",\"__CURSOR\":\"a2\",\"_SYSTEMD_UNIT\":\"sshd.service\"}'\n",
    )
    .unwrap();
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let old_path = std::env::var_os("PATH").unwrap_or_default();
    let mut paths = vec![bin_dir.clone()];
    paths.extend(std::env::split_paths(&old_path));
    std::env::set_var("PATH", std::env::join_paths(paths).unwrap());

    let mut pipeline = pipeline_with(&dir, false, 0);
    let cancel = CancellationToken::new();
    let units = vec!["sshd.service".to_string()];
    journal::run(&cancel, &mut pipeline, &units, false, None)
        .await
        .unwrap();

    std::env::set_var("PATH", old_path);

    // The matching record advanced the cursor; the non-matching one and the
    // garbage line were skipped without stalling the stream.
    assert_eq!(pipeline.store.load().unwrap().journal_cursor, "a1");
}
