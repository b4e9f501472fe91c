#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use optfeed_rs::config::FeedConfig;
use optfeed_rs::market_data::events::{EventKind, FeedEvent};
use optfeed_rs::market_data::router::FeedRouter;

/// Short delays so reconnect paths finish quickly.
pub fn fast_config() -> FeedConfig {
    let mut cfg = FeedConfig::default();
    cfg.reconnect.base_delay_ms = 20;
    cfg.reconnect.max_attempts = 2;
    cfg.connect_timeout_ms = 2_000;
    cfg.handshake_timeout_ms = 2_000;
    cfg
}

pub fn record(router: &FeedRouter, kind: EventKind) -> Arc<Mutex<Vec<FeedEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    router.on(kind, move |e| sink.lock().push(e.clone()));
    seen
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Read an HTTP/1.1 request head and return its path. Bodies are ignored.
pub async fn read_request_path(tcp: &mut tokio::net::TcpStream) -> Option<String> {
    use tokio::io::AsyncReadExt;

    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = tcp.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        head.extend_from_slice(&buf[..n]);
    }
    let text = String::from_utf8_lossy(&head);
    text.lines().next()?.split_whitespace().nth(1).map(str::to_string)
}

/// Complete `Connection: close` response with a JSON body.
pub fn json_response(status: u16, body: &str) -> String {
    let reason = match status {
        200 => "OK",
        401 => "Unauthorized",
        _ => "Error",
    };
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    )
}
