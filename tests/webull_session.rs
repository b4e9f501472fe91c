mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use common::{eventually, fast_config, record, strings};
use optfeed_rs::market_data::adapters::{Credential, Venue};
use optfeed_rs::market_data::events::{EventKind, FeedEvent};
use optfeed_rs::market_data::router::FeedRouter;
use optfeed_rs::FeedError;

const OPT: &str = "SPY240119C00500000";

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    Normal,
    /// Close the first connection once it has subscribed to three symbols.
    DropFirst,
    /// Serve a single connection, stop listening, then close it.
    DieAfterFirst,
}

/// (connection number, frame) for every frame a client sends.
type Frames = mpsc::UnboundedReceiver<(usize, Value)>;

async fn serve_connection(tcp: TcpStream, id: usize, mode: Mode, tx: mpsc::UnboundedSender<(usize, Value)>) {
    let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
    while let Some(Ok(msg)) = ws.next().await {
        let Message::Text(text) = msg else { continue };
        let frame: Value = serde_json::from_str(&text).unwrap();
        let _ = tx.send((id, frame.clone()));
        match frame["type"].as_str() {
            Some("auth") => {
                ws.send(Message::Text(r#"{"type":"auth","status":"ok"}"#.into())).await.unwrap();
            }
            Some("subscribe") => {
                let count = frame["symbols"].as_array().map(Vec::len).unwrap_or(0);
                if id == 1 && count == 3 && mode != Mode::Normal {
                    let _ = ws.close(None).await;
                    return;
                }
            }
            _ => {}
        }
    }
}

async fn spawn_server(mode: Mode) -> (String, Frames) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut id = 0;
        loop {
            let (tcp, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            id += 1;
            if mode == Mode::DieAfterFirst {
                drop(listener);
                serve_connection(tcp, id, mode, tx).await;
                return;
            }
            tokio::spawn(serve_connection(tcp, id, mode, tx.clone()));
        }
    });
    (url, rx)
}

/// Next subscribe frame: its connection number and symbol set.
async fn next_subscribe(frames: &mut Frames) -> (usize, BTreeSet<String>) {
    loop {
        let (id, frame) = tokio::time::timeout(Duration::from_secs(5), frames.recv())
            .await
            .expect("no subscribe frame")
            .expect("server stopped");
        if frame["type"] == "subscribe" {
            let symbols = frame["symbols"]
                .as_array()
                .unwrap()
                .iter()
                .map(|s| s.as_str().unwrap().to_string())
                .collect();
            return (id, symbols);
        }
    }
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

async fn connected_router(url: String) -> FeedRouter {
    let mut cfg = fast_config();
    cfg.endpoints.webull_ws = url;
    let mut router = FeedRouter::new(cfg);
    router.connect(Venue::Webull, Credential::new("tok")).await.unwrap();
    router
}

#[tokio::test]
async fn test_unsubscribe_rebuilds_connection_with_remaining_symbols() {
    let (url, mut frames) = spawn_server(Mode::Normal).await;
    let mut cfg = fast_config();
    cfg.endpoints.webull_ws = url;
    let mut router = FeedRouter::new(cfg);
    let connected = record(&router, EventKind::Connected);
    let disconnected = record(&router, EventKind::Disconnected);
    let errors = record(&router, EventKind::Error);

    router.connect(Venue::Webull, Credential::new("tok")).await.unwrap();
    router.subscribe_to_tickers(&strings(&["SPY", "QQQ"])).await.unwrap();
    router.subscribe_to_options(&strings(&[OPT])).await.unwrap();

    let (id, symbols) = next_subscribe(&mut frames).await;
    assert_eq!((id, symbols), (1, set(&["SPY", "QQQ"])));
    let (id, symbols) = next_subscribe(&mut frames).await;
    assert_eq!((id, symbols), (1, set(&["SPY", "QQQ", OPT])));

    router.unsubscribe_tickers(&strings(&["QQQ"])).await.unwrap();

    let (id, symbols) = next_subscribe(&mut frames).await;
    assert_eq!(id, 2);
    assert_eq!(symbols, set(&["SPY", OPT]));

    eventually("second connected event", || connected.lock().len() == 2).await;
    assert_eq!(router.get_subscribed_tickers(), strings(&["SPY"]));
    assert_eq!(router.get_subscribed_options(), strings(&[OPT]));
    assert!(router.is_connected());
    assert_eq!(
        *disconnected.lock(),
        vec![FeedEvent::Disconnected { venue: Venue::Webull, reason: "rebuild".into() }]
    );
    assert!(errors.lock().is_empty());

    router.disconnect().await;
    assert!(router.get_subscribed_tickers().is_empty());
}

#[tokio::test]
async fn test_dropped_connection_replays_full_subscription_set() {
    let (url, mut frames) = spawn_server(Mode::DropFirst).await;
    let mut router = connected_router(url).await;
    let connected = record(&router, EventKind::Connected);
    let errors = record(&router, EventKind::Error);

    router.subscribe_to_tickers(&strings(&["SPY", "QQQ"])).await.unwrap();
    router.subscribe_to_options(&strings(&[OPT])).await.unwrap();
    assert_eq!(next_subscribe(&mut frames).await.0, 1);
    assert_eq!(next_subscribe(&mut frames).await.0, 1);

    // Server hangs up; the session reconnects and replays everything once
    let (id, symbols) = next_subscribe(&mut frames).await;
    assert_eq!(id, 2);
    assert_eq!(symbols, set(&["SPY", "QQQ", OPT]));
    eventually("reconnected", || connected.lock().len() == 1).await;
    assert_eq!(router.session_state().unwrap().reconnect_attempts, 0);
    assert!(errors.lock().is_empty());
}

#[tokio::test]
async fn test_reconnect_gives_up_after_max_attempts() {
    let (url, mut frames) = spawn_server(Mode::DieAfterFirst).await;
    let mut router = connected_router(url).await;
    let errors = record(&router, EventKind::Error);

    router.subscribe_to_tickers(&strings(&["SPY", "QQQ", "IWM"])).await.unwrap();
    next_subscribe(&mut frames).await;

    eventually("terminal error", || !errors.lock().is_empty()).await;
    assert_eq!(
        errors.lock()[0],
        FeedEvent::Error { venue: Some(Venue::Webull), error: FeedError::ReconnectExhausted { attempts: 2 } }
    );
    assert!(!router.is_connected());
    // Subscriptions survive so a later connect can replay them
    assert_eq!(router.get_subscribed_tickers().len(), 3);
}

#[tokio::test]
async fn test_rejected_auth_fails_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        let _ = ws.next().await;
        ws.send(Message::Text(r#"{"type":"auth","status":"denied","message":"expired"}"#.into()))
            .await
            .unwrap();
        let _ = ws.next().await;
    });

    let mut cfg = fast_config();
    cfg.endpoints.webull_ws = url;
    let mut router = FeedRouter::new(cfg);
    let err = router.connect(Venue::Webull, Credential::new("stale")).await.unwrap_err();
    assert!(matches!(err, FeedError::Auth(_)));
    assert!(router.active_venue().is_none());
}
