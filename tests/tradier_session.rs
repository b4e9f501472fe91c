mod common;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use common::{fast_config, json_response, read_request_path, record, strings};
use optfeed_rs::market_data::adapters::{Credential, Venue};
use optfeed_rs::market_data::events::EventKind;
use optfeed_rs::market_data::router::FeedRouter;

const OPT: &str = "SPY240119C00500000";

/// REST endpoint handing out session ids `S1`, `S2`, ...
async fn spawn_rest(sessions: Arc<AtomicUsize>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let api = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        while let Ok((mut tcp, _)) = listener.accept().await {
            let sessions = Arc::clone(&sessions);
            tokio::spawn(async move {
                let Some(path) = read_request_path(&mut tcp).await else { return };
                let res = if path.starts_with("/v1/markets/events/session") {
                    let n = sessions.fetch_add(1, Ordering::SeqCst) + 1;
                    let body = format!(r#"{{"stream":{{"url":"ws://unused","sessionid":"S{}"}}}}"#, n);
                    json_response(200, &body)
                } else {
                    json_response(404, "{}")
                };
                let _ = tcp.write_all(res.as_bytes()).await;
            });
        }
    });
    api
}

/// Socket that expires the first session once it carries three symbols.
async fn spawn_ws(frames: mpsc::UnboundedSender<(usize, Value)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let mut id = 0;
        while let Ok((tcp, _)) = listener.accept().await {
            id += 1;
            let frames = frames.clone();
            let conn = id;
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                while let Some(Ok(msg)) = ws.next().await {
                    let Message::Text(text) = msg else { continue };
                    let payload: Value = serde_json::from_str(&text).unwrap();
                    let expire = payload["sessionid"] == "S1" && payload["symbols"].as_array().map(Vec::len) == Some(3);
                    let _ = frames.send((conn, payload));
                    if expire {
                        ws.send(Message::Text(r#"{"error":"session not found"}"#.into())).await.unwrap();
                    }
                }
            });
        }
    });
    url
}

async fn next_payload(rx: &mut mpsc::UnboundedReceiver<(usize, Value)>) -> (usize, String, BTreeSet<String>) {
    let (conn, v) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no payload")
        .expect("server stopped");
    let symbols = v["symbols"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s.as_str().unwrap().to_string())
        .collect();
    (conn, v["sessionid"].as_str().unwrap().to_string(), symbols)
}

#[tokio::test]
async fn test_expired_session_is_renegotiated_in_place() {
    let sessions = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut cfg = fast_config();
    cfg.endpoints.tradier_api = spawn_rest(Arc::clone(&sessions)).await;
    cfg.endpoints.tradier_ws = spawn_ws(tx).await;

    let mut router = FeedRouter::new(cfg);
    let errors = record(&router, EventKind::Error);
    let disconnected = record(&router, EventKind::Disconnected);

    router.connect(Venue::Tradier, Credential::new("tok")).await.unwrap();
    router.subscribe_to_tickers(&strings(&["SPY", "QQQ"])).await.unwrap();
    router.subscribe_to_options(&strings(&[OPT])).await.unwrap();

    let (conn, session, symbols) = next_payload(&mut rx).await;
    assert_eq!((conn, session.as_str(), symbols.len()), (1, "S1", 2));
    let (_, session, expected) = next_payload(&mut rx).await;
    assert_eq!((session.as_str(), expected.len()), ("S1", 3));

    // Same socket, fresh session id, identical symbol list
    let (conn, session, symbols) = next_payload(&mut rx).await;
    assert_eq!(conn, 1);
    assert_eq!(session, "S2");
    assert_eq!(symbols, expected);
    assert_eq!(sessions.load(Ordering::SeqCst), 2);

    assert!(router.is_connected());
    assert!(errors.lock().is_empty());
    assert!(disconnected.lock().is_empty());
    assert_eq!(router.get_subscribed_options(), strings(&[OPT]));
}
