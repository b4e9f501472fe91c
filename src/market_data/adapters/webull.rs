// Webull quotes socket. Auth happens in-band; the subscribe frame carries the
// whole symbol set and there is no way to drop a symbol, so unsubscribing
// rebuilds the connection with what is left.

use std::sync::Arc;

use async_trait::async_trait;
use itertools::Itertools;
use reqwest::header::AUTHORIZATION;
use tracing::{debug, warn};

use super::webull_types::{ClientFrame, OptionSnapshot, ServerFrame, WireQuote, WireTrade};
use super::ws::{ProtocolFactory, Signal, Step, UnsubscribePlan, WireProtocol, WsSession, WsSettings};
use super::{bearer, check_status, Credential, MarketUpdate, OpenInterestSource, Routed, SessionCore, SubscriptionSet, Venue};
use crate::config::FeedConfig;
use crate::error::{FeedError, FeedResult};
use crate::market_data::cache::QuoteFields;
use crate::market_data::events::EventBus;
use crate::market_data::normaliser::{epoch_ms, num, qty};
use crate::market_data::symbols::normalize_option;
use crate::market_data::types::now_ms;

const CHANNELS: [&str; 2] = ["quote", "trade"];
const SNAPSHOT_BATCH: usize = 50;

pub struct WebullProtocol {
    credential: Credential,
    ws_url: String,
}

impl WebullProtocol {
    pub fn new(credential: Credential, ws_url: String) -> Self {
        Self { credential, ws_url }
    }
}

fn encode(frame: &ClientFrame<'_>) -> Vec<String> {
    match serde_json::to_string(frame) {
        Ok(text) => vec![text],
        Err(e) => {
            warn!(error = %e, "failed to encode webull frame");
            Vec::new()
        }
    }
}

fn decode_quote(q: WireQuote, core: &SessionCore) -> MarketUpdate {
    let quote = QuoteFields { bid: num(&q.bid), bid_size: qty(&q.bid_size), ask: num(&q.ask), ask_size: qty(&q.ask_size) };
    let ts = epoch_ms(&q.timestamp).unwrap_or_else(now_ms);
    match core.route(&q.symbol) {
        Routed::Ticker(symbol) => MarketUpdate::TickerQuote { symbol, quote, ts },
        Routed::Option(symbol) => MarketUpdate::OptionQuote { symbol, quote, ts },
    }
}

fn decode_trade(t: WireTrade, core: &SessionCore) -> FeedResult<MarketUpdate> {
    let price = num(&t.price).ok_or_else(|| FeedError::Protocol(format!("trade without price for {}", t.symbol)))?;
    let size = qty(&t.size).unwrap_or(0);
    let ts = epoch_ms(&t.timestamp).unwrap_or_else(now_ms);
    Ok(match core.route(&t.symbol) {
        Routed::Ticker(symbol) => MarketUpdate::TickerTrade { symbol, price, size, day_volume: qty(&t.volume), ts },
        // No NBBO on the print: classified against the cached quote
        Routed::Option(symbol) => MarketUpdate::OptionTimesale { symbol, price, size, bid: None, ask: None, ts },
    })
}

#[async_trait]
impl WireProtocol for WebullProtocol {
    async fn authenticate(&mut self, _http: &reqwest::Client) -> FeedResult<String> {
        Ok(self.ws_url.clone())
    }

    fn on_open(&mut self) -> Step {
        Step::send(encode(&ClientFrame::Auth { token: &self.credential.access_token }))
    }

    fn on_text(&mut self, text: &str, core: &SessionCore) -> FeedResult<Step> {
        let frame: ServerFrame = serde_json::from_str(text)?;
        match frame {
            ServerFrame::Auth { status, .. } if status.eq_ignore_ascii_case("ok") => Ok(Step::signal(Signal::Ready)),
            ServerFrame::Auth { status, message } => Err(FeedError::Auth(format!(
                "webull auth {}: {}",
                status,
                message.unwrap_or_default()
            ))),
            ServerFrame::Quote(q) => Ok(Step::updates(vec![decode_quote(q, core)])),
            ServerFrame::Trade(t) => Ok(Step::updates(vec![decode_trade(t, core)?])),
            ServerFrame::Subscribed { symbols } => {
                debug!(count = symbols.len(), "webull subscription acknowledged");
                Ok(Step::none())
            }
            ServerFrame::Error { message } => Err(FeedError::Protocol(format!("webull: {}", message))),
            ServerFrame::Heartbeat {} => Ok(Step::none()),
        }
    }

    fn subscribe_frames(&mut self, _added: &SubscriptionSet, all: &SubscriptionSet, core: &SessionCore) -> Vec<String> {
        let symbols: Vec<String> = all
            .tickers
            .iter()
            .cloned()
            .chain(all.options.iter().filter_map(|o| core.option_native(o)))
            .collect();
        if symbols.is_empty() {
            return Vec::new();
        }
        encode(&ClientFrame::Subscribe { symbols, channels: CHANNELS })
    }

    fn unsubscribe_plan(&mut self, _removed: &SubscriptionSet, _remaining: &SubscriptionSet, _core: &SessionCore) -> UnsubscribePlan {
        UnsubscribePlan::Rebuild
    }
}

pub struct WebullOpenInterest {
    credential: Credential,
    api: String,
}

#[async_trait]
impl OpenInterestSource for WebullOpenInterest {
    async fn fetch(&self, http: &reqwest::Client, options: &[String]) -> FeedResult<Vec<(String, u64)>> {
        let mut out = Vec::with_capacity(options.len());
        for batch in options.chunks(SNAPSHOT_BATCH) {
            let res = http
                .get(format!("{}/market-data/options/snapshot", self.api))
                .query(&[("symbols", batch.iter().join(","))])
                .header(AUTHORIZATION, bearer(&self.credential))
                .send()
                .await?;
            let rows: Vec<OptionSnapshot> = check_status(res).await?.json().await?;
            for row in rows {
                if let (Some(oi), Ok(symbol)) = (qty(&row.open_interest), normalize_option(&row.symbol)) {
                    out.push((symbol, oi));
                }
            }
        }
        Ok(out)
    }
}

pub fn session(credential: Credential, config: &FeedConfig, bus: Arc<EventBus>) -> WsSession<WebullProtocol> {
    let ws_url = config.endpoints.webull_ws.clone();
    let factory: ProtocolFactory<WebullProtocol> = {
        let credential = credential.clone();
        Arc::new(move || WebullProtocol::new(credential.clone(), ws_url.clone()))
    };
    WsSession::new(
        SessionCore::new(Venue::Webull, bus),
        factory,
        Arc::new(WebullOpenInterest { credential, api: config.endpoints.webull_api.clone() }),
        reqwest::Client::new(),
        WsSettings::from_config(config),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn setup() -> (WebullProtocol, SessionCore) {
        (
            WebullProtocol::new(Credential::new("tok"), "ws://127.0.0.1:1".into()),
            SessionCore::new(Venue::Webull, Arc::new(EventBus::new())),
        )
    }

    #[test]
    fn test_auth_round() {
        let (mut p, core) = setup();
        let open = p.on_open();
        assert_eq!(open.outbound, vec![r#"{"type":"auth","token":"tok"}"#.to_string()]);
        let step = p.on_text(r#"{"type":"auth","status":"ok"}"#, &core).unwrap();
        assert_eq!(step.signal, Some(Signal::Ready));
        let err = p.on_text(r#"{"type":"auth","status":"denied","message":"expired"}"#, &core).unwrap_err();
        assert!(matches!(err, FeedError::Auth(_)));
    }

    #[test]
    fn test_subscribe_sends_whole_set_and_unsubscribe_rebuilds() {
        let (mut p, core) = setup();
        let all = SubscriptionSet::new(&["SPY", "QQQ"], &["SPY240119C00500000"]);
        let added = SubscriptionSet::new(&["QQQ"], &[] as &[&str]);
        let frames = p.subscribe_frames(&added, &all, &core);
        let v: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(v["type"], "subscribe");
        assert_eq!(v["symbols"].as_array().unwrap().len(), 3);
        assert_eq!(v["channels"], serde_json::json!(["quote", "trade"]));
        assert!(matches!(p.unsubscribe_plan(&added, &all, &core), UnsubscribePlan::Rebuild));
    }

    #[test]
    fn test_option_trade_uses_cached_quote() {
        let (mut p, core) = setup();
        let step = p
            .on_text(r#"{"type":"trade","symbol":"SPY240119C00500000","price":"10.0","size":3,"timestamp":5}"#, &core)
            .unwrap();
        assert_eq!(
            step.updates,
            vec![MarketUpdate::OptionTimesale {
                symbol: "SPY240119C00500000".into(),
                price: 10.0,
                size: 3,
                bid: None,
                ask: None,
                ts: 5,
            }]
        );
    }

    #[test]
    fn test_ticker_quote_and_errors() {
        let (mut p, core) = setup();
        let step = p
            .on_text(r#"{"type":"quote","symbol":"spy","bid":570.1,"bid_size":1,"ask":570.2,"ask_size":2}"#, &core)
            .unwrap();
        assert!(matches!(&step.updates[0], MarketUpdate::TickerQuote { symbol, .. } if symbol == "SPY"));
        assert!(p.on_text(r#"{"type":"error","message":"bad"}"#, &core).is_err());
        assert!(p.on_text(r#"{"type":"heartbeat"}"#, &core).unwrap().updates.is_empty());
    }
}
