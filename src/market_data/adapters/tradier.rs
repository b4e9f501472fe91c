// Tradier market WebSocket: REST session id, then a single additive payload
// carrying every symbol. The server may expire the session at any time.

use std::sync::Arc;

use async_trait::async_trait;
use itertools::Itertools;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::tradier_types::{OneOrMany, QuotesResponse, StreamSessionResponse};
use super::ws::{ProtocolFactory, Signal, Step, UnsubscribePlan, WireProtocol, WsSession, WsSettings};
use super::{bearer, check_status, Credential, MarketUpdate, OpenInterestSource, Routed, SessionCore, SubscriptionSet, Venue};
use crate::config::FeedConfig;
use crate::error::{FeedError, FeedResult};
use crate::market_data::cache::QuoteFields;
use crate::market_data::events::EventBus;
use crate::market_data::normaliser::{epoch_ms, field_num, field_qty, field_str};
use crate::market_data::symbols::normalize_option;
use crate::market_data::types::now_ms;

// summary frames carry only open/high/low/prevClose, none of which is cached
const FILTER: [&str; 3] = ["quote", "trade", "timesale"];
const QUOTE_BATCH: usize = 100;

pub struct TradierProtocol {
    credential: Credential,
    api: String,
    ws_url: String,
    session_id: Option<String>,
}

impl TradierProtocol {
    pub fn new(credential: Credential, api: String, ws_url: String) -> Self {
        Self { credential, api, ws_url, session_id: None }
    }

    async fn create_session(&self, http: &reqwest::Client) -> FeedResult<String> {
        let res = http
            .post(format!("{}/v1/markets/events/session", self.api))
            .header(AUTHORIZATION, bearer(&self.credential))
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        let body: StreamSessionResponse = check_status(res).await?.json().await?;
        debug!(stream_url = %body.stream.url, "tradier stream session created");
        Ok(body.stream.sessionid)
    }

    /// The one payload Tradier understands: the complete symbol list.
    fn payload(&self, all: &SubscriptionSet, core: &SessionCore) -> Vec<String> {
        let Some(session_id) = &self.session_id else {
            return Vec::new();
        };
        let symbols: Vec<String> = all
            .tickers
            .iter()
            .cloned()
            .chain(all.options.iter().filter_map(|o| core.option_native(o)))
            .collect();
        if symbols.is_empty() {
            return Vec::new();
        }
        let frame = json!({
            "symbols": symbols,
            "sessionid": session_id,
            "filter": FILTER,
            "linebreak": true,
            "validOnly": true,
        });
        vec![frame.to_string()]
    }
}

fn frame_ts(v: &Value, keys: &[&str]) -> i64 {
    keys.iter()
        .filter_map(|k| v.get(*k).and_then(epoch_ms))
        .max()
        .unwrap_or_else(now_ms)
}

fn decode(v: &Value, core: &SessionCore) -> FeedResult<Option<MarketUpdate>> {
    let kind = field_str(v, "type").ok_or_else(|| FeedError::Protocol("frame without type".into()))?;
    let symbol = field_str(v, "symbol").ok_or_else(|| FeedError::Protocol(format!("{} frame without symbol", kind)))?;

    let update = match (kind, core.route(symbol)) {
        ("quote", routed) => {
            let quote = QuoteFields {
                bid: field_num(v, "bid"),
                bid_size: field_qty(v, "bidsz"),
                ask: field_num(v, "ask"),
                ask_size: field_qty(v, "asksz"),
            };
            let ts = frame_ts(v, &["biddate", "askdate"]);
            match routed {
                Routed::Ticker(symbol) => MarketUpdate::TickerQuote { symbol, quote, ts },
                Routed::Option(symbol) => MarketUpdate::OptionQuote { symbol, quote, ts },
            }
        }
        ("trade", Routed::Ticker(symbol)) => MarketUpdate::TickerTrade {
            symbol,
            price: field_num(v, "price")
                .or_else(|| field_num(v, "last"))
                .ok_or_else(|| FeedError::Protocol("trade without price".into()))?,
            size: field_qty(v, "size").unwrap_or(0),
            day_volume: field_qty(v, "cvol"),
            ts: frame_ts(v, &["date"]),
        },
        // Option prints are taken from the timesale frame, which carries the NBBO
        ("trade", Routed::Option(_)) => return Ok(None),
        ("timesale", Routed::Option(symbol)) => {
            if v.get("cancel").and_then(Value::as_bool).unwrap_or(false) {
                return Ok(None);
            }
            MarketUpdate::OptionTimesale {
                symbol,
                price: field_num(v, "last")
                    .or_else(|| field_num(v, "price"))
                    .ok_or_else(|| FeedError::Protocol("timesale without price".into()))?,
                size: field_qty(v, "size").unwrap_or(0),
                bid: field_num(v, "bid"),
                ask: field_num(v, "ask"),
                ts: frame_ts(v, &["date"]),
            }
        }
        ("timesale", Routed::Ticker(_)) => return Ok(None),
        (other, _) => {
            debug!(kind = other, "unhandled tradier frame");
            return Ok(None);
        }
    };
    Ok(Some(update))
}

#[async_trait]
impl WireProtocol for TradierProtocol {
    async fn authenticate(&mut self, http: &reqwest::Client) -> FeedResult<String> {
        self.session_id = Some(self.create_session(http).await?);
        Ok(self.ws_url.clone())
    }

    fn on_open(&mut self) -> Step {
        Step::signal(Signal::Ready)
    }

    fn on_text(&mut self, text: &str, core: &SessionCore) -> FeedResult<Step> {
        let v: Value = serde_json::from_str(text)?;
        if let Some(err) = v.get("error") {
            let msg = err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string());
            if msg.to_ascii_lowercase().contains("session") {
                return Ok(Step::signal(Signal::Renegotiate));
            }
            return Err(FeedError::Protocol(format!("tradier: {}", msg)));
        }
        Ok(Step::updates(decode(&v, core)?.into_iter().collect()))
    }

    fn subscribe_frames(&mut self, _added: &SubscriptionSet, all: &SubscriptionSet, core: &SessionCore) -> Vec<String> {
        self.payload(all, core)
    }

    fn unsubscribe_plan(&mut self, _removed: &SubscriptionSet, remaining: &SubscriptionSet, core: &SessionCore) -> UnsubscribePlan {
        // An empty symbol list is rejected, so reopen with nothing on the wire
        if remaining.is_empty() {
            return UnsubscribePlan::Rebuild;
        }
        UnsubscribePlan::Frames(self.payload(remaining, core))
    }

    async fn renegotiate(&mut self, http: &reqwest::Client, all: &SubscriptionSet, core: &SessionCore) -> FeedResult<Vec<String>> {
        self.session_id = Some(self.create_session(http).await?);
        info!(symbols = all.len(), "tradier session renewed");
        Ok(self.payload(all, core))
    }
}

pub struct TradierOpenInterest {
    credential: Credential,
    api: String,
}

#[async_trait]
impl OpenInterestSource for TradierOpenInterest {
    async fn fetch(&self, http: &reqwest::Client, options: &[String]) -> FeedResult<Vec<(String, u64)>> {
        let mut out = Vec::with_capacity(options.len());
        for batch in options.chunks(QUOTE_BATCH) {
            let res = http
                .get(format!("{}/v1/markets/quotes", self.api))
                .query(&[("symbols", batch.iter().join(",")), ("greeks", "false".to_string())])
                .header(AUTHORIZATION, bearer(&self.credential))
                .header(ACCEPT, "application/json")
                .send()
                .await?;
            let body: QuotesResponse = check_status(res).await?.json().await?;
            let quotes = body.quotes.and_then(|q| q.quote).map(OneOrMany::into_vec).unwrap_or_default();
            for q in quotes {
                if let (Some(oi), Ok(symbol)) = (q.open_interest, normalize_option(&q.symbol)) {
                    out.push((symbol, oi));
                }
            }
        }
        Ok(out)
    }
}

pub fn session(credential: Credential, config: &FeedConfig, bus: Arc<EventBus>) -> WsSession<TradierProtocol> {
    let api = config.endpoints.tradier_api.clone();
    let ws_url = config.endpoints.tradier_ws.clone();
    let factory: ProtocolFactory<TradierProtocol> = {
        let (credential, api) = (credential.clone(), api.clone());
        Arc::new(move || TradierProtocol::new(credential.clone(), api.clone(), ws_url.clone()))
    };
    WsSession::new(
        SessionCore::new(Venue::Tradier, bus),
        factory,
        Arc::new(TradierOpenInterest { credential, api }),
        reqwest::Client::new(),
        WsSettings::from_config(config),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (TradierProtocol, SessionCore) {
        let mut p = TradierProtocol::new(Credential::new("t"), "http://api".into(), "ws://ws".into());
        p.session_id = Some("S1".into());
        (p, SessionCore::new(Venue::Tradier, Arc::new(EventBus::new())))
    }

    #[test]
    fn test_payload_carries_full_set() {
        let (mut p, core) = setup();
        let all = SubscriptionSet::new(&["SPY"], &["SPY240119C00500000"]);
        let added = SubscriptionSet::new(&[] as &[&str], &["SPY240119C00500000"]);
        let frames = p.subscribe_frames(&added, &all, &core);
        assert_eq!(frames.len(), 1);
        let v: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(v["sessionid"], "S1");
        assert_eq!(v["symbols"], json!(["SPY", "SPY240119C00500000"]));
        assert_eq!(v["validOnly"], true);
        assert_eq!(v["filter"], json!(["quote", "trade", "timesale"]));
    }

    #[test]
    fn test_unsubscribe_to_nothing_rebuilds() {
        let (mut p, core) = setup();
        let removed = SubscriptionSet::new(&["SPY"], &[] as &[&str]);
        assert!(matches!(p.unsubscribe_plan(&removed, &SubscriptionSet::default(), &core), UnsubscribePlan::Rebuild));
        let remaining = SubscriptionSet::new(&["QQQ"], &[] as &[&str]);
        match p.unsubscribe_plan(&removed, &remaining, &core) {
            UnsubscribePlan::Frames(f) => assert!(f[0].contains("QQQ") && !f[0].contains("SPY")),
            UnsubscribePlan::Rebuild => panic!("expected frames"),
        }
    }

    #[test]
    fn test_decode_string_encoded_frames() {
        let (mut p, core) = setup();
        let step = p
            .on_text(r#"{"type":"quote","symbol":"SPY","bid":"281.84","bidsz":"60","ask":281.85,"asksz":6,"biddate":"1557757189000","askdate":"1557757190000"}"#, &core)
            .unwrap();
        match &step.updates[0] {
            MarketUpdate::TickerQuote { symbol, quote, ts } => {
                assert_eq!(symbol, "SPY");
                assert_eq!(*quote, QuoteFields::full(281.84, 60, 281.85, 6));
                assert_eq!(*ts, 1557757190000);
            }
            other => panic!("unexpected {:?}", other),
        }

        let step = p
            .on_text(r#"{"type":"trade","symbol":"SPY","price":"281.85","size":"100","cvol":"30638464","date":"1557757190000"}"#, &core)
            .unwrap();
        assert!(matches!(
            &step.updates[0],
            MarketUpdate::TickerTrade { size: 100, day_volume: Some(30638464), .. }
        ));
    }

    #[test]
    fn test_option_timesale_carries_nbbo() {
        let (mut p, core) = setup();
        let step = p
            .on_text(r#"{"type":"timesale","symbol":"SPY240119C00500000","bid":"10.0","ask":"10.2","last":"10.2","size":"2","date":"1","cancel":false}"#, &core)
            .unwrap();
        assert_eq!(
            step.updates,
            vec![MarketUpdate::OptionTimesale {
                symbol: "SPY240119C00500000".into(),
                price: 10.2,
                size: 2,
                bid: Some(10.0),
                ask: Some(10.2),
                ts: 1,
            }]
        );
        // the matching trade frame is not double counted
        let step = p.on_text(r#"{"type":"trade","symbol":"SPY240119C00500000","price":"10.2","size":"2"}"#, &core).unwrap();
        assert!(step.updates.is_empty());
    }

    #[test]
    fn test_session_error_requests_renegotiation() {
        let (mut p, core) = setup();
        let step = p.on_text(r#"{"error":"session not found"}"#, &core).unwrap();
        assert_eq!(step.signal, Some(Signal::Renegotiate));
        assert!(p.on_text(r#"{"error":"bad symbol"}"#, &core).is_err());
        assert!(p.on_text("not json", &core).is_err());
    }
}
