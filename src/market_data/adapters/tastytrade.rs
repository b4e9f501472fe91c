//! Tastytrade market data over DXLink.
//!
//! The handshake is a chain of request/response rounds on channel 0 (setup and
//! authorization) followed by opening a FEED channel. Data arrives in COMPACT
//! format: positional arrays whose layout is given by the server's
//! `FEED_CONFIG.eventFields`, so decoding is driven by a schema table rather
//! than fixed offsets.

use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::tastytrade_types::{
    MarketDataResponse, QuoteTokenResponse, GREEKS_FIELDS, OPTION_EVENTS, QUOTE_FIELDS, SUMMARY_FIELDS,
    TICKER_EVENTS, TIME_AND_SALE_FIELDS, TRADE_FIELDS,
};
use super::ws::{ProtocolFactory, Signal, Step, UnsubscribePlan, WireProtocol, WsSession, WsSettings};
use super::{bearer, check_status, Credential, MarketUpdate, OpenInterestSource, Routed, SessionCore, SubscriptionSet, Venue};
use crate::config::FeedConfig;
use crate::error::{FeedError, FeedResult};
use crate::market_data::cache::{OptionStats, QuoteFields};
use crate::market_data::events::EventBus;
use crate::market_data::normaliser::{epoch_ms, field_str, num, qty};
use crate::market_data::symbols::{normalize_option, PaddedOccCodec, SymbolCodec};
use crate::market_data::types::now_ms;

const FEED_CHANNEL: u64 = 1;
const KEEPALIVE_TIMEOUT_SECS: u64 = 60;
const SNAPSHOT_BATCH: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Setup,
    Authorizing,
    ChannelRequested,
    FeedSetup,
    Streaming,
}

pub struct TastytradeProtocol {
    credential: Credential,
    api: String,
    token: Option<String>,
    phase: Phase,
    authorized: bool,
    schema: AHashMap<String, Vec<String>>,
}

impl TastytradeProtocol {
    pub fn new(credential: Credential, api: String) -> Self {
        Self {
            credential,
            api,
            token: None,
            phase: Phase::Setup,
            authorized: false,
            schema: requested_fields()
                .into_iter()
                .map(|(event, fields)| (event.to_string(), fields.iter().map(|f| f.to_string()).collect()))
                .collect(),
        }
    }

    fn on_auth_state(&mut self, state: Option<&str>) -> FeedResult<Step> {
        match state {
            Some("AUTHORIZED") => {
                self.authorized = true;
                self.phase = Phase::ChannelRequested;
                Ok(Step::send(vec![channel_request()]))
            }
            Some("UNAUTHORIZED") if self.authorized => {
                self.authorized = false;
                Ok(Step::signal(Signal::Invalidated("dxlink authorization revoked".into())))
            }
            // Expected once right after SETUP; a second one means the token was refused
            Some("UNAUTHORIZED") if self.phase == Phase::Authorizing => {
                Err(FeedError::Auth("dxlink rejected the quote token".into()))
            }
            Some("UNAUTHORIZED") => {
                let token = self
                    .token
                    .as_deref()
                    .ok_or_else(|| FeedError::Auth("no quote token".into()))?;
                self.phase = Phase::Authorizing;
                Ok(Step::send(vec![json!({"type": "AUTH", "channel": 0, "token": token}).to_string()]))
            }
            other => Err(FeedError::Protocol(format!("unknown dxlink auth state {:?}", other))),
        }
    }

    fn on_feed_config(&mut self, v: &Value) -> Step {
        if let Some(fields) = v.get("eventFields").and_then(Value::as_object) {
            for (event, list) in fields {
                let names: Vec<String> = list
                    .as_array()
                    .map(|a| a.iter().filter_map(|f| f.as_str().map(str::to_string)).collect())
                    .unwrap_or_default();
                if !names.is_empty() {
                    self.schema.insert(event.clone(), names);
                }
            }
        }
        if self.phase == Phase::Streaming {
            return Step::none();
        }
        self.phase = Phase::Streaming;
        Step::signal(Signal::Ready)
    }

    fn decode_feed(&self, v: &Value, core: &SessionCore) -> FeedResult<Vec<MarketUpdate>> {
        let data = v
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| FeedError::Protocol("FEED_DATA without data".into()))?;
        let mut out = Vec::new();
        // [type, [values...], type, [values...], ...]
        for pair in data.chunks(2) {
            let (Some(event), Some(values)) = (pair[0].as_str(), pair.get(1).and_then(Value::as_array)) else {
                return Err(FeedError::Protocol("malformed compact FEED_DATA".into()));
            };
            let fields = self
                .schema
                .get(event)
                .ok_or_else(|| FeedError::Protocol(format!("no schema for {}", event)))?;
            if fields.is_empty() || values.len() % fields.len() != 0 {
                return Err(FeedError::Protocol(format!(
                    "{} payload of {} values does not fit {} fields",
                    event,
                    values.len(),
                    fields.len()
                )));
            }
            for values in values.chunks(fields.len()) {
                let record = Record { fields, values };
                if let Some(update) = record.to_update(event, core) {
                    out.push(update);
                }
            }
        }
        Ok(out)
    }

    fn subscription_frames(op: &str, set: &SubscriptionSet, core: &SessionCore) -> Vec<String> {
        let mut entries = Vec::new();
        for ticker in &set.tickers {
            entries.extend(TICKER_EVENTS.iter().map(|ty| json!({"type": ty, "symbol": ticker})));
        }
        for native in set.options.iter().filter_map(|o| core.option_native(o)) {
            entries.extend(OPTION_EVENTS.iter().map(|ty| json!({"type": ty, "symbol": native})));
        }
        if entries.is_empty() {
            return Vec::new();
        }
        let mut frame = json!({"type": "FEED_SUBSCRIPTION", "channel": FEED_CHANNEL});
        frame[op] = Value::Array(entries);
        vec![frame.to_string()]
    }
}

fn requested_fields() -> [(&'static str, &'static [&'static str]); 5] {
    [
        ("Quote", QUOTE_FIELDS),
        ("Trade", TRADE_FIELDS),
        ("TimeAndSale", TIME_AND_SALE_FIELDS),
        ("Summary", SUMMARY_FIELDS),
        ("Greeks", GREEKS_FIELDS),
    ]
}

fn channel_request() -> String {
    json!({
        "type": "CHANNEL_REQUEST",
        "channel": FEED_CHANNEL,
        "service": "FEED",
        "parameters": {"contract": "AUTO"},
    })
    .to_string()
}

fn feed_setup() -> String {
    let fields: serde_json::Map<String, Value> = requested_fields()
        .into_iter()
        .map(|(event, list)| (event.to_string(), json!(list)))
        .collect();
    json!({
        "type": "FEED_SETUP",
        "channel": FEED_CHANNEL,
        "acceptAggregationPeriod": 0.1,
        "acceptDataFormat": "COMPACT",
        "acceptEventFields": fields,
    })
    .to_string()
}

/// One positional record viewed through its schema.
struct Record<'a> {
    fields: &'a [String],
    values: &'a [Value],
}

impl Record<'_> {
    fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().position(|f| f == name).and_then(|i| self.values.get(i))
    }

    fn num(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(num)
    }

    fn qty(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(qty)
    }

    fn to_update(&self, event: &str, core: &SessionCore) -> Option<MarketUpdate> {
        let symbol = self.get("eventSymbol").and_then(Value::as_str)?;
        let ts = self.get("time").and_then(epoch_ms).filter(|t| *t > 0).unwrap_or_else(now_ms);
        let update = match (event, core.route(symbol)) {
            ("Quote", routed) => {
                let quote = QuoteFields {
                    bid: self.num("bidPrice"),
                    bid_size: self.qty("bidSize"),
                    ask: self.num("askPrice"),
                    ask_size: self.qty("askSize"),
                };
                if quote.is_empty() {
                    return None;
                }
                match routed {
                    Routed::Ticker(symbol) => MarketUpdate::TickerQuote { symbol, quote, ts },
                    Routed::Option(symbol) => MarketUpdate::OptionQuote { symbol, quote, ts },
                }
            }
            ("Trade", Routed::Ticker(symbol)) => MarketUpdate::TickerTrade {
                symbol,
                price: self.num("price")?,
                size: self.qty("size").unwrap_or(0),
                day_volume: self.qty("dayVolume"),
                ts,
            },
            ("Trade", Routed::Option(symbol)) => MarketUpdate::OptionTrade {
                symbol,
                price: self.num("price")?,
                size: self.qty("size").unwrap_or(0),
                day_volume: self.qty("dayVolume"),
                ts,
            },
            ("TimeAndSale", Routed::Option(symbol)) => MarketUpdate::OptionTimesale {
                symbol,
                price: self.num("price")?,
                size: self.qty("size").unwrap_or(0),
                bid: self.num("bidPrice"),
                ask: self.num("askPrice"),
                ts,
            },
            ("Summary", Routed::Option(symbol)) => MarketUpdate::OptionStats {
                symbol,
                stats: OptionStats { open_interest: Some(self.qty("openInterest")?), ..Default::default() },
                ts,
            },
            ("Greeks", Routed::Option(symbol)) => MarketUpdate::OptionStats {
                symbol,
                stats: OptionStats { implied_volatility: Some(self.num("volatility")?), ..Default::default() },
                ts,
            },
            _ => return None,
        };
        Some(update)
    }
}

fn channel_of(v: &Value) -> Option<u64> {
    v.get("channel").and_then(Value::as_u64)
}

#[async_trait]
impl WireProtocol for TastytradeProtocol {
    async fn authenticate(&mut self, http: &reqwest::Client) -> FeedResult<String> {
        let res = http
            .get(format!("{}/api-quote-tokens", self.api))
            .header(AUTHORIZATION, bearer(&self.credential))
            .send()
            .await?;
        let body: QuoteTokenResponse = check_status(res).await?.json().await?;
        self.token = Some(body.data.token);
        Ok(body.data.dxlink_url)
    }

    fn on_open(&mut self) -> Step {
        self.phase = Phase::Setup;
        self.authorized = false;
        Step::send(vec![json!({
            "type": "SETUP",
            "channel": 0,
            "version": concat!("0.1-optfeed-rs/", env!("CARGO_PKG_VERSION")),
            "keepaliveTimeout": KEEPALIVE_TIMEOUT_SECS,
            "acceptKeepaliveTimeout": KEEPALIVE_TIMEOUT_SECS,
        })
        .to_string()])
    }

    fn on_text(&mut self, text: &str, core: &SessionCore) -> FeedResult<Step> {
        let v: Value = serde_json::from_str(text)?;
        let kind = field_str(&v, "type").ok_or_else(|| FeedError::Protocol("dxlink frame without type".into()))?;
        match kind {
            "SETUP" | "KEEPALIVE" => Ok(Step::none()),
            "AUTH_STATE" => self.on_auth_state(field_str(&v, "state")),
            "CHANNEL_OPENED" if channel_of(&v) == Some(FEED_CHANNEL) => {
                self.phase = Phase::FeedSetup;
                Ok(Step::send(vec![feed_setup()]))
            }
            "CHANNEL_CLOSED" if channel_of(&v) == Some(FEED_CHANNEL) => {
                warn!("dxlink feed channel closed; requesting a new one");
                self.phase = Phase::ChannelRequested;
                Ok(Step::send(vec![channel_request()]))
            }
            "FEED_CONFIG" => Ok(self.on_feed_config(&v)),
            "FEED_DATA" => Ok(Step::updates(self.decode_feed(&v, core)?)),
            "ERROR" => Err(FeedError::Protocol(format!(
                "dxlink {}: {}",
                field_str(&v, "error").unwrap_or("ERROR"),
                field_str(&v, "message").unwrap_or("")
            ))),
            other => {
                debug!(kind = other, "unhandled dxlink message");
                Ok(Step::none())
            }
        }
    }

    fn subscribe_frames(&mut self, added: &SubscriptionSet, _all: &SubscriptionSet, core: &SessionCore) -> Vec<String> {
        Self::subscription_frames("add", added, core)
    }

    fn unsubscribe_plan(&mut self, removed: &SubscriptionSet, _remaining: &SubscriptionSet, core: &SessionCore) -> UnsubscribePlan {
        UnsubscribePlan::Frames(Self::subscription_frames("remove", removed, core))
    }

    fn keepalive(&mut self) -> Option<String> {
        Some(json!({"type": "KEEPALIVE", "channel": 0}).to_string())
    }
}

pub struct TastytradeOpenInterest {
    credential: Credential,
    api: String,
}

#[async_trait]
impl OpenInterestSource for TastytradeOpenInterest {
    async fn fetch(&self, http: &reqwest::Client, options: &[String]) -> FeedResult<Vec<(String, u64)>> {
        let mut out = Vec::with_capacity(options.len());
        for batch in options.chunks(SNAPSHOT_BATCH) {
            // this endpoint wants padded OCC, not streamer symbols
            let query: Vec<(&str, String)> = batch
                .iter()
                .filter_map(|o| PaddedOccCodec.canonical_to_native(o).ok())
                .map(|native| ("equity-option", native))
                .collect();
            let res = http
                .get(format!("{}/market-data/by-type", self.api))
                .query(&query)
                .header(AUTHORIZATION, bearer(&self.credential))
                .send()
                .await?;
            let body: MarketDataResponse = check_status(res).await?.json().await?;
            for item in body.data.items {
                if let (Some(oi), Ok(symbol)) = (qty(&item.open_interest), normalize_option(&item.symbol)) {
                    out.push((symbol, oi));
                }
            }
        }
        info!(requested = options.len(), received = out.len(), "tastytrade open interest snapshot");
        Ok(out)
    }
}

pub fn session(credential: Credential, config: &FeedConfig, bus: Arc<EventBus>) -> WsSession<TastytradeProtocol> {
    let api = config.endpoints.tastytrade_api.clone();
    let factory: ProtocolFactory<TastytradeProtocol> = {
        let (credential, api) = (credential.clone(), api.clone());
        Arc::new(move || TastytradeProtocol::new(credential.clone(), api.clone()))
    };
    WsSession::new(
        SessionCore::new(Venue::Tastytrade, bus),
        factory,
        Arc::new(TastytradeOpenInterest { credential, api }),
        reqwest::Client::new(),
        WsSettings::from_config(config),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (TastytradeProtocol, SessionCore) {
        let mut p = TastytradeProtocol::new(Credential::new("t"), "http://api".into());
        p.token = Some("quote-token".into());
        (p, SessionCore::new(Venue::Tastytrade, Arc::new(EventBus::new())))
    }

    fn sent_type(step: &Step) -> String {
        let v: Value = serde_json::from_str(&step.outbound[0]).unwrap();
        v["type"].as_str().unwrap().to_string()
    }

    /// Walk the handshake up to the point where the feed is ready.
    fn handshake(p: &mut TastytradeProtocol, core: &SessionCore) {
        let open = p.on_open();
        assert_eq!(sent_type(&open), "SETUP");
        assert!(p.on_text(r#"{"type":"SETUP","channel":0,"version":"1.0"}"#, core).unwrap().outbound.is_empty());
        let step = p.on_text(r#"{"type":"AUTH_STATE","channel":0,"state":"UNAUTHORIZED"}"#, core).unwrap();
        assert_eq!(sent_type(&step), "AUTH");
        assert!(step.outbound[0].contains("quote-token"));
        let step = p.on_text(r#"{"type":"AUTH_STATE","channel":0,"state":"AUTHORIZED","userId":"u"}"#, core).unwrap();
        assert_eq!(sent_type(&step), "CHANNEL_REQUEST");
        let step = p.on_text(r#"{"type":"CHANNEL_OPENED","channel":1,"service":"FEED"}"#, core).unwrap();
        assert_eq!(sent_type(&step), "FEED_SETUP");
        assert!(step.outbound[0].contains("COMPACT"));
    }

    #[test]
    fn test_handshake_ends_ready_on_feed_config() {
        let (mut p, core) = setup();
        handshake(&mut p, &core);
        let step = p
            .on_text(r#"{"type":"FEED_CONFIG","channel":1,"dataFormat":"COMPACT","eventFields":{"Quote":["eventType","eventSymbol","bidPrice","askPrice","bidSize","askSize"]}}"#, &core)
            .unwrap();
        assert_eq!(step.signal, Some(Signal::Ready));
        // a later FEED_CONFIG only refreshes the schema
        let step = p.on_text(r#"{"type":"FEED_CONFIG","channel":1,"eventFields":{}}"#, &core).unwrap();
        assert_eq!(step.signal, None);
    }

    #[test]
    fn test_second_unauthorized_during_handshake_is_auth_error() {
        let (mut p, core) = setup();
        p.on_open();
        p.on_text(r#"{"type":"AUTH_STATE","channel":0,"state":"UNAUTHORIZED"}"#, &core).unwrap();
        let err = p.on_text(r#"{"type":"AUTH_STATE","channel":0,"state":"UNAUTHORIZED"}"#, &core).unwrap_err();
        assert!(matches!(err, FeedError::Auth(_)));
    }

    #[test]
    fn test_unauthorized_after_authorized_invalidates() {
        let (mut p, core) = setup();
        handshake(&mut p, &core);
        let step = p.on_text(r#"{"type":"AUTH_STATE","channel":0,"state":"UNAUTHORIZED"}"#, &core).unwrap();
        assert!(matches!(step.signal, Some(Signal::Invalidated(_))));
    }

    #[test]
    fn test_channel_closed_renegotiates_channel() {
        let (mut p, core) = setup();
        handshake(&mut p, &core);
        p.on_text(r#"{"type":"FEED_CONFIG","channel":1,"eventFields":{}}"#, &core).unwrap();
        let step = p.on_text(r#"{"type":"CHANNEL_CLOSED","channel":1}"#, &core).unwrap();
        assert_eq!(sent_type(&step), "CHANNEL_REQUEST");
        p.on_text(r#"{"type":"CHANNEL_OPENED","channel":1}"#, &core).unwrap();
        let step = p.on_text(r#"{"type":"FEED_CONFIG","channel":1,"eventFields":{}}"#, &core).unwrap();
        assert_eq!(step.signal, Some(Signal::Ready));
    }

    #[test]
    fn test_compact_decode_follows_server_schema() {
        let (mut p, core) = setup();
        handshake(&mut p, &core);
        // server reorders Quote fields
        p.on_text(
            r#"{"type":"FEED_CONFIG","channel":1,"eventFields":{"Quote":["eventType","eventSymbol","askPrice","bidPrice","askSize","bidSize"]}}"#,
            &core,
        )
        .unwrap();
        let step = p
            .on_text(
                r#"{"type":"FEED_DATA","channel":1,"data":["Quote",["Quote","SPY",570.2,570.1,200,100,"Quote",".SPY240119C500",10.2,10.0,3,5]]}"#,
                &core,
            )
            .unwrap();
        assert_eq!(step.updates.len(), 2);
        match &step.updates[0] {
            MarketUpdate::TickerQuote { symbol, quote, .. } => {
                assert_eq!(symbol, "SPY");
                assert_eq!(*quote, QuoteFields::full(570.1, 100, 570.2, 200));
            }
            other => panic!("unexpected {:?}", other),
        }
        match &step.updates[1] {
            MarketUpdate::OptionQuote { symbol, quote, .. } => {
                assert_eq!(symbol, "SPY240119C00500000");
                assert_eq!(*quote, QuoteFields::full(10.0, 5, 10.2, 3));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_summary_greeks_and_time_and_sale() {
        let (mut p, core) = setup();
        let step = p
            .on_text(
                r#"{"type":"FEED_DATA","channel":1,"data":["Summary",["Summary",".SPY240119P400",1500,"NaN"],"Greeks",["Greeks",".SPY240119P400",0.21],"TimeAndSale",["TimeAndSale",".SPY240119P400",2.0,4,2.0,2.1,1700000000000]]}"#,
                &core,
            )
            .unwrap();
        assert_eq!(step.updates.len(), 3);
        assert!(matches!(
            &step.updates[0],
            MarketUpdate::OptionStats { stats: OptionStats { open_interest: Some(1500), .. }, .. }
        ));
        assert!(matches!(
            &step.updates[1],
            MarketUpdate::OptionStats { stats: OptionStats { implied_volatility: Some(iv), .. }, .. } if (*iv - 0.21).abs() < 1e-12
        ));
        assert!(matches!(
            &step.updates[2],
            MarketUpdate::OptionTimesale { size: 4, bid: Some(_), ask: Some(_), ts: 1700000000000, .. }
        ));
    }

    #[test]
    fn test_bad_compact_length_is_protocol_error() {
        let (mut p, core) = setup();
        let err = p
            .on_text(r#"{"type":"FEED_DATA","channel":1,"data":["Quote",["Quote","SPY",1.0]]}"#, &core)
            .unwrap_err();
        assert!(matches!(err, FeedError::Protocol(_)));
    }

    #[test]
    fn test_subscription_frames_use_streamer_symbols() {
        let (mut p, core) = setup();
        let set = SubscriptionSet::new(&["SPY"], &["SPY240119C00502500"]);
        let frames = p.subscribe_frames(&set, &set, &core);
        let v: Value = serde_json::from_str(&frames[0]).unwrap();
        let add = v["add"].as_array().unwrap();
        assert_eq!(add.len(), TICKER_EVENTS.len() + OPTION_EVENTS.len());
        assert!(add.iter().any(|e| e["symbol"] == ".SPY240119C502.5" && e["type"] == "TimeAndSale"));
        match p.unsubscribe_plan(&set, &SubscriptionSet::default(), &core) {
            UnsubscribePlan::Frames(f) => assert!(f[0].contains("\"remove\"")),
            UnsubscribePlan::Rebuild => panic!("dxlink removes in place"),
        }
    }
}
