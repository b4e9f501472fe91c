// Schwab streamer: REST user preferences give the socket URL and client ids,
// then an ADMIN/LOGIN request. Data frames carry numeric field keys and only
// the fields that changed.

use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use itertools::Itertools;
use reqwest::header::AUTHORIZATION;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::schwab_types::{
    book, equity, option, QuotesResponse, StreamerInfo, UserPreference, BOOK_FIELDS, EQUITY_FIELDS, OPTION_FIELDS,
    SERVICE_BOOK, SERVICE_EQUITIES, SERVICE_OPTIONS,
};
use super::ws::{ProtocolFactory, Signal, Step, UnsubscribePlan, WireProtocol, WsSession, WsSettings};
use super::{bearer, check_status, Credential, MarketUpdate, OpenInterestSource, SessionCore, SubscriptionSet, Venue};
use crate::config::FeedConfig;
use crate::error::{FeedError, FeedResult};
use crate::market_data::cache::{OptionStats, QuoteFields};
use crate::market_data::events::EventBus;
use crate::market_data::external_book::{BookSide, ExternalBook};
use crate::market_data::normaliser::{epoch_ms, field_num, field_qty, field_str, num, qty, Normaliser};
use crate::market_data::symbols::{codec_for, normalize_option, normalize_ticker};
use crate::market_data::types::now_ms;

const LOGIN_OK: i64 = 0;
const LOGIN_DENIED: i64 = 3;
// Option prices are quoted to at most four decimals
const BOOK_PRICE_SCALE: i64 = 10_000;
const QUOTE_BATCH: usize = 100;

/// Depth for one option and the quote sides it currently supplies.
#[derive(Default)]
struct BookFeed {
    depth: ExternalBook,
    bid_from_book: bool,
    ask_from_book: bool,
}

pub struct SchwabProtocol {
    credential: Credential,
    api: String,
    streamer: Option<StreamerInfo>,
    request_id: u64,
    books: AHashMap<String, BookFeed>,
    /// last total volume seen per option; increases are decoded as trades
    volumes: AHashMap<String, u64>,
    normaliser: Normaliser,
}

impl SchwabProtocol {
    pub fn new(credential: Credential, api: String) -> Self {
        Self {
            credential,
            api,
            streamer: None,
            request_id: 0,
            books: AHashMap::new(),
            volumes: AHashMap::new(),
            normaliser: Normaliser::new(BOOK_PRICE_SCALE),
        }
    }

    fn request(&mut self, service: &str, command: &str, parameters: Value) -> Value {
        let id = self.request_id;
        self.request_id += 1;
        let (customer, correl) = self
            .streamer
            .as_ref()
            .map(|s| (s.schwab_client_customer_id.as_str(), s.schwab_client_correl_id.as_str()))
            .unwrap_or_default();
        json!({
            "service": service,
            "command": command,
            "requestid": id.to_string(),
            "SchwabClientCustomerId": customer,
            "SchwabClientCorrelId": correl,
            "parameters": parameters,
        })
    }

    fn frame(requests: Vec<Value>) -> Vec<String> {
        if requests.is_empty() {
            return Vec::new();
        }
        vec![json!({ "requests": requests }).to_string()]
    }

    fn subscription_requests(&mut self, command: &str, set: &SubscriptionSet, core: &SessionCore) -> Vec<Value> {
        let mut requests = Vec::new();
        if !set.tickers.is_empty() {
            let keys = set.tickers.iter().join(",");
            requests.push(self.request(SERVICE_EQUITIES, command, subscription_params(command, keys, EQUITY_FIELDS)));
        }
        let natives: Vec<String> = set.options.iter().filter_map(|o| core.option_native(o)).collect();
        if !natives.is_empty() {
            let keys = natives.iter().join(",");
            requests.push(self.request(SERVICE_OPTIONS, command, subscription_params(command, keys.clone(), OPTION_FIELDS)));
            requests.push(self.request(SERVICE_BOOK, command, subscription_params(command, keys, BOOK_FIELDS)));
        }
        requests
    }

    fn on_response(&self, response: &Value, step: &mut Step) -> FeedResult<()> {
        let service = field_str(response, "service").unwrap_or_default();
        let command = field_str(response, "command").unwrap_or_default();
        let content = response.get("content").unwrap_or(&Value::Null);
        let code = content.get("code").and_then(Value::as_i64).unwrap_or(LOGIN_OK);
        let msg = field_str(content, "msg").unwrap_or_default();

        match (service, command) {
            ("ADMIN", "LOGIN") if code == LOGIN_OK => {
                info!("schwab streamer login accepted");
                step.signal = Some(Signal::Ready);
                Ok(())
            }
            ("ADMIN", "LOGIN") if code == LOGIN_DENIED => Err(FeedError::Auth(format!("schwab login denied: {}", msg))),
            ("ADMIN", "LOGIN") => Err(FeedError::Auth(format!("schwab login failed (code {}): {}", code, msg))),
            _ if code != LOGIN_OK => {
                warn!(service, command, code, msg, "schwab request rejected");
                Ok(())
            }
            _ => {
                debug!(service, command, "schwab request acknowledged");
                Ok(())
            }
        }
    }

    fn on_data(&mut self, data: &Value, core: &SessionCore, out: &mut Vec<MarketUpdate>) {
        let service = field_str(data, "service").unwrap_or_default();
        let Some(content) = data.get("content").and_then(Value::as_array) else {
            return;
        };
        for item in content {
            let Some(key) = field_str(item, "key") else {
                continue;
            };
            match service {
                SERVICE_EQUITIES => decode_equity(item, normalize_ticker(key), out),
                SERVICE_OPTIONS => match core.resolve_option(key) {
                    Some(symbol) => self.decode_option(item, symbol, core, out),
                    None => warn!(key, "schwab option update for unknown symbol"),
                },
                SERVICE_BOOK => match core.resolve_option(key) {
                    Some(symbol) => self.decode_book(item, symbol, core, out),
                    None => warn!(key, "schwab book update for unknown symbol"),
                },
                other => debug!(service = other, "unhandled schwab service"),
            }
        }
    }

    fn decode_option(&mut self, item: &Value, symbol: String, core: &SessionCore, out: &mut Vec<MarketUpdate>) {
        let quote_ts = item.get(option::QUOTE_TIME).and_then(epoch_ms).unwrap_or_else(now_ms);
        let trade_ts = item.get(option::TRADE_TIME).and_then(epoch_ms).unwrap_or(quote_ts);

        let quote = QuoteFields {
            bid: field_num(item, option::BID),
            bid_size: field_qty(item, option::BID_SIZE),
            ask: field_num(item, option::ASK),
            ask_size: field_qty(item, option::ASK_SIZE),
        };
        // Level one takes a side back from the book once it quotes it
        if let Some(feed) = self.books.get_mut(&symbol) {
            feed.bid_from_book &= quote.bid.is_none();
            feed.ask_from_book &= quote.ask.is_none();
        }
        if !quote.is_empty() {
            out.push(MarketUpdate::OptionQuote { symbol: symbol.clone(), quote, ts: quote_ts });
        }

        let last = field_num(item, option::LAST);
        let mut stats = OptionStats {
            open_interest: field_qty(item, option::OPEN_INTEREST),
            implied_volatility: field_num(item, option::VOLATILITY),
            mark: field_num(item, option::MARK),
            ..Default::default()
        };

        let mut trade = None;
        if let Some(total) = field_qty(item, option::TOTAL_VOLUME) {
            match self.volumes.insert(symbol.clone(), total) {
                Some(prev) if total > prev => {
                    let cached_last = || core.cache().read().option(&symbol).map(|o| o.last);
                    match last.or_else(cached_last).filter(|p| *p > 0.0) {
                        Some(price) => {
                            trade = Some(MarketUpdate::OptionTimesale {
                                symbol: symbol.clone(),
                                price,
                                size: total - prev,
                                bid: None,
                                ask: None,
                                ts: trade_ts,
                            })
                        }
                        None => stats.volume = Some(total),
                    }
                }
                Some(_) => {}
                // First sighting seeds the day volume
                None => stats.volume = Some(total),
            }
        }
        if trade.is_none() {
            stats.last = last;
        }

        if stats != OptionStats::default() {
            out.push(MarketUpdate::OptionStats { symbol, stats, ts: quote_ts });
        }
        out.extend(trade);
    }

    fn decode_book(&mut self, item: &Value, symbol: String, core: &SessionCore, out: &mut Vec<MarketUpdate>) {
        let norm = &self.normaliser;
        let feed = self.books.entry(symbol.clone()).or_default();
        if let Some(levels) = item.get(book::BIDS).and_then(Value::as_array) {
            feed.depth.replace_side(BookSide::Bid, &book_levels(norm, levels));
        }
        if let Some(levels) = item.get(book::ASKS).and_then(Value::as_array) {
            feed.depth.replace_side(BookSide::Ask, &book_levels(norm, levels));
        }
        if feed.depth.is_empty() {
            return;
        }
        debug!(
            symbol = %symbol,
            bids = feed.depth.depth(BookSide::Bid),
            asks = feed.depth.depth(BookSide::Ask),
            "schwab book update"
        );

        // The book supplies sides level one has not quoted
        let (cached_bid, cached_ask) = core
            .cache()
            .read()
            .option(&symbol)
            .map(|o| (o.bid, o.ask))
            .unwrap_or((0.0, 0.0));
        feed.bid_from_book |= cached_bid == 0.0;
        feed.ask_from_book |= cached_ask == 0.0;
        let (best_bid, best_ask) = feed.depth.bbo();
        let mut quote = QuoteFields::default();
        if let Some((px, sz)) = best_bid.filter(|_| feed.bid_from_book) {
            quote.bid = Some(norm.ticks_to_f64(px));
            quote.bid_size = Some(sz);
        }
        if let Some((px, sz)) = best_ask.filter(|_| feed.ask_from_book) {
            quote.ask = Some(norm.ticks_to_f64(px));
            quote.ask_size = Some(sz);
        }
        if !quote.is_empty() {
            out.push(MarketUpdate::OptionQuote { symbol, quote, ts: now_ms() });
        }
    }
}

fn subscription_params(command: &str, keys: String, fields: &str) -> Value {
    if command == "UNSUBS" {
        json!({ "keys": keys })
    } else {
        json!({ "keys": keys, "fields": fields })
    }
}

fn decode_equity(item: &Value, symbol: String, out: &mut Vec<MarketUpdate>) {
    let quote = QuoteFields {
        bid: field_num(item, equity::BID),
        bid_size: field_qty(item, equity::BID_SIZE),
        ask: field_num(item, equity::ASK),
        ask_size: field_qty(item, equity::ASK_SIZE),
    };
    if !quote.is_empty() {
        let ts = item.get(equity::QUOTE_TIME).and_then(epoch_ms).unwrap_or_else(now_ms);
        out.push(MarketUpdate::TickerQuote { symbol: symbol.clone(), quote, ts });
    }
    if let Some(price) = field_num(item, equity::LAST) {
        out.push(MarketUpdate::TickerTrade {
            symbol,
            price,
            size: field_qty(item, equity::LAST_SIZE).unwrap_or(0),
            day_volume: field_qty(item, equity::TOTAL_VOLUME),
            ts: item.get(equity::TRADE_TIME).and_then(epoch_ms).unwrap_or_else(now_ms),
        });
    }
}

fn book_levels(norm: &Normaliser, levels: &[Value]) -> Vec<(i64, u64)> {
    levels
        .iter()
        .filter_map(|lvl| {
            let px = lvl.get(book::PRICE).and_then(num)?;
            let sz = lvl.get(book::SIZE).and_then(qty)?;
            Some((norm.f64_to_ticks(px), sz))
        })
        .collect()
}

#[async_trait]
impl WireProtocol for SchwabProtocol {
    async fn authenticate(&mut self, http: &reqwest::Client) -> FeedResult<String> {
        let res = http
            .get(format!("{}/trader/v1/userPreference", self.api))
            .header(AUTHORIZATION, bearer(&self.credential))
            .send()
            .await?;
        let prefs: UserPreference = check_status(res).await?.json().await?;
        let info = prefs
            .streamer_info
            .into_iter()
            .next()
            .ok_or_else(|| FeedError::Auth("no streamer info in user preferences".into()))?;
        let url = info.streamer_socket_url.clone();
        self.streamer = Some(info);
        Ok(url)
    }

    fn on_open(&mut self) -> Step {
        let (channel, function) = self
            .streamer
            .as_ref()
            .map(|s| (s.schwab_client_channel.clone(), s.schwab_client_function_id.clone()))
            .unwrap_or_default();
        let login = self.request(
            "ADMIN",
            "LOGIN",
            json!({
                "Authorization": self.credential.access_token,
                "SchwabClientChannel": channel,
                "SchwabClientFunctionId": function,
            }),
        );
        Step::send(Self::frame(vec![login]))
    }

    fn on_text(&mut self, text: &str, core: &SessionCore) -> FeedResult<Step> {
        let v: Value = serde_json::from_str(text)?;
        let mut step = Step::none();
        if let Some(responses) = v.get("response").and_then(Value::as_array) {
            for response in responses {
                self.on_response(response, &mut step)?;
            }
        }
        if let Some(data) = v.get("data").and_then(Value::as_array) {
            for d in data {
                self.on_data(d, core, &mut step.updates);
            }
        }
        // "notify" carries heartbeats only
        Ok(step)
    }

    fn subscribe_frames(&mut self, added: &SubscriptionSet, _all: &SubscriptionSet, core: &SessionCore) -> Vec<String> {
        let requests = self.subscription_requests("ADD", added, core);
        Self::frame(requests)
    }

    fn unsubscribe_plan(&mut self, removed: &SubscriptionSet, _remaining: &SubscriptionSet, core: &SessionCore) -> UnsubscribePlan {
        for option in &removed.options {
            self.books.remove(option);
            self.volumes.remove(option);
        }
        let requests = self.subscription_requests("UNSUBS", removed, core);
        UnsubscribePlan::Frames(Self::frame(requests))
    }

    fn close_frames(&mut self) -> Vec<String> {
        let logout = self.request("ADMIN", "LOGOUT", json!({}));
        Self::frame(vec![logout])
    }
}

pub struct SchwabOpenInterest {
    credential: Credential,
    api: String,
}

#[async_trait]
impl OpenInterestSource for SchwabOpenInterest {
    async fn fetch(&self, http: &reqwest::Client, options: &[String]) -> FeedResult<Vec<(String, u64)>> {
        let codec = codec_for(Venue::Schwab);
        let mut out = Vec::with_capacity(options.len());
        for batch in options.chunks(QUOTE_BATCH) {
            let symbols = batch.iter().filter_map(|o| codec.canonical_to_native(o).ok()).join(",");
            let res = http
                .get(format!("{}/marketdata/v1/quotes", self.api))
                .query(&[("symbols", symbols.as_str()), ("fields", "quote")])
                .header(AUTHORIZATION, bearer(&self.credential))
                .send()
                .await?;
            let body: QuotesResponse = check_status(res).await?.json().await?;
            for (native, entry) in body {
                if let (Some(oi), Ok(symbol)) = (field_qty(&entry.quote, "openInterest"), normalize_option(&native)) {
                    out.push((symbol, oi));
                }
            }
        }
        Ok(out)
    }
}

pub fn session(credential: Credential, config: &FeedConfig, bus: Arc<EventBus>) -> WsSession<SchwabProtocol> {
    let api = config.endpoints.schwab_api.clone();
    let factory: ProtocolFactory<SchwabProtocol> = {
        let (credential, api) = (credential.clone(), api.clone());
        Arc::new(move || SchwabProtocol::new(credential.clone(), api.clone()))
    };
    WsSession::new(
        SessionCore::new(Venue::Schwab, bus),
        factory,
        Arc::new(SchwabOpenInterest { credential, api }),
        reqwest::Client::new(),
        WsSettings::from_config(config),
    )
}
