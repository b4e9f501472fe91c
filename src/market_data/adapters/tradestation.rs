//! TradeStation market data over long-lived chunked HTTP responses.
//!
//! There is no socket and no subscribe verb: each stream is a GET whose URL
//! names the symbols, and the body is newline-delimited JSON. Tickers share
//! streams in groups of `tradestation_group_size`; every option gets its own
//! stream. Changing the set means aborting the affected streams and starting
//! new ones. The server may end a stream with `GoAway`, which only asks the
//! client to reconnect with the same parameters.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use itertools::Itertools;
use reqwest::header::AUTHORIZATION;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::tradestation_types as wire;
use super::tradestation_types::QuoteSnapshot;
use super::{bearer, check_status, Credential, MarketUpdate, SessionCore, SubscriptionSet, Venue, VenueSession};
use crate::config::FeedConfig;
use crate::error::{FeedError, FeedResult};
use crate::market_data::backoff::{Backoff, ReconnectPolicy};
use crate::market_data::cache::{OptionStats, QuoteFields};
use crate::market_data::events::{EventBus, FeedEvent};
use crate::market_data::normaliser::{epoch_ms, field_num, field_qty, field_str, qty};
use crate::market_data::symbols::codec_for;
use crate::market_data::types::{now_ms, ConnectionStatus};
use crate::telemetry;

const SNAPSHOT_BATCH: usize = 100;

/// Splits a byte stream into complete lines. Chunk boundaries fall anywhere,
/// including inside a multi-byte character.
#[derive(Debug, Default)]
pub struct NdjsonBuffer {
    pending: Vec<u8>,
}

impl NdjsonBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw);
            let line = text.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamTarget {
    Tickers(Vec<String>),
    /// canonical option symbol
    Option(String),
}

impl StreamTarget {
    fn request(&self, http: &reqwest::Client, api: &str) -> reqwest::RequestBuilder {
        let codec = codec_for(Venue::TradeStation);
        match self {
            StreamTarget::Tickers(symbols) => {
                http.get(format!("{}/v3/marketdata/stream/quotes/{}", api, symbols.iter().join(",")))
            }
            StreamTarget::Option(canonical) => {
                let native = codec.canonical_to_native(canonical).unwrap_or_else(|_| canonical.clone());
                http.get(format!("{}/v3/marketdata/stream/options/quotes", api))
                    .query(&[("legs[0].Symbol", native)])
            }
        }
    }

    fn label(&self) -> String {
        match self {
            StreamTarget::Tickers(symbols) => symbols.iter().join(","),
            StreamTarget::Option(symbol) => symbol.clone(),
        }
    }
}

#[derive(Debug, PartialEq)]
enum Line {
    Updates(Vec<MarketUpdate>),
    GoAway,
    /// `{"Error": ..}` from the server, usually about one symbol
    Rejected(String),
    Ignored,
}

enum StreamEnd {
    /// `idle` when the server said GoAway before sending any data
    GoAway { idle: bool },
    Eof,
}

/// Per-stream decoder. Tracks cumulative volume so that increments can be
/// turned into prints.
#[derive(Default)]
struct LineDecoder {
    volumes: AHashMap<String, u64>,
}

impl LineDecoder {
    fn decode(&mut self, v: &Value, target: &StreamTarget) -> FeedResult<Line> {
        if v.get(wire::HEARTBEAT).is_some() {
            return Ok(Line::Ignored);
        }
        if let Some(status) = field_str(v, wire::STREAM_STATUS) {
            return match status {
                wire::GO_AWAY => Ok(Line::GoAway),
                wire::END_SNAPSHOT => {
                    debug!(stream = %target.label(), "snapshot complete");
                    Ok(Line::Ignored)
                }
                other => {
                    debug!(status = other, "unhandled stream status");
                    Ok(Line::Ignored)
                }
            };
        }
        if let Some(err) = v.get(wire::ERROR) {
            let msg = field_str(v, wire::MESSAGE).unwrap_or_default();
            let what = err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string());
            let symbol = field_str(v, wire::SYMBOL).unwrap_or_default();
            return Ok(Line::Rejected(format!("{} {} {}", what, symbol, msg).trim().to_string()));
        }

        let quote = QuoteFields {
            bid: field_num(v, wire::BID),
            bid_size: field_qty(v, wire::BID_SIZE),
            ask: field_num(v, wire::ASK),
            ask_size: field_qty(v, wire::ASK_SIZE),
        };
        let last = field_num(v, wire::LAST).filter(|p| *p > 0.0);
        let ts = v.get(wire::TRADE_TIME).and_then(epoch_ms).unwrap_or_else(now_ms);
        let mut out = Vec::new();

        match target {
            StreamTarget::Tickers(_) => {
                let symbol = field_str(v, wire::SYMBOL)
                    .map(|s| s.trim().to_ascii_uppercase())
                    .ok_or_else(|| FeedError::Protocol("quote line without Symbol".into()))?;
                if !quote.is_empty() {
                    out.push(MarketUpdate::TickerQuote { symbol: symbol.clone(), quote, ts });
                }
                if let (Some(total), Some(price)) = (field_qty(v, wire::VOLUME), last) {
                    let size = match self.volumes.insert(symbol.clone(), total) {
                        Some(prev) if total > prev => total - prev,
                        _ => 0,
                    };
                    out.push(MarketUpdate::TickerTrade { symbol, price, size, day_volume: Some(total), ts });
                }
            }
            StreamTarget::Option(symbol) => {
                if !quote.is_empty() {
                    out.push(MarketUpdate::OptionQuote { symbol: symbol.clone(), quote, ts });
                }
                let mut stats = OptionStats {
                    open_interest: field_qty(v, wire::OPEN_INTEREST),
                    implied_volatility: field_num(v, wire::IMPLIED_VOLATILITY),
                    ..Default::default()
                };
                let mut trade = None;
                if let Some(total) = field_qty(v, wire::VOLUME) {
                    match (self.volumes.insert(symbol.clone(), total), last) {
                        (Some(prev), Some(price)) if total > prev => {
                            trade = Some(MarketUpdate::OptionTimesale {
                                symbol: symbol.clone(),
                                price,
                                size: total - prev,
                                bid: quote.bid,
                                ask: quote.ask,
                                ts,
                            });
                        }
                        (None, _) => stats.volume = Some(total),
                        _ => {}
                    }
                }
                if trade.is_none() {
                    stats.last = last;
                }
                if stats != OptionStats::default() {
                    out.push(MarketUpdate::OptionStats { symbol: symbol.clone(), stats, ts });
                }
                out.extend(trade);
            }
        }
        Ok(Line::Updates(out))
    }
}

/// Counts a stream task as live until it finishes or is aborted.
struct LiveStream {
    live: Option<Arc<AtomicUsize>>,
}

impl LiveStream {
    fn enter(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self { live: Some(Arc::clone(live)) }
    }

    /// Streams still running after this one.
    fn finish(mut self) -> usize {
        match self.live.take() {
            Some(live) => live.fetch_sub(1, Ordering::SeqCst).saturating_sub(1),
            None => 0,
        }
    }
}

impl Drop for LiveStream {
    fn drop(&mut self) {
        if let Some(live) = self.live.take() {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[derive(Clone)]
struct StreamCtx {
    core: SessionCore,
    credential: Credential,
    api: String,
    http: reqwest::Client,
    policy: ReconnectPolicy,
    live: Arc<AtomicUsize>,
}

impl StreamCtx {
    fn spawn(&self, target: StreamTarget) -> JoinHandle<()> {
        let guard = LiveStream::enter(&self.live);
        tokio::spawn(self.clone().run(target, guard))
    }

    /// One stream's lifetime: restart on GoAway, back off on drops.
    async fn run(self, target: StreamTarget, guard: LiveStream) {
        let venue = self.core.venue();
        let mut backoff = Backoff::new(self.policy);
        loop {
            let err = match self.stream_once(&target, &mut backoff).await {
                Ok(StreamEnd::GoAway { idle }) => {
                    info!(venue = %venue, stream = %target.label(), idle, "server sent GoAway; restarting stream");
                    if idle {
                        tokio::time::sleep(self.policy.base_delay).await;
                    }
                    continue;
                }
                Ok(StreamEnd::Eof) => FeedError::Network("stream ended".into()),
                Err(e) => e,
            };
            if !err.is_retryable() {
                error!(venue = %venue, stream = %target.label(), error = %err, "stream failed");
                self.core.emit_error(err);
                self.stream_lost(guard);
                return;
            }
            let delay = match backoff.next_delay() {
                Ok(delay) => delay,
                Err(exhausted) => {
                    error!(venue = %venue, stream = %target.label(), "giving up on stream");
                    self.core.emit_error(exhausted);
                    self.stream_lost(guard);
                    return;
                }
            };
            self.core.set_reconnect_attempts(backoff.attempts());
            metrics::counter!(telemetry::RECONNECTS_TOTAL, "venue" => venue.as_str()).increment(1);
            warn!(venue = %venue, stream = %target.label(), error = %err, ?delay, "stream dropped; retrying");
            tokio::time::sleep(delay).await;
        }
    }

    /// The session is down once its last stream has given up.
    fn stream_lost(&self, guard: LiveStream) {
        if guard.finish() > 0 || self.core.status() == ConnectionStatus::Disconnected {
            return;
        }
        let venue = self.core.venue();
        warn!(venue = %venue, "no live streams left");
        self.core.set_status(ConnectionStatus::Disconnected);
        self.core.emit(FeedEvent::Disconnected { venue, reason: "all streams failed".into() });
    }

    async fn stream_once(&self, target: &StreamTarget, backoff: &mut Backoff) -> FeedResult<StreamEnd> {
        let venue = self.core.venue();
        let res = target
            .request(&self.http, &self.api)
            .header(AUTHORIZATION, bearer(&self.credential))
            .send()
            .await?;
        let mut res = check_status(res).await?;
        if backoff.attempts() > 0 {
            backoff.reset();
            self.core.set_reconnect_attempts(0);
        }
        debug!(venue = %venue, stream = %target.label(), "stream open");

        let mut buffer = NdjsonBuffer::default();
        let mut decoder = LineDecoder::default();
        let mut delivered = false;
        while let Some(chunk) = res.chunk().await? {
            for line in buffer.push(&chunk) {
                metrics::counter!(telemetry::FRAMES_TOTAL, "venue" => venue.as_str()).increment(1);
                let parsed = serde_json::from_str::<Value>(&line)
                    .map_err(FeedError::from)
                    .and_then(|v| decoder.decode(&v, target));
                match parsed {
                    Ok(Line::Updates(updates)) => {
                        delivered |= !updates.is_empty();
                        self.core.apply_all(updates);
                    }
                    Ok(Line::GoAway) => return Ok(StreamEnd::GoAway { idle: !delivered }),
                    Ok(Line::Ignored) => {}
                    Ok(Line::Rejected(reason)) => {
                        warn!(venue = %venue, stream = %target.label(), reason, "stream reported an error");
                        self.core.emit_error(FeedError::Protocol(format!("tradestation: {}", reason)));
                    }
                    Err(e) => {
                        warn!(venue = %venue, error = %e, "dropping line");
                        metrics::counter!(telemetry::DROPPED_FRAMES_TOTAL, "venue" => venue.as_str(), "reason" => "protocol")
                            .increment(1);
                    }
                }
            }
        }
        Ok(StreamEnd::Eof)
    }
}

async fn stop(handles: Vec<JoinHandle<()>>) {
    for handle in &handles {
        handle.abort();
    }
    for handle in handles {
        let _ = handle.await;
    }
}

pub struct TradeStationSession {
    ctx: StreamCtx,
    group_size: usize,
    check_timeout: Duration,
    ticker_streams: Vec<(Vec<String>, JoinHandle<()>)>,
    option_streams: AHashMap<String, JoinHandle<()>>,
}

impl TradeStationSession {
    pub fn new(credential: Credential, config: &FeedConfig, bus: Arc<EventBus>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .unwrap_or_default();
        Self {
            ctx: StreamCtx {
                core: SessionCore::new(Venue::TradeStation, bus),
                credential,
                api: config.endpoints.tradestation_api.clone(),
                http,
                policy: ReconnectPolicy::from(&config.reconnect),
                live: Arc::new(AtomicUsize::new(0)),
            },
            group_size: config.tradestation_group_size.max(1),
            check_timeout: config.handshake_timeout(),
            ticker_streams: Vec::new(),
            option_streams: AHashMap::new(),
        }
    }

    fn start(&mut self, set: &SubscriptionSet) {
        let tickers: Vec<String> = set.tickers.iter().cloned().collect();
        self.start_ticker_groups(tickers);
        for option in &set.options {
            let handle = self.ctx.spawn(StreamTarget::Option(option.clone()));
            if let Some(old) = self.option_streams.insert(option.clone(), handle) {
                old.abort();
            }
        }
    }

    fn start_ticker_groups(&mut self, tickers: Vec<String>) {
        for group in tickers.chunks(self.group_size) {
            let group = group.to_vec();
            let handle = self.ctx.spawn(StreamTarget::Tickers(group.clone()));
            self.ticker_streams.push((group, handle));
        }
    }

    /// Aborts every stream and waits until none can touch the cache again.
    async fn stop_all(&mut self) {
        let handles: Vec<JoinHandle<()>> = self
            .ticker_streams
            .drain(..)
            .map(|(_, handle)| handle)
            .chain(self.option_streams.drain().map(|(_, handle)| handle))
            .collect();
        stop(handles).await;
    }

    fn streaming(&self) -> bool {
        self.ctx.core.status() == ConnectionStatus::Streaming
    }
}

#[async_trait]
impl VenueSession for TradeStationSession {
    fn venue(&self) -> Venue {
        Venue::TradeStation
    }

    async fn connect(&mut self) -> FeedResult<()> {
        if self.streaming() {
            return Ok(());
        }
        let core = self.ctx.core.clone();
        core.set_status(ConnectionStatus::Connecting);
        let check = async {
            let res = self
                .ctx
                .http
                .get(format!("{}/v3/brokerage/accounts", self.ctx.api))
                .header(AUTHORIZATION, bearer(&self.ctx.credential))
                .send()
                .await?;
            check_status(res).await.map(|_| ())
        };
        if let Err(e) = tokio::time::timeout(self.check_timeout, check)
            .await
            .unwrap_or_else(|_| Err(FeedError::Timeout("credential check".into())))
        {
            core.set_status(ConnectionStatus::Disconnected);
            return Err(e);
        }
        core.set_status(ConnectionStatus::Authenticated);

        // Streams left over from a session whose streams all gave up
        self.stop_all().await;
        let subs = core.subscriptions();
        self.start(&subs);
        core.set_status(ConnectionStatus::Streaming);
        info!(venue = %self.venue(), streams = self.ticker_streams.len() + self.option_streams.len(), "streaming");
        core.emit(FeedEvent::Connected { venue: self.venue() });
        Ok(())
    }

    async fn disconnect(&mut self) {
        let core = self.ctx.core.clone();
        let was_active = core.status() != ConnectionStatus::Disconnected;
        self.stop_all().await;
        core.clear();
        core.set_status(ConnectionStatus::Disconnected);
        if was_active {
            info!(venue = %self.venue(), "disconnected");
            core.emit(FeedEvent::Disconnected { venue: self.venue(), reason: "client disconnect".into() });
        }
    }

    async fn subscribe(&mut self, tickers: &[String], options: &[String]) -> FeedResult<()> {
        let request = SessionCore::normalize_request(tickers, options)?;
        let added = self.ctx.core.add_subscriptions(&request);
        if self.streaming() && !added.is_empty() {
            self.start(&added);
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, tickers: &[String], options: &[String]) -> FeedResult<()> {
        let request = SessionCore::normalize_request(tickers, options)?;
        let removed = self.ctx.core.remove_subscriptions(&request);
        let dropped: Vec<JoinHandle<()>> =
            removed.options.iter().filter_map(|option| self.option_streams.remove(option)).collect();
        stop(dropped).await;
        if removed.tickers.is_empty() {
            return Ok(());
        }

        // Groups that lost a member restart with the members they keep
        let (affected, kept): (Vec<_>, Vec<_>) = self
            .ticker_streams
            .drain(..)
            .partition(|(group, _)| group.iter().any(|t| removed.tickers.contains(t)));
        self.ticker_streams = kept;
        let mut survivors = Vec::new();
        let mut stopped = Vec::with_capacity(affected.len());
        for (group, handle) in affected {
            stopped.push(handle);
            survivors.extend(group.into_iter().filter(|t| !removed.tickers.contains(t)));
        }
        stop(stopped).await;
        if self.streaming() {
            self.start_ticker_groups(survivors);
        }
        Ok(())
    }

    async fn fetch_open_interest(&self, options: &[String]) -> FeedResult<usize> {
        let request = SessionCore::normalize_request(&[], options)?;
        let codec = codec_for(Venue::TradeStation);
        let symbols: Vec<String> = request.options.into_iter().collect();
        let mut values = Vec::with_capacity(symbols.len());
        for batch in symbols.chunks(SNAPSHOT_BATCH) {
            let natives = batch.iter().filter_map(|o| codec.canonical_to_native(o).ok()).join(",");
            let res = self
                .ctx
                .http
                .get(format!("{}/v3/marketdata/quotes/{}", self.ctx.api, natives))
                .header(AUTHORIZATION, bearer(&self.ctx.credential))
                .send()
                .await?;
            let body: QuoteSnapshot = check_status(res).await?.json().await?;
            for quote in body.quotes {
                if let (Some(oi), Ok(symbol)) = (qty(&quote.daily_open_interest), codec.native_to_canonical(&quote.symbol)) {
                    values.push((symbol, oi));
                }
            }
        }
        Ok(self.ctx.core.apply_base_open_interest(&values))
    }

    fn core(&self) -> &SessionCore {
        &self.ctx.core
    }
}

impl Drop for TradeStationSession {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ndjson_buffer_handles_split_lines() {
        let mut buf = NdjsonBuffer::default();
        assert!(buf.push(b"{\"a\":").is_empty());
        let lines = buf.push(b"1}\n{\"b\":2}\r\n\n{\"c\"");
        assert_eq!(lines, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
        assert_eq!(buf.pending_len(), 4);
        assert_eq!(buf.push(b":3}\n"), vec!["{\"c\":3}".to_string()]);
    }

    #[test]
    fn test_ndjson_buffer_split_inside_utf8() {
        let mut buf = NdjsonBuffer::default();
        let bytes = "{\"m\":\"é\"}\n".as_bytes();
        assert!(buf.push(&bytes[..7]).is_empty());
        assert_eq!(buf.push(&bytes[7..]), vec!["{\"m\":\"é\"}".to_string()]);
    }

    #[test]
    fn test_live_stream_count() {
        let live = Arc::new(AtomicUsize::new(0));
        let first = LiveStream::enter(&live);
        let second = LiveStream::enter(&live);
        drop(second);
        assert_eq!(live.load(Ordering::SeqCst), 1);
        let third = LiveStream::enter(&live);
        assert_eq!(first.finish(), 1);
        assert_eq!(third.finish(), 0);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stopped_streams_do_not_run_again() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let handle = tokio::spawn(async move {
            loop {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
            }
        });
        tokio::task::yield_now().await;
        stop(vec![handle]).await;
        let seen = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn test_control_lines() {
        let mut d = LineDecoder::default();
        let t = StreamTarget::Tickers(vec!["SPY".into()]);
        assert_eq!(d.decode(&json!({"Heartbeat": 1, "Timestamp": "2024-01-01T00:00:00Z"}), &t).unwrap(), Line::Ignored);
        assert_eq!(d.decode(&json!({"StreamStatus": "EndSnapshot"}), &t).unwrap(), Line::Ignored);
        assert_eq!(d.decode(&json!({"StreamStatus": "GoAway"}), &t).unwrap(), Line::GoAway);
        assert_eq!(
            d.decode(&json!({"Error": "InvalidSymbol", "Symbol": "XX"}), &t).unwrap(),
            Line::Rejected("InvalidSymbol XX".into())
        );
        assert!(d.decode(&json!({"Bid": "1.0"}), &t).is_err());
    }

    #[test]
    fn test_ticker_volume_increments_become_trades() {
        let mut d = LineDecoder::default();
        let t = StreamTarget::Tickers(vec!["SPY".into()]);
        let line = json!({"Symbol": "SPY", "Bid": "570.1", "BidSize": "100", "Ask": "570.2", "AskSize": "200", "Last": "570.15", "Volume": "1000"});
        let Line::Updates(first) = d.decode(&line, &t).unwrap() else { panic!("expected updates") };
        assert!(matches!(&first[1], MarketUpdate::TickerTrade { size: 0, day_volume: Some(1000), .. }));

        let line = json!({"Symbol": "SPY", "Last": "570.2", "Volume": "1040", "TradeTime": "2024-01-19T15:00:00Z"});
        let Line::Updates(next) = d.decode(&line, &t).unwrap() else { panic!("expected updates") };
        assert_eq!(next.len(), 1);
        assert!(matches!(&next[0], MarketUpdate::TickerTrade { size: 40, ts: 1705676400000, .. }));
    }

    #[test]
    fn test_option_line_classifies_against_its_own_quote() {
        let mut d = LineDecoder::default();
        let t = StreamTarget::Option("SPY240119C00500000".into());
        let Line::Updates(first) = d
            .decode(&json!({"Bid": "10.0", "Ask": "10.2", "Volume": "5", "DailyOpenInterest": "1200", "ImpliedVolatility": "0.2"}), &t)
            .unwrap()
        else {
            panic!("expected updates")
        };
        assert!(matches!(
            &first[1],
            MarketUpdate::OptionStats { stats: OptionStats { open_interest: Some(1200), volume: Some(5), .. }, .. }
        ));

        let Line::Updates(next) = d.decode(&json!({"Bid": "10.0", "Ask": "10.2", "Last": "10.0", "Volume": "8"}), &t).unwrap() else {
            panic!("expected updates")
        };
        assert!(matches!(
            next.last(),
            Some(MarketUpdate::OptionTimesale { size: 3, bid: Some(_), ask: Some(_), .. })
        ));
    }

    #[test]
    fn test_option_stream_request_uses_spaced_symbol() {
        let http = reqwest::Client::new();
        let req = StreamTarget::Option("SPY240119C00502500".into())
            .request(&http, "http://api")
            .build()
            .unwrap();
        let url = req.url().as_str().to_string();
        assert!(url.starts_with("http://api/v3/marketdata/stream/options/quotes?"));
        assert!(url.contains("SPY+240119C502.5") || url.contains("SPY%20240119C502.5"));
    }
}
