// State shared between a venue session handle and its connection task.
use std::collections::BTreeSet;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::{MarketUpdate, Venue};
use crate::error::FeedError;
use crate::market_data::cache::NormalizedCache;
use crate::market_data::events::{EventBus, FeedEvent};
use crate::market_data::symbols::{codec_for, normalize_option, normalize_ticker};
use crate::market_data::types::{ConnectionStatus, VenueSessionState};
use crate::telemetry;

/// Subscribed symbols; tickers as typed (upper-cased), options canonical.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    pub tickers: BTreeSet<String>,
    pub options: BTreeSet<String>,
}

impl SubscriptionSet {
    pub fn new<T: AsRef<str>, O: AsRef<str>>(tickers: &[T], options: &[O]) -> Self {
        Self {
            tickers: tickers.iter().map(|t| t.as_ref().to_string()).collect(),
            options: options.iter().map(|o| o.as_ref().to_string()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tickers.is_empty() && self.options.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tickers.len() + self.options.len()
    }

    /// Adds `other` and returns only the symbols that were not already present.
    pub fn add(&mut self, other: &SubscriptionSet) -> SubscriptionSet {
        let mut added = SubscriptionSet::default();
        for t in &other.tickers {
            if self.tickers.insert(t.clone()) {
                added.tickers.insert(t.clone());
            }
        }
        for o in &other.options {
            if self.options.insert(o.clone()) {
                added.options.insert(o.clone());
            }
        }
        added
    }

    /// Removes `other` and returns only the symbols that were actually present.
    pub fn remove(&mut self, other: &SubscriptionSet) -> SubscriptionSet {
        let mut removed = SubscriptionSet::default();
        for t in &other.tickers {
            if self.tickers.remove(t) {
                removed.tickers.insert(t.clone());
            }
        }
        for o in &other.options {
            if self.options.remove(o) {
                removed.options.insert(o.clone());
            }
        }
        removed
    }

    pub fn all_symbols(&self) -> impl Iterator<Item = &String> {
        self.tickers.iter().chain(self.options.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Ticker(String),
    Option(String),
}

struct StatusCell {
    status: ConnectionStatus,
    reconnect_attempts: u32,
}

struct CoreInner {
    venue: Venue,
    cache: RwLock<NormalizedCache>,
    bus: Arc<EventBus>,
    subs: Mutex<SubscriptionSet>,
    status: Mutex<StatusCell>,
    /// native -> canonical for every option subscribed through this session
    natives: Mutex<AHashMap<String, String>>,
}

/// Cheap to clone; every clone refers to the same session state.
#[derive(Clone)]
pub struct SessionCore {
    inner: Arc<CoreInner>,
}

impl SessionCore {
    pub fn new(venue: Venue, bus: Arc<EventBus>) -> Self {
        Self::with_cache(venue, bus, NormalizedCache::new())
    }

    pub fn with_cache(venue: Venue, bus: Arc<EventBus>, cache: NormalizedCache) -> Self {
        Self {
            inner: Arc::new(CoreInner {
                venue,
                cache: RwLock::new(cache),
                bus,
                subs: Mutex::new(SubscriptionSet::default()),
                status: Mutex::new(StatusCell { status: ConnectionStatus::Disconnected, reconnect_attempts: 0 }),
                natives: Mutex::new(AHashMap::new()),
            }),
        }
    }

    pub fn venue(&self) -> Venue {
        self.inner.venue
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn cache(&self) -> &RwLock<NormalizedCache> {
        &self.inner.cache
    }

    // --- subscriptions -------------------------------------------------

    /// Validates and normalizes caller input.
    pub fn normalize_request(tickers: &[String], options: &[String]) -> Result<SubscriptionSet, FeedError> {
        let mut set = SubscriptionSet::default();
        for t in tickers {
            let t = normalize_ticker(t);
            if t.is_empty() {
                return Err(FeedError::Symbol("empty ticker".into()));
            }
            set.tickers.insert(t);
        }
        for o in options {
            set.options.insert(normalize_option(o)?);
        }
        Ok(set)
    }

    pub fn add_subscriptions(&self, request: &SubscriptionSet) -> SubscriptionSet {
        let added = self.inner.subs.lock().add(request);
        let codec = codec_for(self.venue());
        let mut natives = self.inner.natives.lock();
        for canonical in &added.options {
            if let Ok(native) = codec.canonical_to_native(canonical) {
                natives.insert(native.trim().to_string(), canonical.clone());
            }
        }
        added
    }

    pub fn remove_subscriptions(&self, request: &SubscriptionSet) -> SubscriptionSet {
        self.inner.subs.lock().remove(request)
    }

    pub fn subscriptions(&self) -> SubscriptionSet {
        self.inner.subs.lock().clone()
    }

    pub fn subscribed_tickers(&self) -> Vec<String> {
        self.inner.subs.lock().tickers.iter().cloned().collect()
    }

    pub fn subscribed_options(&self) -> Vec<String> {
        self.inner.subs.lock().options.iter().cloned().collect()
    }

    /// Native spelling of a canonical option for this venue.
    pub fn option_native(&self, canonical: &str) -> Option<String> {
        codec_for(self.venue()).canonical_to_native(canonical).ok()
    }

    /// Canonical option symbol for a native one: parse first, then fall back to the
    /// mapping recorded when the option was subscribed.
    pub fn resolve_option(&self, native: &str) -> Option<String> {
        match codec_for(self.venue()).native_to_canonical(native) {
            Ok(canonical) => Some(canonical),
            Err(e) => {
                let cached = self.inner.natives.lock().get(native.trim()).cloned();
                if cached.is_none() {
                    debug!(venue = %self.venue(), native, error = %e, "untranslatable option symbol");
                }
                cached
            }
        }
    }

    /// Decide whether a native symbol from the wire is an option or an equity.
    pub fn route(&self, native: &str) -> Routed {
        if let Ok(canonical) = codec_for(self.venue()).native_to_canonical(native) {
            return Routed::Option(canonical);
        }
        if let Some(canonical) = self.inner.natives.lock().get(native.trim()).cloned() {
            return Routed::Option(canonical);
        }
        Routed::Ticker(normalize_ticker(native))
    }

    // --- state ---------------------------------------------------------

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.lock().status
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        self.inner.status.lock().status = status;
        let connected = if status == ConnectionStatus::Streaming { 1.0 } else { 0.0 };
        metrics::gauge!(telemetry::SESSION_CONNECTED, "venue" => self.venue().as_str()).set(connected);
    }

    pub fn set_reconnect_attempts(&self, attempts: u32) {
        self.inner.status.lock().reconnect_attempts = attempts;
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Streaming
    }

    pub fn state(&self) -> VenueSessionState {
        let (status, reconnect_attempts) = {
            let s = self.inner.status.lock();
            (s.status, s.reconnect_attempts)
        };
        VenueSessionState {
            status,
            subscribed_tickers: self.subscribed_tickers(),
            subscribed_options: self.subscribed_options(),
            reconnect_attempts,
        }
    }

    /// Session end: drop subscriptions, symbol mappings and every cached value.
    pub fn clear(&self) {
        *self.inner.subs.lock() = SubscriptionSet::default();
        self.inner.natives.lock().clear();
        self.inner.cache.write().clear();
        self.inner.status.lock().reconnect_attempts = 0;
    }

    // --- events --------------------------------------------------------

    pub fn emit(&self, event: FeedEvent) {
        self.inner.bus.emit(&event);
    }

    pub fn emit_error(&self, error: FeedError) {
        self.emit(FeedEvent::Error { venue: Some(self.venue()), error });
    }

    pub fn apply_all(&self, updates: Vec<MarketUpdate>) {
        for update in updates {
            self.apply(update);
        }
    }

    /// Merge one decoded update into the cache and emit exactly one update event.
    pub fn apply(&self, update: MarketUpdate) {
        let venue = self.venue();
        // The write lock is released before listeners run
        let result = {
            let mut cache = self.inner.cache.write();
            match update {
                MarketUpdate::TickerQuote { symbol, quote, ts } => {
                    Ok(FeedEvent::TickerUpdated(cache.upsert_ticker_from_quote(&symbol, quote, ts)))
                }
                MarketUpdate::TickerTrade { symbol, price, size, day_volume, ts } => {
                    Ok(FeedEvent::TickerUpdated(cache.upsert_ticker_from_trade(&symbol, price, size, day_volume, ts)))
                }
                MarketUpdate::OptionQuote { symbol, quote, ts } => cache
                    .upsert_option_from_quote(&symbol, quote, ts)
                    .map(|option| FeedEvent::OptionUpdated { option, trade: None }),
                MarketUpdate::OptionTrade { symbol, price, size, day_volume, ts } => cache
                    .upsert_option_from_trade(&symbol, price, size, day_volume, ts)
                    .map(|option| FeedEvent::OptionUpdated { option, trade: None }),
                MarketUpdate::OptionTimesale { symbol, price, size, bid, ask, ts } => {
                    // Venues without a contemporaneous quote classify against the cached one
                    let (cached_bid, cached_ask) =
                        cache.option(&symbol).map(|o| (o.bid, o.ask)).unwrap_or((0.0, 0.0));
                    cache
                        .upsert_option_from_timesale(
                            &symbol,
                            price,
                            size,
                            bid.unwrap_or(cached_bid),
                            ask.unwrap_or(cached_ask),
                            ts,
                        )
                        .map(|(option, trade)| FeedEvent::OptionUpdated { option, trade: Some(trade) })
                }
                MarketUpdate::OptionStats { symbol, stats, ts } => cache
                    .upsert_option_stats(&symbol, stats, ts)
                    .map(|option| FeedEvent::OptionUpdated { option, trade: None }),
            }
        };

        match result {
            Ok(event) => {
                let trade = match &event {
                    FeedEvent::OptionUpdated { trade: Some(t), .. } => Some(t.clone()),
                    _ => None,
                };
                self.emit(event);
                if let Some(trade) = trade {
                    let side = format!("{:?}", trade.aggressor).to_lowercase();
                    metrics::counter!(telemetry::TRADES_CLASSIFIED_TOTAL, "side" => side).increment(1);
                    self.emit(FeedEvent::TradeClassified(trade));
                }
            }
            Err(e) => {
                warn!(venue = %venue, error = %e, "dropping update");
                metrics::counter!(telemetry::DROPPED_FRAMES_TOTAL, "venue" => venue.as_str(), "reason" => "symbol")
                    .increment(1);
            }
        }
    }

    /// Seed base open interest from a REST snapshot. Returns how many were accepted.
    pub fn apply_base_open_interest(&self, values: &[(String, u64)]) -> usize {
        let mut accepted = 0;
        let mut events = Vec::new();
        {
            let mut cache = self.inner.cache.write();
            for (symbol, oi) in values {
                if cache.set_base_open_interest(symbol, *oi) {
                    accepted += 1;
                }
                let stats = crate::market_data::cache::OptionStats { open_interest: Some(*oi), ..Default::default() };
                match cache.upsert_option_stats(symbol, stats, crate::market_data::types::now_ms()) {
                    Ok(option) => events.push(FeedEvent::OptionUpdated { option, trade: None }),
                    Err(e) => warn!(venue = %self.venue(), symbol, error = %e, "open interest for unknown symbol"),
                }
            }
        }
        for event in events {
            self.emit(event);
        }
        accepted
    }
}
