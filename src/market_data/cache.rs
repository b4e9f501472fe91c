//! Venue-scoped store of the latest normalized snapshots, base open interest,
//! cumulative open-interest deltas and the intraday trade log.
//!
//! Every upsert merges into the existing snapshot: a field that is absent from an
//! update keeps its previous value.

use std::sync::Arc;

use ahash::AHashMap;
use tracing::{debug, trace};

use crate::error::FeedError;
use crate::market_data::estimator::{self, AggressorOiHeuristic, OiDeltaStrategy};
use crate::market_data::symbols::OccSymbol;
use crate::market_data::types::{FlowSummary, IntradayTrade, NormalizedOption, NormalizedTicker};

/// Quote-side fields of a partial update. `None` means "not in this message".
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QuoteFields {
    pub bid: Option<f64>,
    pub bid_size: Option<u64>,
    pub ask: Option<f64>,
    pub ask_size: Option<u64>,
}

impl QuoteFields {
    pub fn full(bid: f64, bid_size: u64, ask: f64, ask_size: u64) -> Self {
        Self { bid: Some(bid), bid_size: Some(bid_size), ask: Some(ask), ask_size: Some(ask_size) }
    }

    pub fn is_empty(&self) -> bool {
        self.bid.is_none() && self.bid_size.is_none() && self.ask.is_none() && self.ask_size.is_none()
    }
}

/// Summary/greeks style fields that are neither quote nor trade.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OptionStats {
    pub open_interest: Option<u64>,
    pub implied_volatility: Option<f64>,
    pub mark: Option<f64>,
    pub last: Option<f64>,
    pub volume: Option<u64>,
}

pub struct NormalizedCache {
    tickers: AHashMap<String, NormalizedTicker>,
    options: AHashMap<String, NormalizedOption>,
    base_oi: AHashMap<String, u64>,
    oi_delta: AHashMap<String, i64>,
    trades: AHashMap<String, Vec<IntradayTrade>>,
    strategy: Arc<dyn OiDeltaStrategy>,
}

impl Default for NormalizedCache {
    fn default() -> Self {
        Self::new()
    }
}

impl NormalizedCache {
    pub fn new() -> Self {
        Self::with_strategy(Arc::new(AggressorOiHeuristic))
    }

    pub fn with_strategy(strategy: Arc<dyn OiDeltaStrategy>) -> Self {
        Self {
            tickers: AHashMap::new(),
            options: AHashMap::new(),
            base_oi: AHashMap::new(),
            oi_delta: AHashMap::new(),
            trades: AHashMap::new(),
            strategy,
        }
    }

    pub fn upsert_ticker_from_quote(&mut self, symbol: &str, quote: QuoteFields, ts: i64) -> NormalizedTicker {
        let t = self.ticker_entry(symbol);
        merge_quote(&mut t.bid, &mut t.bid_size, &mut t.ask, &mut t.ask_size, &quote);
        t.spot = spot_of(t);
        t.timestamp = ts;
        t.clone()
    }

    pub fn upsert_ticker_from_trade(&mut self, symbol: &str, price: f64, size: u64, day_volume: Option<u64>, ts: i64) -> NormalizedTicker {
        let t = self.ticker_entry(symbol);
        t.last = price;
        t.volume = match day_volume {
            Some(v) => v,
            None => t.volume.saturating_add(size),
        };
        t.spot = spot_of(t);
        t.timestamp = ts;
        t.clone()
    }

    pub fn upsert_option_from_quote(&mut self, symbol: &str, quote: QuoteFields, ts: i64) -> Result<NormalizedOption, FeedError> {
        let key = self.option_entry(symbol)?.symbol.clone();
        let live = self.live_for(&key);
        let o = self.option_entry(&key)?;
        merge_quote(&mut o.bid, &mut o.bid_size, &mut o.ask, &mut o.ask_size, &quote);
        recompute_mark(o);
        o.live_open_interest = live;
        o.timestamp = ts;
        Ok(o.clone())
    }

    /// A trade without a contemporaneous quote. Updates last/volume but is not classified.
    pub fn upsert_option_from_trade(&mut self, symbol: &str, price: f64, size: u64, day_volume: Option<u64>, ts: i64) -> Result<NormalizedOption, FeedError> {
        let key = self.option_entry(symbol)?.symbol.clone();
        let live = self.live_for(&key);
        let o = self.option_entry(&key)?;
        o.last = price;
        o.volume = match day_volume {
            Some(v) => v,
            None => o.volume.saturating_add(size),
        };
        o.live_open_interest = live;
        o.timestamp = ts;
        Ok(o.clone())
    }

    /// A trade with the NBBO in force at the time: classified, logged and applied
    /// to the cumulative open-interest delta exactly once.
    pub fn upsert_option_from_timesale(
        &mut self,
        symbol: &str,
        price: f64,
        size: u64,
        bid: f64,
        ask: f64,
        ts: i64,
    ) -> Result<(NormalizedOption, IntradayTrade), FeedError> {
        // Make sure the symbol is known before touching the delta/log maps
        let key = self.option_entry(symbol)?.symbol.clone();

        let aggressor = estimator::classify_aggressor(price, bid, ask);
        let delta = self.strategy.oi_delta(aggressor, size);
        let trade = IntradayTrade {
            symbol: key.clone(),
            price,
            size,
            bid,
            ask,
            aggressor,
            timestamp: ts,
            estimated_oi_change: delta,
        };
        *self.oi_delta.entry(key.clone()).or_insert(0) += delta;
        self.trades.entry(key.clone()).or_default().push(trade.clone());

        let live = self.live_for(&key);
        let o = self.option_entry(&key)?;
        o.last = price;
        o.volume = o.volume.saturating_add(size);
        o.live_open_interest = live;
        o.timestamp = ts;
        trace!(symbol = %key, ?aggressor, delta, live, "classified trade");
        Ok((o.clone(), trade))
    }

    pub fn upsert_option_stats(&mut self, symbol: &str, stats: OptionStats, ts: i64) -> Result<NormalizedOption, FeedError> {
        let key = self.option_entry(symbol)?.symbol.clone();
        if let Some(oi) = stats.open_interest {
            self.set_base_open_interest(&key, oi);
        }
        let live = self.live_for(&key);
        let o = self.option_entry(&key)?;
        if let Some(oi) = stats.open_interest.filter(|oi| *oi > 0) {
            o.open_interest = oi;
        }
        if let Some(iv) = stats.implied_volatility {
            o.implied_volatility = Some(iv);
        }
        if let Some(last) = stats.last {
            o.last = last;
        }
        if let Some(volume) = stats.volume {
            o.volume = volume;
        }
        recompute_mark(o);
        if let (Some(mark), true) = (stats.mark, o.mark == 0.0) {
            o.mark = mark;
        }
        o.live_open_interest = live;
        o.timestamp = ts;
        Ok(o.clone())
    }

    /// First accepted non-zero snapshot wins for the lifetime of the cache.
    /// Returns whether the value was accepted.
    pub fn set_base_open_interest(&mut self, symbol: &str, oi: u64) -> bool {
        if oi == 0 || self.base_oi.contains_key(symbol) {
            return false;
        }
        self.base_oi.insert(symbol.to_string(), oi);
        let live = self.live_for(symbol);
        if let Some(o) = self.options.get_mut(symbol) {
            o.live_open_interest = live;
        }
        debug!(symbol, oi, "base open interest set");
        true
    }

    pub fn base_open_interest(&self, symbol: &str) -> Option<u64> {
        self.base_oi.get(symbol).copied()
    }

    pub fn cumulative_oi_delta(&self, symbol: &str) -> i64 {
        self.oi_delta.get(symbol).copied().unwrap_or(0)
    }

    pub fn live_open_interest(&self, symbol: &str) -> u64 {
        self.live_for(symbol)
    }

    fn live_for(&self, symbol: &str) -> u64 {
        let base = match self.base_oi.get(symbol) {
            Some(b) => *b,
            None => self.options.get(symbol).map(|o| o.open_interest).unwrap_or(0),
        };
        estimator::live_open_interest(base, self.cumulative_oi_delta(symbol))
    }

    pub fn ticker(&self, symbol: &str) -> Option<&NormalizedTicker> {
        self.tickers.get(symbol)
    }

    pub fn option(&self, symbol: &str) -> Option<&NormalizedOption> {
        self.options.get(symbol)
    }

    pub fn tickers(&self) -> Vec<NormalizedTicker> {
        self.tickers.values().cloned().collect()
    }

    pub fn options(&self) -> Vec<NormalizedOption> {
        self.options.values().cloned().collect()
    }

    pub fn intraday_trades(&self, symbol: &str) -> &[IntradayTrade] {
        self.trades.get(symbol).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn flow_summary(&self, symbol: &str) -> FlowSummary {
        FlowSummary::from_trades(self.intraday_trades(symbol))
    }

    /// Flow aggregated over every option on `underlying`.
    pub fn underlying_flow(&self, underlying: &str) -> FlowSummary {
        FlowSummary::from_trades(
            self.options
                .values()
                .filter(|o| o.underlying == underlying)
                .flat_map(|o| self.intraday_trades(&o.symbol)),
        )
    }

    /// Drop trade logs and deltas; base open interest survives.
    pub fn reset_intraday(&mut self) {
        self.trades.clear();
        self.oi_delta.clear();
        let keys: Vec<String> = self.options.keys().cloned().collect();
        for key in keys {
            let live = self.live_for(&key);
            if let Some(o) = self.options.get_mut(&key) {
                o.live_open_interest = live;
            }
        }
    }

    pub fn clear(&mut self) {
        self.tickers.clear();
        self.options.clear();
        self.base_oi.clear();
        self.oi_delta.clear();
        self.trades.clear();
    }

    fn ticker_entry(&mut self, symbol: &str) -> &mut NormalizedTicker {
        self.tickers
            .entry(symbol.to_string())
            .or_insert_with(|| NormalizedTicker { symbol: symbol.to_string(), ..Default::default() })
    }

    /// Existing snapshot, or a fresh one built from the parsed symbol.
    fn option_entry(&mut self, symbol: &str) -> Result<&mut NormalizedOption, FeedError> {
        if !self.options.contains_key(symbol) {
            let occ = OccSymbol::parse(symbol)?;
            let key = occ.to_string();
            if key != symbol {
                // Non-canonical spelling of a symbol that may already be cached
                return self.option_entry_parsed(occ);
            }
            self.options.insert(key, new_option(&occ));
        }
        self.options
            .get_mut(symbol)
            .ok_or_else(|| FeedError::Symbol(symbol.to_string()))
    }

    fn option_entry_parsed(&mut self, occ: OccSymbol) -> Result<&mut NormalizedOption, FeedError> {
        let key = occ.to_string();
        Ok(self.options.entry(key).or_insert_with(|| new_option(&occ)))
    }
}

fn new_option(occ: &OccSymbol) -> NormalizedOption {
    NormalizedOption {
        symbol: occ.to_string(),
        underlying: occ.root.clone(),
        strike: occ.strike(),
        expiration: occ.expiration,
        expiration_ms: occ.expiration_ms(),
        option_type: occ.option_type,
        bid: 0.0,
        bid_size: 0,
        ask: 0.0,
        ask_size: 0,
        mark: 0.0,
        last: 0.0,
        volume: 0,
        open_interest: 0,
        live_open_interest: 0,
        implied_volatility: None,
        timestamp: 0,
    }
}

fn merge_quote(bid: &mut f64, bid_size: &mut u64, ask: &mut f64, ask_size: &mut u64, q: &QuoteFields) {
    if let Some(v) = q.bid {
        *bid = v;
    }
    if let Some(v) = q.bid_size {
        *bid_size = v;
    }
    if let Some(v) = q.ask {
        *ask = v;
    }
    if let Some(v) = q.ask_size {
        *ask_size = v;
    }
}

fn recompute_mark(o: &mut NormalizedOption) {
    if o.bid > 0.0 && o.ask > 0.0 {
        o.mark = (o.bid + o.ask) / 2.0;
    }
}

fn spot_of(t: &NormalizedTicker) -> f64 {
    if t.bid > 0.0 && t.ask > 0.0 {
        (t.bid + t.ask) / 2.0
    } else if t.last > 0.0 {
        t.last
    } else {
        t.spot
    }
}
