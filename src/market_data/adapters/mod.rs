// Shared trait + types for venue sessions

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::FeedConfig;
use crate::error::{FeedError, FeedResult};
use crate::market_data::cache::{OptionStats, QuoteFields};
use crate::market_data::events::EventBus;
use crate::market_data::types::{NormalizedOption, NormalizedTicker, VenueSessionState};

pub mod session;
pub mod ws;

pub mod schwab;
pub mod schwab_types;
pub mod tastytrade;
pub mod tastytrade_types;
pub mod tradestation;
pub mod tradestation_types;
pub mod tradier;
pub mod tradier_types;
pub mod webull;
pub mod webull_types;

pub use session::{Routed, SessionCore, SubscriptionSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Venue {
    Tradier,
    Tastytrade,
    Schwab,
    Webull,
    TradeStation,
}

impl Venue {
    pub const ALL: [Venue; 5] = [Venue::Tradier, Venue::Tastytrade, Venue::Schwab, Venue::Webull, Venue::TradeStation];

    pub fn as_str(self) -> &'static str {
        match self {
            Venue::Tradier => "tradier",
            Venue::Tastytrade => "tastytrade",
            Venue::Schwab => "schwab",
            Venue::Webull => "webull",
            Venue::TradeStation => "tradestation",
        }
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Venue {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Venue::ALL
            .into_iter()
            .find(|v| v.as_str() == wanted)
            .ok_or_else(|| FeedError::Config(format!("unknown venue: {}", s)))
    }
}

/// What a session needs to open a stream. Token acquisition/refresh happens elsewhere.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
}

impl Credential {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self { access_token: access_token.into() }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential").field("access_token", &"<redacted>").finish()
    }
}

/// One decoded wire event, already translated to canonical symbols.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketUpdate {
    TickerQuote { symbol: String, quote: QuoteFields, ts: i64 },
    TickerTrade { symbol: String, price: f64, size: u64, day_volume: Option<u64>, ts: i64 },
    OptionQuote { symbol: String, quote: QuoteFields, ts: i64 },
    OptionTrade { symbol: String, price: f64, size: u64, day_volume: Option<u64>, ts: i64 },
    /// Trade with the quote in force at the time. Missing sides are filled from the cache.
    OptionTimesale { symbol: String, price: f64, size: u64, bid: Option<f64>, ask: Option<f64>, ts: i64 },
    OptionStats { symbol: String, stats: OptionStats, ts: i64 },
}

/// Capability set every venue implements. The router only ever holds a
/// `Box<dyn VenueSession>`.
#[async_trait]
pub trait VenueSession: Send + Sync {
    fn venue(&self) -> Venue;

    /// Authenticate, open the stream and replay any recorded subscriptions.
    async fn connect(&mut self) -> FeedResult<()>;

    /// Idempotent. Releases the connection, subscriptions and ephemeral credentials.
    async fn disconnect(&mut self);

    async fn subscribe(&mut self, tickers: &[String], options: &[String]) -> FeedResult<()>;

    async fn unsubscribe(&mut self, tickers: &[String], options: &[String]) -> FeedResult<()>;

    /// REST backfill of base open interest. Returns how many base values were accepted.
    async fn fetch_open_interest(&self, options: &[String]) -> FeedResult<usize>;

    fn core(&self) -> &SessionCore;

    fn is_connected(&self) -> bool {
        self.core().is_connected()
    }

    fn state(&self) -> VenueSessionState {
        self.core().state()
    }

    fn get_ticker(&self, symbol: &str) -> Option<NormalizedTicker> {
        self.core().cache().read().ticker(symbol).cloned()
    }

    fn get_option(&self, symbol: &str) -> Option<NormalizedOption> {
        self.core().cache().read().option(symbol).cloned()
    }

    fn get_all_tickers(&self) -> Vec<NormalizedTicker> {
        self.core().cache().read().tickers()
    }

    fn get_all_options(&self) -> Vec<NormalizedOption> {
        self.core().cache().read().options()
    }

    fn subscribed_tickers(&self) -> Vec<String> {
        self.core().subscribed_tickers()
    }

    fn subscribed_options(&self) -> Vec<String> {
        self.core().subscribed_options()
    }
}

/// Shared shape of every REST snapshot used for open-interest backfill.
#[async_trait]
pub trait OpenInterestSource: Send + Sync {
    /// `options` are canonical; results are canonical too.
    async fn fetch(&self, http: &reqwest::Client, options: &[String]) -> FeedResult<Vec<(String, u64)>>;
}

pub fn build_session(venue: Venue, credential: Credential, config: &FeedConfig, bus: Arc<EventBus>) -> Box<dyn VenueSession> {
    match venue {
        Venue::Tradier => Box::new(tradier::session(credential, config, bus)),
        Venue::Tastytrade => Box::new(tastytrade::session(credential, config, bus)),
        Venue::Schwab => Box::new(schwab::session(credential, config, bus)),
        Venue::Webull => Box::new(webull::session(credential, config, bus)),
        Venue::TradeStation => Box::new(tradestation::TradeStationSession::new(credential, config, bus)),
    }
}

/// Reject a non-2xx REST response, mapping 401/403 to an auth failure.
pub(crate) async fn check_status(res: reqwest::Response) -> FeedResult<reqwest::Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    Err(FeedError::from_status(status.as_u16(), body))
}

pub(crate) fn bearer(credential: &Credential) -> String {
    format!("Bearer {}", credential.access_token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_venue_parse() {
        assert_eq!("Tradier".parse::<Venue>().unwrap(), Venue::Tradier);
        assert_eq!(" tradestation ".parse::<Venue>().unwrap(), Venue::TradeStation);
        assert!("robinhood".parse::<Venue>().is_err());
        for v in Venue::ALL {
            assert_eq!(v.to_string().parse::<Venue>().unwrap(), v);
        }
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let c = Credential::new("secret-token");
        assert!(!format!("{:?}", c).contains("secret"));
    }
}
