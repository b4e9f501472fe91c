// Source: https://api.tradestation.com/docs/specification (MarketData v3)
use serde::Deserialize;
use serde_json::Value;

// GET /v3/marketdata/quotes/{symbols}
#[derive(Debug, Deserialize)]
pub struct QuoteSnapshot {
    #[serde(rename = "Quotes", default)]
    pub quotes: Vec<SnapshotQuote>,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotQuote {
    #[serde(rename = "Symbol")]
    pub symbol: String,
    #[serde(rename = "DailyOpenInterest", default)]
    pub daily_open_interest: Value,
}

// Streamed line fields. Numbers arrive as strings.
pub const SYMBOL: &str = "Symbol";
pub const BID: &str = "Bid";
pub const BID_SIZE: &str = "BidSize";
pub const ASK: &str = "Ask";
pub const ASK_SIZE: &str = "AskSize";
pub const LAST: &str = "Last";
pub const VOLUME: &str = "Volume";
pub const TRADE_TIME: &str = "TradeTime";
pub const OPEN_INTEREST: &str = "DailyOpenInterest";
pub const IMPLIED_VOLATILITY: &str = "ImpliedVolatility";

// Control lines
pub const HEARTBEAT: &str = "Heartbeat";
pub const STREAM_STATUS: &str = "StreamStatus";
pub const END_SNAPSHOT: &str = "EndSnapshot";
pub const GO_AWAY: &str = "GoAway";
pub const ERROR: &str = "Error";
pub const MESSAGE: &str = "Message";
