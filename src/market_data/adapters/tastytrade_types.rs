// Source: https://developer.tastytrade.com/streaming-market-data/ (DXLink)
use serde::Deserialize;
use serde_json::Value;

// GET /api-quote-tokens
#[derive(Debug, Deserialize)]
pub struct QuoteTokenResponse {
    pub data: QuoteToken,
}

#[derive(Debug, Deserialize)]
pub struct QuoteToken {
    pub token: String,
    #[serde(rename = "dxlink-url")]
    pub dxlink_url: String,
}

// GET /market-data/by-type?equity-option=..
#[derive(Debug, Deserialize)]
pub struct MarketDataResponse {
    pub data: MarketDataItems,
}

#[derive(Debug, Deserialize)]
pub struct MarketDataItems {
    #[serde(default)]
    pub items: Vec<MarketDataItem>,
}

#[derive(Debug, Deserialize)]
pub struct MarketDataItem {
    pub symbol: String,
    // number or numeric string depending on the endpoint version
    #[serde(rename = "open-interest", default)]
    pub open_interest: Value,
}

// Fields requested per event type in FEED_SETUP. The server's FEED_CONFIG
// answer is authoritative and replaces these.
pub const QUOTE_FIELDS: &[&str] = &["eventType", "eventSymbol", "bidPrice", "askPrice", "bidSize", "askSize"];
pub const TRADE_FIELDS: &[&str] = &["eventType", "eventSymbol", "price", "size", "dayVolume", "time"];
pub const TIME_AND_SALE_FIELDS: &[&str] =
    &["eventType", "eventSymbol", "price", "size", "bidPrice", "askPrice", "time"];
pub const SUMMARY_FIELDS: &[&str] = &["eventType", "eventSymbol", "openInterest", "prevDayClosePrice"];
pub const GREEKS_FIELDS: &[&str] = &["eventType", "eventSymbol", "volatility"];

pub const TICKER_EVENTS: &[&str] = &["Quote", "Trade"];
pub const OPTION_EVENTS: &[&str] = &["Quote", "TimeAndSale", "Summary", "Greeks"];
