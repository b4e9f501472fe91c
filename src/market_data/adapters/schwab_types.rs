// Source: Schwab Trader API, "Streamer API" section
use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

// GET /trader/v1/userPreference
#[derive(Debug, Deserialize)]
pub struct UserPreference {
    #[serde(rename = "streamerInfo", default)]
    pub streamer_info: Vec<StreamerInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamerInfo {
    pub streamer_socket_url: String,
    pub schwab_client_customer_id: String,
    pub schwab_client_correl_id: String,
    pub schwab_client_channel: String,
    pub schwab_client_function_id: String,
}

// GET /marketdata/v1/quotes -> { "<symbol>": { "quote": {...} } }
pub type QuotesResponse = HashMap<String, QuoteEntry>;

#[derive(Debug, Deserialize)]
pub struct QuoteEntry {
    #[serde(default)]
    pub quote: Value,
}

pub const SERVICE_EQUITIES: &str = "LEVELONE_EQUITIES";
pub const SERVICE_OPTIONS: &str = "LEVELONE_OPTIONS";
pub const SERVICE_BOOK: &str = "OPTIONS_BOOK";

// Numeric field ids requested per service
pub const EQUITY_FIELDS: &str = "0,1,2,3,4,5,8,9,34,35";
pub const OPTION_FIELDS: &str = "0,2,3,4,8,9,10,16,17,18,37,38,39";
pub const BOOK_FIELDS: &str = "0,1,2,3";

pub mod equity {
    pub const BID: &str = "1";
    pub const ASK: &str = "2";
    pub const LAST: &str = "3";
    pub const BID_SIZE: &str = "4";
    pub const ASK_SIZE: &str = "5";
    pub const TOTAL_VOLUME: &str = "8";
    pub const LAST_SIZE: &str = "9";
    pub const QUOTE_TIME: &str = "34";
    pub const TRADE_TIME: &str = "35";
}

pub mod option {
    pub const BID: &str = "2";
    pub const ASK: &str = "3";
    pub const LAST: &str = "4";
    pub const TOTAL_VOLUME: &str = "8";
    pub const OPEN_INTEREST: &str = "9";
    pub const VOLATILITY: &str = "10";
    pub const BID_SIZE: &str = "16";
    pub const ASK_SIZE: &str = "17";
    pub const MARK: &str = "37";
    pub const QUOTE_TIME: &str = "38";
    pub const TRADE_TIME: &str = "39";
}

// OPTIONS_BOOK: "2" bids, "3" asks; each level {"0": price, "1": aggregate size, ...}
pub mod book {
    pub const BIDS: &str = "2";
    pub const ASKS: &str = "3";
    pub const PRICE: &str = "0";
    pub const SIZE: &str = "1";
}
