// Webull OpenAPI quotes socket
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame<'a> {
    Auth { token: &'a str },
    Subscribe { symbols: Vec<String>, channels: [&'static str; 2] },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Auth {
        status: String,
        #[serde(default)]
        message: Option<String>,
    },
    Quote(WireQuote),
    Trade(WireTrade),
    Subscribed {
        #[serde(default)]
        symbols: Vec<String>,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    Heartbeat {},
}

#[derive(Debug, Deserialize)]
pub struct WireQuote {
    pub symbol: String,
    #[serde(default)]
    pub bid: Value,
    #[serde(default)]
    pub bid_size: Value,
    #[serde(default)]
    pub ask: Value,
    #[serde(default)]
    pub ask_size: Value,
    #[serde(default)]
    pub timestamp: Value,
}

#[derive(Debug, Deserialize)]
pub struct WireTrade {
    pub symbol: String,
    pub price: Value,
    #[serde(default)]
    pub size: Value,
    #[serde(default)]
    pub volume: Value,
    #[serde(default)]
    pub timestamp: Value,
}

// GET /market-data/options/snapshot
#[derive(Debug, Deserialize)]
pub struct OptionSnapshot {
    pub symbol: String,
    #[serde(default)]
    pub open_interest: Value,
}
