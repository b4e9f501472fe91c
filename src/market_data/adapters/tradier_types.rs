// Source: https://documentation.tradier.com/brokerage-api/streaming/wss-market-websocket
use serde::Deserialize;

// POST /v1/markets/events/session
#[derive(Debug, Deserialize)]
pub struct StreamSessionResponse {
    pub stream: StreamSession,
}

#[derive(Debug, Deserialize)]
pub struct StreamSession {
    pub url: String,
    pub sessionid: String,
}

// GET /v1/markets/quotes -> {"quotes": {"quote": {...} | [...]}}
#[derive(Debug, Deserialize)]
pub struct QuotesResponse {
    pub quotes: Option<QuotesBody>,
}

#[derive(Debug, Deserialize)]
pub struct QuotesBody {
    #[serde(default)]
    pub quote: Option<OneOrMany<RestQuote>>,
}

/// Tradier returns a bare object when the request names a single symbol.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(t) => vec![t],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RestQuote {
    pub symbol: String,
    #[serde(default)]
    pub open_interest: Option<u64>,
}
