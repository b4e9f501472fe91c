//! Runtime configuration.
//!
//! Layers, lowest precedence first: built-in defaults, an optional file
//! (TOML/YAML/JSON by extension), then `OPTFEED__...` environment variables
//! (`OPTFEED__RECONNECT__MAX_ATTEMPTS=8`). `.env` is loaded first if present.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::FeedError;
use crate::telemetry::LogFormat;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeedConfig {
    pub reconnect: ReconnectConfig,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub keepalive_secs: u64,
    /// Max symbols per TradeStation quote stream.
    pub tradestation_group_size: usize,
    pub endpoints: VenueEndpoints,
    pub log_format: LogFormat,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 15_000,
            keepalive_secs: 30,
            tradestation_group_size: 100,
            endpoints: VenueEndpoints::default(),
            log_format: LogFormat::default(),
        }
    }
}

impl FeedConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, FeedError> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("OPTFEED")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize::<FeedConfig>())
            .map_err(|e| FeedError::Config(e.to_string()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self { base_delay_ms: 1_000, max_attempts: 5 }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct VenueEndpoints {
    pub tradier_api: String,
    pub tradier_ws: String,
    pub tastytrade_api: String,
    pub schwab_api: String,
    pub webull_api: String,
    pub webull_ws: String,
    pub tradestation_api: String,
}

impl Default for VenueEndpoints {
    fn default() -> Self {
        Self {
            tradier_api: "https://api.tradier.com".into(),
            tradier_ws: "wss://ws.tradier.com/v1/markets/events".into(),
            tastytrade_api: "https://api.tastyworks.com".into(),
            schwab_api: "https://api.schwabapi.com".into(),
            webull_api: "https://api.webull.com/openapi".into(),
            webull_ws: "wss://quotes-api.webull.com/ws".into(),
            tradestation_api: "https://api.tradestation.com".into(),
        }
    }
}
