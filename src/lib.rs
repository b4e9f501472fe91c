pub mod config;
pub mod error;
pub mod market_data;
pub mod telemetry;

pub use config::FeedConfig;
pub use error::{FeedError, FeedResult};
pub use market_data::adapters::{Credential, Venue, VenueSession};
pub use market_data::events::{EventKind, FeedEvent, ListenerHandle};
pub use market_data::router::FeedRouter;
pub use market_data::types::{
    AggressorSide, ConnectionStatus, FlowSummary, IntradayTrade, NormalizedOption, NormalizedTicker, OptionType,
    VenueSessionState,
};
