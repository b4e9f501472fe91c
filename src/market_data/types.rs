// Normalized event model shared by every venue.
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    pub fn flag(self) -> char {
        match self {
            OptionType::Call => 'C',
            OptionType::Put => 'P',
        }
    }

    pub fn from_flag(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'C' => Some(OptionType::Call),
            'P' => Some(OptionType::Put),
            _ => None,
        }
    }
}

/// Which party crossed the spread to cause a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggressorSide {
    Buy,
    Sell,
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTicker {
    pub symbol: String,
    /// Mid when both sides are quoted, otherwise last.
    pub spot: f64,
    pub bid: f64,
    pub bid_size: u64,
    pub ask: f64,
    pub ask_size: u64,
    pub last: f64,
    pub volume: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedOption {
    /// Canonical OCC form, e.g. `SPY240119C00500000`.
    pub symbol: String,
    pub underlying: String,
    pub strike: f64,
    pub expiration: NaiveDate,
    /// Expiration date at 00:00 UTC in epoch milliseconds.
    pub expiration_ms: i64,
    pub option_type: OptionType,
    pub bid: f64,
    pub bid_size: u64,
    pub ask: f64,
    pub ask_size: u64,
    pub mark: f64,
    pub last: f64,
    pub volume: u64,
    /// Open interest as last reported by the venue.
    pub open_interest: u64,
    /// Intraday estimate: `max(0, base + cumulative delta)`.
    pub live_open_interest: u64,
    pub implied_volatility: Option<f64>,
    pub timestamp: i64,
}

/// One classified trade. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntradayTrade {
    pub symbol: String,
    pub price: f64,
    pub size: u64,
    pub bid: f64,
    pub ask: f64,
    pub aggressor: AggressorSide,
    pub timestamp: i64,
    pub estimated_oi_change: i64,
}

/// Derived view over a trade log, computed on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowSummary {
    pub buy_volume: u64,
    pub sell_volume: u64,
    pub unknown_volume: u64,
    pub net_oi_change: i64,
    pub trade_count: usize,
}

impl FlowSummary {
    pub fn from_trades<'a>(trades: impl IntoIterator<Item = &'a IntradayTrade>) -> Self {
        let mut summary = FlowSummary::default();
        for t in trades {
            match t.aggressor {
                AggressorSide::Buy => summary.buy_volume += t.size,
                AggressorSide::Sell => summary.sell_volume += t.size,
                AggressorSide::Unknown => summary.unknown_volume += t.size,
            }
            summary.net_oi_change += t.estimated_oi_change;
            summary.trade_count += 1;
        }
        summary
    }

    pub fn total_volume(&self) -> u64 {
        self.buy_volume + self.sell_volume + self.unknown_volume
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Authenticated,
    Streaming,
    Reconnecting,
}

/// Snapshot of a session's connection state, as seen from outside the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueSessionState {
    pub status: ConnectionStatus,
    pub subscribed_tickers: Vec<String>,
    pub subscribed_options: Vec<String>,
    pub reconnect_attempts: u32,
}

impl VenueSessionState {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Streaming
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(aggressor: AggressorSide, size: u64, delta: i64) -> IntradayTrade {
        IntradayTrade {
            symbol: "SPY240119C00500000".into(),
            price: 1.0,
            size,
            bid: 0.9,
            ask: 1.0,
            aggressor,
            timestamp: 0,
            estimated_oi_change: delta,
        }
    }

    #[test]
    fn test_flow_summary() {
        let trades = vec![
            trade(AggressorSide::Buy, 5, 5),
            trade(AggressorSide::Sell, 2, -2),
            trade(AggressorSide::Unknown, 7, 0),
            trade(AggressorSide::Buy, 1, 1),
        ];
        let s = FlowSummary::from_trades(&trades);
        assert_eq!(s.buy_volume, 6);
        assert_eq!(s.sell_volume, 2);
        assert_eq!(s.unknown_volume, 7);
        assert_eq!(s.net_oi_change, 4);
        assert_eq!(s.trade_count, 4);
        assert_eq!(s.total_volume(), 15);
    }

    #[test]
    fn test_option_type_flags() {
        assert_eq!(OptionType::from_flag('c'), Some(OptionType::Call));
        assert_eq!(OptionType::from_flag('P'), Some(OptionType::Put));
        assert_eq!(OptionType::from_flag('X'), None);
        assert_eq!(OptionType::Put.flag(), 'P');
    }
}
