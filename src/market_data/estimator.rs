//! Trade-vs-quote aggressor classification and the open-interest delta heuristic.
//!
//! The mapping from aggressor side to an open-interest change is an approximation.
//! A buyer lifting the offer is assumed more likely to open a long contract, and a
//! seller hitting the bid more likely to close one or open a short. Nothing here is
//! verified against the clearing venue's end-of-day figures, which is why the mapping
//! sits behind [`OiDeltaStrategy`].

use crate::market_data::types::AggressorSide;

/// Relative tolerance applied to the spread when comparing a print to the quote.
const SPREAD_TOLERANCE: f64 = 0.001;
/// Absolute tolerance used when the spread is zero or crossed.
const FLAT_TOLERANCE: f64 = 0.001;

/// Classify a print against the NBBO in force when it happened.
///
/// `price >= ask - tol` is a buy, `price <= bid + tol` is a sell, everything
/// in between (mid-market, internalized) is unknown. A side that is not quoted
/// (zero or negative) never matches.
pub fn classify_aggressor(price: f64, bid: f64, ask: f64) -> AggressorSide {
    let spread = ask - bid;
    let tolerance = if spread > 0.0 { spread * SPREAD_TOLERANCE } else { FLAT_TOLERANCE };

    if ask > 0.0 && price >= ask - tolerance {
        AggressorSide::Buy
    } else if bid > 0.0 && price <= bid + tolerance {
        AggressorSide::Sell
    } else {
        AggressorSide::Unknown
    }
}

/// Maps a classified trade onto an open-interest delta.
pub trait OiDeltaStrategy: Send + Sync {
    fn oi_delta(&self, side: AggressorSide, size: u64) -> i64;
}

/// Buy aggressor opens (+size), sell aggressor closes (-size), unknown is neutral.
#[derive(Debug, Default, Clone, Copy)]
pub struct AggressorOiHeuristic;

impl OiDeltaStrategy for AggressorOiHeuristic {
    fn oi_delta(&self, side: AggressorSide, size: u64) -> i64 {
        let size = i64::try_from(size).unwrap_or(i64::MAX);
        match side {
            AggressorSide::Buy => size,
            AggressorSide::Sell => -size,
            AggressorSide::Unknown => 0,
        }
    }
}

/// Ignores flow entirely; live open interest stays at the base snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOiChange;

impl OiDeltaStrategy for NoOiChange {
    fn oi_delta(&self, _side: AggressorSide, _size: u64) -> i64 {
        0
    }
}

/// `max(0, base + cumulative)`.
pub fn live_open_interest(base: u64, cumulative_delta: i64) -> u64 {
    let live = i128::from(base) + i128::from(cumulative_delta);
    if live <= 0 { 0 } else { u64::try_from(live).unwrap_or(u64::MAX) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_classify_at_the_quote() {
        assert_eq!(classify_aggressor(10.20, 10.00, 10.20), AggressorSide::Buy);
        assert_eq!(classify_aggressor(10.00, 10.00, 10.20), AggressorSide::Sell);
        assert_eq!(classify_aggressor(10.10, 10.00, 10.20), AggressorSide::Unknown);
    }

    #[test]
    fn test_classify_within_tolerance() {
        // spread 0.20 -> tolerance 0.0002
        assert_eq!(classify_aggressor(10.1999, 10.00, 10.20), AggressorSide::Buy);
        assert_eq!(classify_aggressor(10.0001, 10.00, 10.20), AggressorSide::Sell);
        assert_eq!(classify_aggressor(10.1990, 10.00, 10.20), AggressorSide::Unknown);
    }

    #[test]
    fn test_classify_outside_quote() {
        assert_eq!(classify_aggressor(10.50, 10.00, 10.20), AggressorSide::Buy);
        assert_eq!(classify_aggressor(9.50, 10.00, 10.20), AggressorSide::Sell);
    }

    #[test]
    fn test_classify_missing_sides() {
        assert_eq!(classify_aggressor(1.0, 0.0, 0.0), AggressorSide::Unknown);
        assert_eq!(classify_aggressor(1.0, 0.0, 1.0), AggressorSide::Buy);
        assert_eq!(classify_aggressor(0.9, 0.9, 0.0), AggressorSide::Sell);
        // Locked market: buy wins
        assert_eq!(classify_aggressor(5.0, 5.0, 5.0), AggressorSide::Buy);
    }

    #[test]
    fn test_heuristic_deltas() {
        let h = AggressorOiHeuristic;
        assert_eq!(h.oi_delta(AggressorSide::Buy, 3), 3);
        assert_eq!(h.oi_delta(AggressorSide::Sell, 3), -3);
        assert_eq!(h.oi_delta(AggressorSide::Unknown, 3), 0);
        assert_eq!(NoOiChange.oi_delta(AggressorSide::Buy, 3), 0);
    }

    #[test]
    fn test_live_open_interest_floor() {
        assert_eq!(live_open_interest(150, 10), 160);
        assert_eq!(live_open_interest(150, -10), 140);
        assert_eq!(live_open_interest(5, -10), 0);
        assert_eq!(live_open_interest(0, 0), 0);
    }

    proptest! {
        #[test]
        fn prop_at_or_through_the_offer_is_buy(bid in 0.01f64..500.0, width in 0.01f64..5.0, over in 0.0f64..5.0) {
            let ask = bid + width;
            prop_assert_eq!(classify_aggressor(ask + over, bid, ask), AggressorSide::Buy);
        }

        #[test]
        fn prop_at_or_through_the_bid_is_sell(bid in 0.01f64..500.0, width in 0.01f64..5.0, under in 0.0f64..0.01) {
            let ask = bid + width;
            prop_assert_eq!(classify_aggressor(bid - under, bid, ask), AggressorSide::Sell);
        }
    }
}
