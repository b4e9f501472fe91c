//! Option symbol translation between the canonical OCC form and venue-native forms.
//!
//! Canonical: `ROOT + YYMMDD + {C|P} + 8-digit strike x1000`, no padding,
//! e.g. `SPY240119C00500000`. Native forms:
//!
//! | Venue        | Example                  |
//! |--------------|--------------------------|
//! | Tradier      | `SPY240119C00500000`     |
//! | Webull       | `SPY240119C00500000`     |
//! | Schwab       | `SPY   240119C00500000`  |
//! | Tastytrade   | `.SPY240119C500`         |
//! | TradeStation | `SPY 240119C500`         |

use std::fmt;

use chrono::{Datelike, NaiveDate};

use crate::error::FeedError;
use crate::market_data::adapters::Venue;
use crate::market_data::normaliser::Normaliser;
use crate::market_data::types::OptionType;

const STRIKE_SCALE: i64 = 1_000;
const MAX_STRIKE_MILLI: u64 = 99_999_999;
const MAX_ROOT_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OccSymbol {
    pub root: String,
    pub expiration: NaiveDate,
    pub option_type: OptionType,
    /// Strike x1000.
    pub strike_milli: u64,
}

impl OccSymbol {
    pub fn new(root: &str, expiration: NaiveDate, option_type: OptionType, strike: f64) -> Result<Self, FeedError> {
        let strike_milli = (strike * STRIKE_SCALE as f64).round();
        if !(0.0..=MAX_STRIKE_MILLI as f64).contains(&strike_milli) {
            return Err(FeedError::Symbol(format!("strike out of range: {}", strike)));
        }
        let root = validate_root(root)?;
        Ok(Self { root, expiration, option_type, strike_milli: strike_milli as u64 })
    }

    /// Parse the canonical form. Incidental whitespace anywhere is ignored, so the
    /// space-padded variant parses too.
    pub fn parse(s: &str) -> Result<Self, FeedError> {
        let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = compact.as_bytes();
        if bytes.len() < 16 || !compact.is_ascii() {
            return Err(FeedError::Symbol(format!("not an OCC symbol: {:?}", s)));
        }
        let split = bytes.len() - 15;
        let (root, tail) = compact.split_at(split);
        let date = parse_yymmdd(&tail[..6]).ok_or_else(|| FeedError::Symbol(format!("bad expiration in {:?}", s)))?;
        let option_type = tail[6..7]
            .chars()
            .next()
            .and_then(OptionType::from_flag)
            .ok_or_else(|| FeedError::Symbol(format!("bad option type in {:?}", s)))?;
        let strike_digits = &tail[7..];
        if !strike_digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(FeedError::Symbol(format!("bad strike in {:?}", s)));
        }
        let strike_milli: u64 = strike_digits.parse().map_err(|_| FeedError::Symbol(format!("bad strike in {:?}", s)))?;
        Ok(Self { root: validate_root(root)?, expiration: date, option_type, strike_milli })
    }

    pub fn strike(&self) -> f64 {
        self.strike_milli as f64 / STRIKE_SCALE as f64
    }

    pub fn expiration_ms(&self) -> i64 {
        self.expiration
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis())
            .unwrap_or_default()
    }

    fn yymmdd(&self) -> String {
        format!("{:02}{:02}{:02}", self.expiration.year() % 100, self.expiration.month(), self.expiration.day())
    }

    /// Strike without scaling or padding: `500`, `502.5`.
    fn unscaled_strike(&self) -> String {
        Normaliser::new(STRIKE_SCALE).ticks_to_string(self.strike_milli as i64)
    }

    /// Parse `ROOT`, `YYMMDD`, flag and an unscaled strike laid out back to back
    /// (`SPY240119C502.5`). The root is whatever precedes the date.
    fn parse_unscaled(s: &str) -> Result<Self, FeedError> {
        let err = || FeedError::Symbol(format!("not an unscaled option symbol: {:?}", s));
        let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        if !compact.is_ascii() {
            return Err(err());
        }
        let strike_start = compact
            .char_indices()
            .rev()
            .take_while(|(_, c)| c.is_ascii_digit() || *c == '.')
            .last()
            .map(|(i, _)| i)
            .ok_or_else(err)?;
        if strike_start < 8 {
            return Err(err());
        }
        let flag_pos = strike_start - 1;
        let option_type = OptionType::from_flag(compact.as_bytes()[flag_pos] as char).ok_or_else(err)?;
        let date = parse_yymmdd(&compact[flag_pos - 6..flag_pos]).ok_or_else(err)?;
        let root = &compact[..flag_pos - 6];
        let strike_milli = Normaliser::new(STRIKE_SCALE).price_to_ticks(&compact[strike_start..]).ok_or_else(err)?;
        if strike_milli as u64 > MAX_STRIKE_MILLI {
            return Err(err());
        }
        Ok(Self { root: validate_root(root)?, expiration: date, option_type, strike_milli: strike_milli as u64 })
    }
}

impl fmt::Display for OccSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}{:08}", self.root, self.yymmdd(), self.option_type.flag(), self.strike_milli)
    }
}

fn validate_root(root: &str) -> Result<String, FeedError> {
    let root = root.trim();
    if root.is_empty() || root.len() > MAX_ROOT_LEN || !root.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(FeedError::Symbol(format!("bad option root: {:?}", root)));
    }
    Ok(root.to_ascii_uppercase())
}

fn parse_yymmdd(s: &str) -> Option<NaiveDate> {
    if s.len() != 6 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let yy: i32 = s[0..2].parse().ok()?;
    let mm: u32 = s[2..4].parse().ok()?;
    let dd: u32 = s[4..6].parse().ok()?;
    NaiveDate::from_ymd_opt(2000 + yy, mm, dd)
}

/// Bidirectional mapping between canonical and one venue's native form.
pub trait SymbolCodec: Send + Sync {
    fn to_canonical(&self, native: &str) -> Result<OccSymbol, FeedError>;
    fn to_native(&self, occ: &OccSymbol) -> String;

    fn canonical_to_native(&self, canonical: &str) -> Result<String, FeedError> {
        Ok(self.to_native(&OccSymbol::parse(canonical)?))
    }

    fn native_to_canonical(&self, native: &str) -> Result<String, FeedError> {
        Ok(self.to_canonical(native)?.to_string())
    }
}

/// Plain OCC, no padding.
pub struct OccCodec;

impl SymbolCodec for OccCodec {
    fn to_canonical(&self, native: &str) -> Result<OccSymbol, FeedError> {
        OccSymbol::parse(native)
    }

    fn to_native(&self, occ: &OccSymbol) -> String {
        occ.to_string()
    }
}

/// OCC with the root space-padded to six characters.
pub struct PaddedOccCodec;

impl SymbolCodec for PaddedOccCodec {
    fn to_canonical(&self, native: &str) -> Result<OccSymbol, FeedError> {
        OccSymbol::parse(native)
    }

    fn to_native(&self, occ: &OccSymbol) -> String {
        format!(
            "{:<width$}{}{}{:08}",
            occ.root,
            occ.yymmdd(),
            occ.option_type.flag(),
            occ.strike_milli,
            width = MAX_ROOT_LEN
        )
    }
}

/// dxFeed streamer symbols: leading dot, unscaled strike.
pub struct StreamerCodec;

impl SymbolCodec for StreamerCodec {
    fn to_canonical(&self, native: &str) -> Result<OccSymbol, FeedError> {
        let trimmed = native.trim();
        let body = trimmed
            .strip_prefix('.')
            .ok_or_else(|| FeedError::Symbol(format!("streamer option symbol must start with '.': {:?}", native)))?;
        OccSymbol::parse_unscaled(body)
    }

    fn to_native(&self, occ: &OccSymbol) -> String {
        format!(".{}{}{}{}", occ.root, occ.yymmdd(), occ.option_type.flag(), occ.unscaled_strike())
    }
}

/// `ROOT YYMMDD{C|P}STRIKE` with a single space and an unscaled strike.
pub struct SpacedCodec;

impl SymbolCodec for SpacedCodec {
    fn to_canonical(&self, native: &str) -> Result<OccSymbol, FeedError> {
        OccSymbol::parse_unscaled(native)
    }

    fn to_native(&self, occ: &OccSymbol) -> String {
        format!("{} {}{}{}", occ.root, occ.yymmdd(), occ.option_type.flag(), occ.unscaled_strike())
    }
}

pub fn codec_for(venue: Venue) -> &'static dyn SymbolCodec {
    match venue {
        Venue::Tradier | Venue::Webull => &OccCodec,
        Venue::Schwab => &PaddedOccCodec,
        Venue::Tastytrade => &StreamerCodec,
        Venue::TradeStation => &SpacedCodec,
    }
}

/// Normalize a ticker symbol as typed by a caller.
pub fn normalize_ticker(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}

/// Normalize a canonical option symbol as typed by a caller.
pub fn normalize_option(symbol: &str) -> Result<String, FeedError> {
    Ok(OccSymbol::parse(symbol)?.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL_VENUES: [Venue; 5] = [Venue::Tradier, Venue::Tastytrade, Venue::Schwab, Venue::Webull, Venue::TradeStation];

    #[test]
    fn test_parse_canonical() {
        let occ = OccSymbol::parse("SPY240119C00500000").unwrap();
        assert_eq!(occ.root, "SPY");
        assert_eq!(occ.expiration, NaiveDate::from_ymd_opt(2024, 1, 19).unwrap());
        assert_eq!(occ.option_type, OptionType::Call);
        assert_eq!(occ.strike(), 500.0);
        assert_eq!(occ.expiration_ms(), 1_705_622_400_000);
    }

    #[test]
    fn test_parse_tolerates_whitespace() {
        let padded = OccSymbol::parse("SPY   240119P00502500 ").unwrap();
        assert_eq!(padded.to_string(), "SPY240119P00502500");
        assert_eq!(padded.strike(), 502.5);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(OccSymbol::parse("SPY").is_err());
        assert!(OccSymbol::parse("SPY241319C00500000").is_err()); // month 13
        assert!(OccSymbol::parse("SPY240119X00500000").is_err());
        assert!(OccSymbol::parse("SPY240119C0050000A").is_err());
        assert!(OccSymbol::parse("TOOLONGR240119C00500000").is_err());
    }

    #[test]
    fn test_native_forms() {
        let occ = OccSymbol::parse("SPY240119C00502500").unwrap();
        assert_eq!(codec_for(Venue::Tradier).to_native(&occ), "SPY240119C00502500");
        assert_eq!(codec_for(Venue::Schwab).to_native(&occ), "SPY   240119C00502500");
        assert_eq!(codec_for(Venue::Tastytrade).to_native(&occ), ".SPY240119C502.5");
        assert_eq!(codec_for(Venue::TradeStation).to_native(&occ), "SPY 240119C502.5");
    }

    #[test]
    fn test_streamer_symbols() {
        let c = codec_for(Venue::Tastytrade);
        assert_eq!(c.native_to_canonical(".SPXW240119P4700").unwrap(), "SPXW240119P04700000");
        assert_eq!(c.native_to_canonical(" .AAPL240216C187.5").unwrap(), "AAPL240216C00187500");
        // Equity streamer symbols are not options
        assert!(c.to_canonical("SPY").is_err());
        assert!(c.to_canonical(".SPY").is_err());
    }

    #[test]
    fn test_spaced_symbols() {
        let c = codec_for(Venue::TradeStation);
        assert_eq!(c.native_to_canonical("MSFT 240315P400").unwrap(), "MSFT240315P00400000");
        assert!(c.to_canonical("MSFT").is_err());
    }

    #[test]
    fn test_normalize_helpers() {
        assert_eq!(normalize_ticker(" spy "), "SPY");
        assert_eq!(normalize_option("spy240119c00500000").unwrap(), "SPY240119C00500000");
    }

    fn canonical_symbol() -> impl Strategy<Value = String> {
        ("[A-Z]{1,5}", 24u32..40, 1u32..=12, 1u32..=28, any::<bool>(), 1u64..=MAX_STRIKE_MILLI).prop_map(
            |(root, yy, mm, dd, call, strike)| {
                format!("{}{:02}{:02}{:02}{}{:08}", root, yy, mm, dd, if call { 'C' } else { 'P' }, strike)
            },
        )
    }

    proptest! {
        #[test]
        fn prop_round_trip_all_venues(s in canonical_symbol()) {
            for venue in ALL_VENUES {
                let codec = codec_for(venue);
                let native = codec.canonical_to_native(&s).unwrap();
                prop_assert_eq!(codec.native_to_canonical(&native).unwrap(), s.clone());
                // Rendering is idempotent
                let again = codec.canonical_to_native(&codec.native_to_canonical(&native).unwrap()).unwrap();
                prop_assert_eq!(again, native);
            }
        }
    }
}
