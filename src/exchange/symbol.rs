//! Canonical symbol normalization across venue formats.
//!
//! Venues disagree on pair syntax (`BTCUSDT`, `BTC-USD`, `BTC/USD`); all
//! cross-venue matching happens on the canonical base/quote form produced
//! here. `normalize` and `denormalize` are pure inverses per venue.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::registry::VenueId;

/// Quote assets recognized when splitting concatenated symbols, longest first
/// so "BTCUSDT" resolves to USDT rather than USD.
const KNOWN_QUOTES: &[&str] = &[
    "USDT", "USDC", "BUSD", "TUSD", "USD", "EUR", "BTC", "ETH", "BNB",
];

/// Errors from symbol parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SymbolError {
    #[error("empty symbol")]
    Empty,
    #[error("symbol '{0}' is missing the '{1}' separator")]
    MissingSeparator(String, char),
    #[error("symbol '{0}' does not end in a known quote asset")]
    UnknownQuote(String),
}

/// A canonical base/quote trading pair (e.g. BTC/USDT).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SymbolPair {
    pub base: String,
    pub quote: String,
}

impl SymbolPair {
    /// Create a pair, uppercasing both sides.
    pub fn new(base: &str, quote: &str) -> Self {
        Self {
            base: base.to_ascii_uppercase(),
            quote: quote.to_ascii_uppercase(),
        }
    }
}

impl fmt::Display for SymbolPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl FromStr for SymbolPair {
    type Err = SymbolError;

    fn from_str(s: &str) -> Result<Self, SymbolError> {
        if s.is_empty() {
            return Err(SymbolError::Empty);
        }
        let (base, quote) = s
            .split_once('/')
            .ok_or_else(|| SymbolError::MissingSeparator(s.to_string(), '/'))?;
        if base.is_empty() || quote.is_empty() {
            return Err(SymbolError::Empty);
        }
        Ok(SymbolPair::new(base, quote))
    }
}

impl TryFrom<String> for SymbolPair {
    type Error = SymbolError;

    fn try_from(s: String) -> Result<Self, SymbolError> {
        s.parse()
    }
}

impl From<SymbolPair> for String {
    fn from(pair: SymbolPair) -> Self {
        pair.to_string()
    }
}

/// Parse a venue-native symbol into its canonical base/quote pair.
pub fn normalize(raw: &str, venue: VenueId) -> Result<SymbolPair, SymbolError> {
    let raw = raw.trim().to_ascii_uppercase();
    if raw.is_empty() {
        return Err(SymbolError::Empty);
    }

    match venue {
        VenueId::Kraken => split_on(&raw, '/'),
        VenueId::Coinbase | VenueId::Okx => split_on(&raw, '-'),
        VenueId::Binance | VenueId::Bybit => split_concatenated(&raw),
    }
}

/// Render a canonical pair in a venue's native symbol syntax.
pub fn denormalize(pair: &SymbolPair, venue: VenueId) -> String {
    match venue {
        VenueId::Kraken => format!("{}/{}", pair.base, pair.quote),
        VenueId::Coinbase | VenueId::Okx => format!("{}-{}", pair.base, pair.quote),
        VenueId::Binance | VenueId::Bybit => format!("{}{}", pair.base, pair.quote),
    }
}

fn split_on(raw: &str, sep: char) -> Result<SymbolPair, SymbolError> {
    let (base, quote) = raw
        .split_once(sep)
        .ok_or_else(|| SymbolError::MissingSeparator(raw.to_string(), sep))?;
    if base.is_empty() || quote.is_empty() {
        return Err(SymbolError::Empty);
    }
    Ok(SymbolPair::new(base, quote))
}

fn split_concatenated(raw: &str) -> Result<SymbolPair, SymbolError> {
    for quote in KNOWN_QUOTES {
        if let Some(base) = raw.strip_suffix(quote) {
            if !base.is_empty() {
                return Ok(SymbolPair::new(base, quote));
            }
        }
    }
    Err(SymbolError::UnknownQuote(raw.to_string()))
}
