//! Type definitions for venue market data and order handling.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::registry::VenueId;
use super::symbol::SymbolPair;

/// Venue failure taxonomy.
///
/// Transient variants (timeout, rate limit, malformed) exclude the venue for
/// the current aggregator cycle only; the venue is retried next cycle.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("venue {0} timed out")]
    Timeout(VenueId),
    #[error("venue {0} rate limited the request")]
    RateLimited(VenueId),
    #[error("venue {venue} returned HTTP {status}")]
    Http { venue: VenueId, status: u16 },
    #[error("venue {venue} returned a malformed response: {detail}")]
    Malformed { venue: VenueId, detail: String },
    #[error("transport error talking to {venue}: {detail}")]
    Transport { venue: VenueId, detail: String },
    #[error("venue {venue} rejected order: {detail}")]
    OrderRejected { venue: VenueId, detail: String },
}

impl ExchangeError {
    /// Whether the failure should be retried next cycle without escalation.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ExchangeError::OrderRejected { .. })
    }
}

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

/// Best bid/ask snapshot for one (venue, symbol), valid for one poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceQuote {
    pub venue: VenueId,
    pub symbol: SymbolPair,
    pub bid: Decimal,
    pub ask: Decimal,
    /// 24h traded volume in quote currency
    pub quote_volume: Decimal,
    pub observed_at: DateTime<Utc>,
}

impl PriceQuote {
    /// Whether the quote is recent enough to participate in opportunity
    /// scoring. Stale quotes serve display paths only.
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now.signed_duration_since(self.observed_at) <= max_age
    }

    /// Mid price, zero when either side is missing.
    pub fn mid(&self) -> Decimal {
        if self.bid <= Decimal::ZERO || self.ask <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.bid + self.ask) / Decimal::TWO
    }
}

/// One price level of an order book.
#[derive(Debug, Clone, Deserialize)]
pub struct BookLevel {
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
}

/// Order book snapshot, bids descending and asks ascending.
#[derive(Debug, Clone)]
pub struct OrderBook {
    pub venue: VenueId,
    pub symbol: SymbolPair,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub observed_at: DateTime<Utc>,
}

/// Minimal fill confirmation returned by every order call.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderFill {
    pub order_id: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub filled_price: Decimal,
    /// Total cost (buy) or proceeds (sell) in quote currency
    #[serde(with = "rust_decimal::serde::str")]
    pub filled_cost: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub filled_qty: Decimal,
}

/// OHLCV row written to the historical store each aggregator cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: SymbolPair,
    pub venue: VenueId,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Candle {
    /// Degenerate candle from a single quote observation.
    pub fn from_quote(quote: &PriceQuote) -> Self {
        let mid = quote.mid();
        Self {
            symbol: quote.symbol.clone(),
            venue: quote.venue,
            open: mid,
            high: quote.ask,
            low: quote.bid,
            close: mid,
            volume: quote.quote_volume,
            timestamp: quote.observed_at,
        }
    }
}

/// Ticker payload from the connectivity gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerPayload {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub bid: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub ask: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub quote_volume: Decimal,
}

/// Order book payload from the connectivity gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderBookPayload {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

/// Market listing payload from the connectivity gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketPayload {
    pub symbol: String,
    #[serde(default)]
    pub active: bool,
}
