//! Venue-agnostic adapter interface.
//!
//! One adapter per venue normalizes symbol syntax and exposes a uniform
//! fetch/order interface, so the aggregator and executor never see a
//! venue-native API shape.

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::registry::VenueId;
use super::symbol::SymbolPair;
use super::types::{ExchangeError, OrderBook, OrderFill, PriceQuote};

/// Uniform interface over a venue connection.
///
/// Implement this trait to add support for a new venue. All symbols cross
/// the boundary in canonical form; implementations denormalize internally.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Returns the venue identifier.
    fn venue(&self) -> VenueId;

    /// List tradable markets in canonical form.
    async fn load_markets(&self) -> Result<Vec<SymbolPair>, ExchangeError>;

    /// Fetch the current best bid/ask and quote volume for a symbol.
    async fn fetch_ticker(&self, symbol: &SymbolPair) -> Result<PriceQuote, ExchangeError>;

    /// Fetch an order book snapshot limited to `depth` levels per side.
    async fn fetch_order_book(
        &self,
        symbol: &SymbolPair,
        depth: u32,
    ) -> Result<OrderBook, ExchangeError>;

    /// Place a market buy for `amount` base units.
    async fn create_market_buy_order(
        &self,
        symbol: &SymbolPair,
        amount: Decimal,
    ) -> Result<OrderFill, ExchangeError>;

    /// Place a market sell for `amount` base units.
    async fn create_market_sell_order(
        &self,
        symbol: &SymbolPair,
        amount: Decimal,
    ) -> Result<OrderFill, ExchangeError>;
}
