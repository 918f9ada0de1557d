//! Scriptable in-memory venue for paper trading and tests.
//!
//! Quotes are seeded by the harness; market orders fill at the quoted ask
//! (buys) or bid (sells). Failure switches simulate venue outages and
//! rejected order legs.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use super::registry::VenueId;
use super::symbol::SymbolPair;
use super::traits::ExchangeAdapter;
use super::types::{BookLevel, ExchangeError, OrderBook, OrderFill, PriceQuote, Side};

/// A filled mock order, kept for assertions.
#[derive(Debug, Clone)]
pub struct MockOrder {
    pub symbol: SymbolPair,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
}

#[derive(Debug, Clone, Copy)]
struct MockQuote {
    bid: Decimal,
    ask: Decimal,
    quote_volume: Decimal,
}

/// In-memory exchange adapter.
pub struct MockExchange {
    venue: VenueId,
    quotes: RwLock<HashMap<SymbolPair, MockQuote>>,
    orders: RwLock<Vec<MockOrder>>,
    order_counter: AtomicU64,
    fail_tickers: AtomicBool,
    fail_buys: AtomicBool,
    fail_sells: AtomicBool,
}

impl MockExchange {
    /// Create an empty mock venue.
    pub fn new(venue: VenueId) -> Self {
        Self {
            venue,
            quotes: RwLock::new(HashMap::new()),
            orders: RwLock::new(Vec::new()),
            order_counter: AtomicU64::new(1),
            fail_tickers: AtomicBool::new(false),
            fail_buys: AtomicBool::new(false),
            fail_sells: AtomicBool::new(false),
        }
    }

    /// Seed or replace the quote for a symbol.
    pub async fn set_quote(
        &self,
        symbol: SymbolPair,
        bid: Decimal,
        ask: Decimal,
        quote_volume: Decimal,
    ) {
        self.quotes.write().await.insert(
            symbol,
            MockQuote {
                bid,
                ask,
                quote_volume,
            },
        );
    }

    /// Make every ticker fetch fail (simulated outage).
    pub fn set_fail_tickers(&self, fail: bool) {
        self.fail_tickers.store(fail, Ordering::SeqCst);
    }

    /// Make buy orders fail.
    pub fn set_fail_buys(&self, fail: bool) {
        self.fail_buys.store(fail, Ordering::SeqCst);
    }

    /// Make sell orders fail (partial-fill scenarios).
    pub fn set_fail_sells(&self, fail: bool) {
        self.fail_sells.store(fail, Ordering::SeqCst);
    }

    /// Orders filled so far.
    pub async fn filled_orders(&self) -> Vec<MockOrder> {
        self.orders.read().await.clone()
    }

    async fn fill(
        &self,
        symbol: &SymbolPair,
        side: Side,
        amount: Decimal,
    ) -> Result<OrderFill, ExchangeError> {
        let failing = match side {
            Side::Buy => self.fail_buys.load(Ordering::SeqCst),
            Side::Sell => self.fail_sells.load(Ordering::SeqCst),
        };
        if failing {
            return Err(ExchangeError::OrderRejected {
                venue: self.venue,
                detail: format!("{} leg disabled by test harness", side.as_str()),
            });
        }

        let quote = {
            let quotes = self.quotes.read().await;
            quotes.get(symbol).copied()
        };
        let quote = quote.ok_or_else(|| ExchangeError::OrderRejected {
            venue: self.venue,
            detail: format!("no market for {}", symbol),
        })?;

        // Market orders cross the spread: buys lift the ask, sells hit the bid.
        let price = match side {
            Side::Buy => quote.ask,
            Side::Sell => quote.bid,
        };

        let id = self.order_counter.fetch_add(1, Ordering::SeqCst);
        let fill = OrderFill {
            order_id: format!("{}-{}", self.venue.short_code(), id),
            filled_price: price,
            filled_cost: price * amount,
            filled_qty: amount,
        };

        self.orders.write().await.push(MockOrder {
            symbol: symbol.clone(),
            side,
            quantity: amount,
            price,
        });

        debug!(venue = %self.venue, %symbol, side = side.as_str(), %amount, %price, "Mock fill");
        Ok(fill)
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    fn venue(&self) -> VenueId {
        self.venue
    }

    async fn load_markets(&self) -> Result<Vec<SymbolPair>, ExchangeError> {
        Ok(self.quotes.read().await.keys().cloned().collect())
    }

    async fn fetch_ticker(&self, symbol: &SymbolPair) -> Result<PriceQuote, ExchangeError> {
        if self.fail_tickers.load(Ordering::SeqCst) {
            return Err(ExchangeError::Timeout(self.venue));
        }

        let quotes = self.quotes.read().await;
        let quote = quotes.get(symbol).ok_or_else(|| ExchangeError::Malformed {
            venue: self.venue,
            detail: format!("unknown symbol {}", symbol),
        })?;

        Ok(PriceQuote {
            venue: self.venue,
            symbol: symbol.clone(),
            bid: quote.bid,
            ask: quote.ask,
            quote_volume: quote.quote_volume,
            observed_at: Utc::now(),
        })
    }

    async fn fetch_order_book(
        &self,
        symbol: &SymbolPair,
        _depth: u32,
    ) -> Result<OrderBook, ExchangeError> {
        let ticker = self.fetch_ticker(symbol).await?;
        Ok(OrderBook {
            venue: self.venue,
            symbol: symbol.clone(),
            bids: vec![BookLevel {
                price: ticker.bid,
                quantity: ticker.quote_volume / ticker.bid.max(Decimal::ONE),
            }],
            asks: vec![BookLevel {
                price: ticker.ask,
                quantity: ticker.quote_volume / ticker.ask.max(Decimal::ONE),
            }],
            observed_at: ticker.observed_at,
        })
    }

    async fn create_market_buy_order(
        &self,
        symbol: &SymbolPair,
        amount: Decimal,
    ) -> Result<OrderFill, ExchangeError> {
        self.fill(symbol, Side::Buy, amount).await
    }

    async fn create_market_sell_order(
        &self,
        symbol: &SymbolPair,
        amount: Decimal,
    ) -> Result<OrderFill, ExchangeError> {
        self.fill(symbol, Side::Sell, amount).await
    }
}
