//! Arbitrage opportunity scanner.
//!
//! Consumes the aggregator's price table, enumerates ordered venue pairs per
//! symbol, and ranks fee-adjusted spreads. Opportunities are derived data,
//! recomputed every cycle; they are only persisted when an execution attempt
//! snapshots one into an arbitrage trade record.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{debug, instrument, trace};

use crate::config::ScannerConfig;
use crate::exchange::{PriceQuote, SymbolPair, VenueId, VenueRegistry};
use crate::market::PriceTable;

/// A detected, currently-live cross-venue spread exceeding the profit
/// threshold after fees.
#[derive(Debug, Clone)]
pub struct ArbitrageOpportunity {
    pub symbol: SymbolPair,
    pub buy_venue: VenueId,
    pub sell_venue: VenueId,
    /// Ask at the buy venue
    pub buy_price: Decimal,
    /// Bid at the sell venue
    pub sell_price: Decimal,
    pub gross_profit_pct: Decimal,
    pub fee_pct: Decimal,
    pub net_profit_pct: Decimal,
    /// Estimated tradeable volume in quote units, haircut by the safety factor
    pub max_volume: Decimal,
    pub discovered_at: DateTime<Utc>,
}

/// Scans price tables for profitable cross-venue spreads.
pub struct OpportunityScanner {
    registry: Arc<VenueRegistry>,
    config: ScannerConfig,
}

impl OpportunityScanner {
    pub fn new(registry: Arc<VenueRegistry>, config: ScannerConfig) -> Self {
        Self { registry, config }
    }

    /// Minimum net profit percentage an opportunity must clear.
    pub fn min_profit_threshold(&self) -> Decimal {
        self.config.min_profit_threshold_pct
    }

    /// Scan a price table for opportunities, sorted by net profit descending.
    ///
    /// Ordering is fully deterministic (net profit, then symbol and venue
    /// ids) so an unchanged table always yields an identical list.
    #[instrument(skip(self, table))]
    pub fn scan(&self, table: &PriceTable) -> Vec<ArbitrageOpportunity> {
        let now = Utc::now();
        let max_age = Duration::seconds(self.config.freshness_secs);

        let mut opportunities = Vec::new();

        for (symbol, venues) in table {
            let fresh: Vec<&PriceQuote> = venues
                .values()
                .filter(|q| q.is_fresh(now, max_age))
                .collect();

            // A symbol needs at least two fresh quotes to arbitrage.
            if fresh.len() < 2 {
                trace!(%symbol, fresh = fresh.len(), "Insufficient fresh quotes");
                continue;
            }

            for &buy in &fresh {
                for &sell in &fresh {
                    if buy.venue == sell.venue {
                        continue;
                    }
                    if let Some(opp) = self.evaluate_pair(symbol, buy, sell, now) {
                        opportunities.push(opp);
                    }
                }
            }
        }

        opportunities.sort_by(|a, b| {
            b.net_profit_pct
                .cmp(&a.net_profit_pct)
                .then_with(|| a.symbol.cmp(&b.symbol))
                .then_with(|| a.buy_venue.cmp(&b.buy_venue))
                .then_with(|| a.sell_venue.cmp(&b.sell_venue))
        });

        debug!(count = opportunities.len(), "Scan complete");
        opportunities
    }

    /// Evaluate one ordered (buy, sell) venue pair for a symbol.
    fn evaluate_pair(
        &self,
        symbol: &SymbolPair,
        buy: &PriceQuote,
        sell: &PriceQuote,
        now: DateTime<Utc>,
    ) -> Option<ArbitrageOpportunity> {
        if buy.ask <= Decimal::ZERO || sell.bid <= Decimal::ZERO {
            return None;
        }

        let buy_fee = self.registry.taker_fee(buy.venue)?;
        let sell_fee = self.registry.taker_fee(sell.venue)?;

        let gross_profit_pct = (sell.bid / buy.ask - Decimal::ONE) * dec!(100);
        let fee_pct = (buy_fee + sell_fee) * dec!(100);
        let net_profit_pct = gross_profit_pct - fee_pct;

        if net_profit_pct < self.config.min_profit_threshold_pct {
            return None;
        }

        // Quoted volume overstates depth at the touch; haircut it rather
        // than assume the whole book is available at the quoted price.
        let max_volume =
            buy.quote_volume.min(sell.quote_volume) * self.config.volume_safety_factor;

        trace!(
            %symbol,
            buy_venue = %buy.venue,
            sell_venue = %sell.venue,
            net = %net_profit_pct,
            "Opportunity found"
        );

        Some(ArbitrageOpportunity {
            symbol: symbol.clone(),
            buy_venue: buy.venue,
            sell_venue: sell.venue,
            buy_price: buy.ask,
            sell_price: sell.bid,
            gross_profit_pct,
            fee_pct,
            net_profit_pct,
            max_volume,
            discovered_at: now,
        })
    }
}
