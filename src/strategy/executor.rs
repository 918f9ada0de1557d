//! Two-leg arbitrage execution.
//!
//! The order of operations is deliberate and risky: the buy leg commits
//! first, then after a short settle delay the sell leg fires. There is no
//! atomicity across the two legs and no mid-flight cancellation once the buy
//! has been submitted; a sell-leg failure leaves a naked position, which is
//! surfaced as a partial-fill incident, never silently absorbed.

use anyhow::{anyhow, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::config::ExecutionConfig;
use crate::exchange::{ExchangeAdapter, Side, SymbolPair, VenueId, VenueRegistry};
use crate::ledger::{
    ArbStatus, ArbitrageTrade, Ledger, LedgerRead, LedgerWrite, PortfolioSnapshot, Position,
    TradeRecord,
};
use crate::market::PriceAggregator;
use crate::risk::{PositionSizer, ProposedTrade, RiskDecision, RiskGate, RiskProfile, RiskViolation};
use crate::utils::decimal::{percentage_diff, round_down_to_lot};

use super::scanner::{ArbitrageOpportunity, OpportunityScanner};

/// A sell-leg failure after a filled buy: the portfolio now holds an
/// unintended open position.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PartialFillIncident {
    pub trade_id: String,
    pub symbol: SymbolPair,
    pub buy_venue: VenueId,
    pub sell_venue: VenueId,
    pub quantity: Decimal,
    pub buy_price: Decimal,
    pub error: String,
}

/// Outcome of an execution attempt.
///
/// Risk rejections and invalidations are expected, frequent, non-fatal
/// outcomes; only `PartialFill` escalates to an operator-visible incident.
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// Both legs filled; the completed trade was persisted.
    Completed { trade: ArbitrageTrade },
    /// The opportunity vanished or its profit collapsed before firing.
    NoLongerAvailable { reason: String },
    /// The risk gate refused the trade.
    RiskRejected { violation: RiskViolation },
    /// Sizing shrank the amount to nothing.
    SizedToZero,
    /// The portfolio moved too far between approval and submission.
    SnapshotDrift { approved: Decimal, current: Decimal },
    /// The buy leg failed outright; nothing was committed.
    BuyFailed { error: String },
    /// Buy filled, sell failed; an unintended position is now open.
    PartialFill { incident: PartialFillIncident },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Completed { .. })
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionOutcome::Completed { trade } => write!(
                f,
                "completed: {} {} -> {} profit {}",
                trade.symbol,
                trade.buy_venue,
                trade.sell_venue,
                trade
                    .realized_profit
                    .map(|p| p.to_string())
                    .unwrap_or_default()
            ),
            ExecutionOutcome::NoLongerAvailable { reason } => {
                write!(f, "no longer available: {}", reason)
            }
            ExecutionOutcome::RiskRejected { violation } => {
                write!(f, "risk rejected: {}", violation)
            }
            ExecutionOutcome::SizedToZero => write!(f, "adjusted amount is zero"),
            ExecutionOutcome::SnapshotDrift { approved, current } => write!(
                f,
                "portfolio drifted between approval and submission ({} -> {})",
                approved, current
            ),
            ExecutionOutcome::BuyFailed { error } => write!(f, "buy leg failed: {}", error),
            ExecutionOutcome::PartialFill { incident } => write!(
                f,
                "partial fill: long {} {} stranded on {}",
                incident.quantity, incident.symbol, incident.buy_venue
            ),
        }
    }
}

/// Orchestrates buy-then-sell order pairs for approved opportunities.
pub struct ArbitrageExecutor {
    adapters: HashMap<VenueId, Arc<dyn ExchangeAdapter>>,
    aggregator: Arc<PriceAggregator>,
    scanner: OpportunityScanner,
    registry: Arc<VenueRegistry>,
    gate: RiskGate,
    sizer: PositionSizer,
    ledger: Arc<dyn Ledger>,
    config: ExecutionConfig,
}

impl ArbitrageExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        adapters: HashMap<VenueId, Arc<dyn ExchangeAdapter>>,
        aggregator: Arc<PriceAggregator>,
        scanner: OpportunityScanner,
        registry: Arc<VenueRegistry>,
        gate: RiskGate,
        sizer: PositionSizer,
        ledger: Arc<dyn Ledger>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            adapters,
            aggregator,
            scanner,
            registry,
            gate,
            sizer,
            ledger,
            config,
        }
    }

    /// Execute an opportunity, optionally with a caller-specified base amount.
    ///
    /// Prices are time-sensitive: the opportunity is re-scanned and
    /// re-matched immediately before acting, and the approval snapshot is
    /// re-checked against the live portfolio value just before submission.
    #[instrument(skip(self, opportunity, profile), fields(symbol = %opportunity.symbol))]
    pub async fn execute(
        &self,
        opportunity: &ArbitrageOpportunity,
        amount: Option<Decimal>,
        profile: &RiskProfile,
    ) -> Result<ExecutionOutcome> {
        // 1. Re-validate against live prices; the caller's snapshot may be stale.
        let table = self.aggregator.refresh().await;
        let live = self
            .scanner
            .scan(&table)
            .into_iter()
            .find(|o| {
                o.symbol == opportunity.symbol
                    && o.buy_venue == opportunity.buy_venue
                    && o.sell_venue == opportunity.sell_venue
            });

        let Some(live) = live else {
            return Ok(ExecutionOutcome::NoLongerAvailable {
                reason: format!(
                    "{} {}->{} spread gone or below {}%",
                    opportunity.symbol,
                    opportunity.buy_venue,
                    opportunity.sell_venue,
                    self.scanner.min_profit_threshold()
                ),
            });
        };

        // 2. Size and risk-gate against a fresh portfolio snapshot.
        let snapshot = PortfolioSnapshot::capture(self.ledger.as_ref())?;
        let requested = match amount {
            Some(a) => a,
            None => {
                let budget = (profile.max_position_fraction * snapshot.total_value)
                    .min(live.max_volume);
                budget / live.buy_price
            }
        };

        let adjusted = self.sizer.adjust_size(
            &live.symbol,
            requested,
            live.buy_price,
            profile,
            &snapshot,
        )?;
        let adjusted = round_down_to_lot(adjusted, self.config.lot_size);
        if adjusted <= Decimal::ZERO {
            return Ok(ExecutionOutcome::SizedToZero);
        }

        let proposed = ProposedTrade {
            symbol: live.symbol.clone(),
            side: Side::Buy,
            quantity: adjusted,
            price: live.buy_price,
            leverage: Decimal::ONE,
        };
        if let RiskDecision::Rejected(violation) =
            self.gate.approve(&proposed, profile, &snapshot)?
        {
            info!(symbol = %live.symbol, %violation, "Risk gate rejected arbitrage");
            return Ok(ExecutionOutcome::RiskRejected { violation });
        }

        // 3. Optimistic re-check of the approval snapshot. The ledger is not
        // locked across the decision; this narrows the check-then-act window
        // but does not close it (see DESIGN.md).
        let current_value = self.ledger.portfolio_value()?;
        if percentage_diff(current_value, snapshot.total_value) > self.config.drift_tolerance_pct {
            warn!(
                approved = %snapshot.total_value,
                current = %current_value,
                "Portfolio drifted past tolerance; aborting before submission"
            );
            return Ok(ExecutionOutcome::SnapshotDrift {
                approved: snapshot.total_value,
                current: current_value,
            });
        }

        self.fire_legs(&live, adjusted, profile).await
    }

    /// Commit the buy leg, then the sell leg. Once the buy is submitted the
    /// execution runs to completion or failure; a filled buy is never undone.
    async fn fire_legs(
        &self,
        opp: &ArbitrageOpportunity,
        quantity: Decimal,
        profile: &RiskProfile,
    ) -> Result<ExecutionOutcome> {
        let buy_adapter = self.adapter(opp.buy_venue)?;
        let sell_adapter = self.adapter(opp.sell_venue)?;

        let opened_at = Utc::now();
        let trade_id = format!(
            "arb-{}-{}",
            opened_at.timestamp(),
            opened_at.timestamp_subsec_nanos()
        );

        // Buy leg.
        let buy_fill = match buy_adapter
            .create_market_buy_order(&opp.symbol, quantity)
            .await
        {
            Ok(fill) => fill,
            Err(e) => {
                warn!(symbol = %opp.symbol, venue = %opp.buy_venue, error = %e, "Buy leg failed");
                return Ok(ExecutionOutcome::BuyFailed {
                    error: e.to_string(),
                });
            }
        };

        info!(
            %trade_id,
            symbol = %opp.symbol,
            venue = %opp.buy_venue,
            qty = %buy_fill.filled_qty,
            price = %buy_fill.filled_price,
            "Buy leg filled"
        );

        // Journal the intermediate state before touching the sell venue so a
        // crash between legs leaves an inspectable buy_filled record.
        self.ledger.record_trade(&TradeRecord {
            symbol: opp.symbol.clone(),
            venue: opp.buy_venue,
            side: Side::Buy,
            quantity: buy_fill.filled_qty,
            price: buy_fill.filled_price,
            executed_at: Utc::now(),
        })?;
        self.ledger.record_arbitrage_trade(&ArbitrageTrade {
            trade_id: trade_id.clone(),
            symbol: opp.symbol.clone(),
            buy_venue: opp.buy_venue,
            sell_venue: opp.sell_venue,
            buy_order_id: buy_fill.order_id.clone(),
            sell_order_id: None,
            buy_price: buy_fill.filled_price,
            sell_price: None,
            quantity: buy_fill.filled_qty,
            realized_profit: None,
            status: ArbStatus::BuyFilled,
            opened_at,
            closed_at: None,
        })?;
        self.ledger.upsert_position(&Position {
            symbol: opp.symbol.clone(),
            side: Side::Buy,
            quantity: buy_fill.filled_qty,
            entry_price: buy_fill.filled_price,
            stop_loss: Some(buy_fill.filled_price * (Decimal::ONE - profile.stop_loss_pct)),
            take_profit: Some(buy_fill.filled_price * (Decimal::ONE + profile.take_profit_pct)),
            opened_at,
        })?;

        tokio::time::sleep(Duration::from_millis(self.config.settle_delay_ms)).await;

        // Sell leg. The fill quantity from the buy is what we actually hold.
        let sell_fill = match sell_adapter
            .create_market_sell_order(&opp.symbol, buy_fill.filled_qty)
            .await
        {
            Ok(fill) => fill,
            Err(e) => {
                self.ledger.update_arbitrage_trade(
                    &trade_id,
                    ArbStatus::PartialFill,
                    None,
                    None,
                    None,
                )?;

                let incident = PartialFillIncident {
                    trade_id: trade_id.clone(),
                    symbol: opp.symbol.clone(),
                    buy_venue: opp.buy_venue,
                    sell_venue: opp.sell_venue,
                    quantity: buy_fill.filled_qty,
                    buy_price: buy_fill.filled_price,
                    error: e.to_string(),
                };
                let payload = serde_json::to_string(&incident).unwrap_or_default();
                error!(
                    target: "incident",
                    %trade_id,
                    symbol = %incident.symbol,
                    buy_venue = %incident.buy_venue,
                    sell_venue = %incident.sell_venue,
                    quantity = %incident.quantity,
                    error = %incident.error,
                    "PARTIAL_FILL_INCIDENT: {}",
                    payload
                );
                return Ok(ExecutionOutcome::PartialFill { incident });
            }
        };

        // Realized profit from actual fill cost/revenue, net of both venues'
        // taker fees. Never the pre-trade estimate.
        let buy_fee_rate = self
            .registry
            .taker_fee(opp.buy_venue)
            .unwrap_or(Decimal::ZERO);
        let sell_fee_rate = self
            .registry
            .taker_fee(opp.sell_venue)
            .unwrap_or(Decimal::ZERO);
        let fees =
            buy_fill.filled_cost * buy_fee_rate + sell_fill.filled_cost * sell_fee_rate;
        let realized_profit = sell_fill.filled_cost - buy_fill.filled_cost - fees;

        self.ledger.record_trade(&TradeRecord {
            symbol: opp.symbol.clone(),
            venue: opp.sell_venue,
            side: Side::Sell,
            quantity: sell_fill.filled_qty,
            price: sell_fill.filled_price,
            executed_at: Utc::now(),
        })?;
        self.ledger.update_arbitrage_trade(
            &trade_id,
            ArbStatus::Completed,
            Some(&sell_fill.order_id),
            Some(sell_fill.filled_price),
            Some(realized_profit),
        )?;

        // The round trip is flat; drop the interim position.
        self.ledger.upsert_position(&Position {
            symbol: opp.symbol.clone(),
            side: Side::Buy,
            quantity: Decimal::ZERO,
            entry_price: buy_fill.filled_price,
            stop_loss: None,
            take_profit: None,
            opened_at,
        })?;

        let realized_pct = if buy_fill.filled_cost > Decimal::ZERO {
            realized_profit / buy_fill.filled_cost * dec!(100)
        } else {
            Decimal::ZERO
        };
        info!(
            %trade_id,
            symbol = %opp.symbol,
            profit = %realized_profit,
            profit_pct = %realized_pct,
            "Arbitrage completed"
        );

        Ok(ExecutionOutcome::Completed {
            trade: ArbitrageTrade {
                trade_id,
                symbol: opp.symbol.clone(),
                buy_venue: opp.buy_venue,
                sell_venue: opp.sell_venue,
                buy_order_id: buy_fill.order_id,
                sell_order_id: Some(sell_fill.order_id),
                buy_price: buy_fill.filled_price,
                sell_price: Some(sell_fill.filled_price),
                quantity: buy_fill.filled_qty,
                realized_profit: Some(realized_profit),
                status: ArbStatus::Completed,
                opened_at,
                closed_at: Some(Utc::now()),
            },
        })
    }

    fn adapter(&self, venue: VenueId) -> Result<&Arc<dyn ExchangeAdapter>> {
        self.adapters
            .get(&venue)
            .ok_or_else(|| anyhow!("no adapter configured for venue {}", venue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AggregatorConfig, ScannerConfig};
    use crate::exchange::{MockExchange, VenueConfig};
    use crate::ledger::{LedgerRead, SqliteLedger};
    use crate::risk::SizingConfig;

    fn btc() -> SymbolPair {
        SymbolPair::new("BTC", "USDT")
    }

    struct Harness {
        buy_venue: Arc<MockExchange>,
        sell_venue: Arc<MockExchange>,
        ledger: Arc<SqliteLedger>,
        executor: ArbitrageExecutor,
    }

    /// Two mock venues with a live 1% spread on BTC/USDT and a funded ledger.
    async fn harness() -> Harness {
        let buy_venue = Arc::new(MockExchange::new(VenueId::Binance));
        let sell_venue = Arc::new(MockExchange::new(VenueId::Kraken));
        buy_venue
            .set_quote(btc(), dec!(99.9), dec!(100), dec!(1_000_000))
            .await;
        sell_venue
            .set_quote(btc(), dec!(101), dec!(101.1), dec!(1_000_000))
            .await;

        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        ledger.set_balance(dec!(10000)).unwrap();

        let registry = Arc::new(
            VenueRegistry::from_configs(vec![
                VenueConfig::with_defaults(VenueId::Binance),
                VenueConfig::with_defaults(VenueId::Kraken),
            ])
            .unwrap(),
        );

        let adapters: HashMap<VenueId, Arc<dyn ExchangeAdapter>> = [
            (
                VenueId::Binance,
                Arc::clone(&buy_venue) as Arc<dyn ExchangeAdapter>,
            ),
            (
                VenueId::Kraken,
                Arc::clone(&sell_venue) as Arc<dyn ExchangeAdapter>,
            ),
        ]
        .into_iter()
        .collect();

        let aggregator = Arc::new(PriceAggregator::new(
            adapters.values().cloned().collect(),
            vec![btc()],
            AggregatorConfig {
                fetch_timeout_secs: 2,
                max_cache_staleness_secs: 300,
                outage_alert_cycles: 3,
            },
            None,
        ));

        let scanner = OpportunityScanner::new(
            Arc::clone(&registry),
            ScannerConfig {
                min_profit_threshold_pct: dec!(0.5),
                volume_safety_factor: dec!(0.1),
                freshness_secs: 10,
            },
        );

        let gate = RiskGate::new(
            Arc::clone(&ledger) as Arc<dyn LedgerRead>,
            dec!(0.002),
            false,
        );
        let sizer = PositionSizer::new(Arc::clone(&ledger) as _, SizingConfig::default());

        let executor = ArbitrageExecutor::new(
            adapters,
            aggregator,
            scanner,
            registry,
            gate,
            sizer,
            Arc::clone(&ledger) as Arc<dyn Ledger>,
            ExecutionConfig {
                settle_delay_ms: 10,
                drift_tolerance_pct: dec!(5),
                lot_size: dec!(0.0001),
            },
        );

        Harness {
            buy_venue,
            sell_venue,
            ledger,
            executor,
        }
    }

    /// An opportunity matching the harness quotes: buy at 100, sell at 101,
    /// 0.1% taker fees on both sides, net 0.8%.
    fn live_opportunity() -> ArbitrageOpportunity {
        ArbitrageOpportunity {
            symbol: btc(),
            buy_venue: VenueId::Binance,
            sell_venue: VenueId::Kraken,
            buy_price: dec!(100),
            sell_price: dec!(101),
            gross_profit_pct: dec!(1),
            fee_pct: dec!(0.2),
            net_profit_pct: dec!(0.8),
            max_volume: dec!(100_000),
            discovered_at: Utc::now(),
        }
    }

    // =========================================================================
    // End-to-End Scenarios
    // =========================================================================

    #[tokio::test]
    async fn test_completed_round_trip_records_realized_profit() {
        let h = harness().await;
        let profile = RiskProfile::moderate();

        let outcome = h
            .executor
            .execute(&live_opportunity(), Some(dec!(0.05)), &profile)
            .await
            .unwrap();

        let trade = match outcome {
            ExecutionOutcome::Completed { trade } => trade,
            other => panic!("expected completed execution, got {:?}", other),
        };

        // Realized profit recomputed from fills:
        // revenue 101*0.05 - cost 100*0.05 - fees (5*0.001 + 5.05*0.001)
        assert_eq!(trade.quantity, dec!(0.05));
        assert_eq!(trade.buy_price, dec!(100));
        assert_eq!(trade.sell_price, Some(dec!(101)));
        assert_eq!(trade.realized_profit, Some(dec!(0.03995)));
        assert_eq!(trade.status, ArbStatus::Completed);

        // Ledger: both legs recorded, arb trade completed, position flat.
        let persisted = h.ledger.recent_arbitrage_trades(10).unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].status, ArbStatus::Completed);
        assert!(h.ledger.positions().unwrap().is_empty());

        let trades = h
            .ledger
            .trades_since(Utc::now() - chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(trades.len(), 2);
    }

    #[tokio::test]
    async fn test_partial_fill_leaves_open_position_and_incident() {
        let h = harness().await;
        h.sell_venue.set_fail_sells(true);
        let profile = RiskProfile::moderate();

        let outcome = h
            .executor
            .execute(&live_opportunity(), Some(dec!(1)), &profile)
            .await
            .unwrap();

        let incident = match outcome {
            ExecutionOutcome::PartialFill { incident } => incident,
            other => panic!("expected partial fill, got {:?}", other),
        };

        // The ledger reflects an open long of the bought quantity, not a
        // completed arbitrage trade.
        assert_eq!(incident.buy_price, dec!(100));
        let positions = h.ledger.positions().unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, Side::Buy);
        assert_eq!(positions[0].quantity, incident.quantity);

        let persisted = h.ledger.recent_arbitrage_trades(10).unwrap();
        assert_eq!(persisted[0].status, ArbStatus::PartialFill);
        assert!(persisted[0].sell_order_id.is_none());
    }

    #[tokio::test]
    async fn test_vanished_opportunity_aborts_before_any_order() {
        let h = harness().await;
        // Collapse the spread before execution.
        h.sell_venue
            .set_quote(btc(), dec!(100.05), dec!(100.2), dec!(1_000_000))
            .await;
        let profile = RiskProfile::moderate();

        let outcome = h
            .executor
            .execute(&live_opportunity(), Some(dec!(0.05)), &profile)
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            ExecutionOutcome::NoLongerAvailable { .. }
        ));
        assert!(h.buy_venue.filled_orders().await.is_empty());
        assert!(h.sell_venue.filled_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_daily_loss_breach_blocks_execution() {
        let h = harness().await;

        // Burn the daily loss budget: unhedged buy of 300 on a 10k book
        // against a 2% (=200) budget.
        h.ledger
            .record_trade(&TradeRecord {
                symbol: btc(),
                venue: VenueId::Binance,
                side: Side::Buy,
                quantity: dec!(3),
                price: dec!(100),
                executed_at: Utc::now(),
            })
            .unwrap();

        let outcome = h
            .executor
            .execute(&live_opportunity(), Some(dec!(0.05)), &RiskProfile::moderate())
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            ExecutionOutcome::RiskRejected {
                violation: RiskViolation::DailyLossBreached { .. }
            }
        ));
        assert!(h.buy_venue.filled_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_zero_amount_rejected_without_orders() {
        let h = harness().await;

        let outcome = h
            .executor
            .execute(&live_opportunity(), Some(Decimal::ZERO), &RiskProfile::moderate())
            .await
            .unwrap();

        assert!(matches!(outcome, ExecutionOutcome::SizedToZero));
        assert!(h.buy_venue.filled_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_derived_amount_passes_through_sizer() {
        let h = harness().await;

        // No caller amount: derived from min(position budget, max volume)
        // then Kelly-adjusted. With an empty history the floor applies, so
        // the order lands well under the derived budget but above zero.
        let outcome = h
            .executor
            .execute(&live_opportunity(), None, &RiskProfile::moderate())
            .await
            .unwrap();

        let trade = match outcome {
            ExecutionOutcome::Completed { trade } => trade,
            other => panic!("expected completed execution, got {:?}", other),
        };
        assert!(trade.quantity > Decimal::ZERO);
        // Kelly floor: 0.01 * tiered cap (0.10 * 10000 * 0.75) / price 100
        assert_eq!(trade.quantity, dec!(0.075));
    }

    #[tokio::test]
    async fn test_outcome_messages_name_the_cause() {
        let outcome = ExecutionOutcome::NoLongerAvailable {
            reason: "spread gone".to_string(),
        };
        assert!(outcome.to_string().contains("no longer available"));
        assert!(!outcome.is_success());

        let outcome = ExecutionOutcome::SizedToZero;
        assert!(outcome.to_string().contains("zero"));
    }
}
