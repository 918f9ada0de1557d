//! Mean-variance portfolio rebalancing.
//!
//! Recomputes target weights over trailing daily returns and emits trade
//! instructions to close any deviation above the minimum dollar threshold.
//! Instructions flow through the same risk gate and executor path used for
//! arbitrage.

use anyhow::Result;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument, trace};

use crate::exchange::{Side, SymbolPair};
use crate::ledger::{PortfolioSnapshot, PriceHistory};
use crate::utils::stats;

/// Why a planner emitted an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionReason {
    Rebalance,
    VolatilityHedge,
    FlashCrashExit,
}

impl fmt::Display for InstructionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstructionReason::Rebalance => write!(f, "rebalance"),
            InstructionReason::VolatilityHedge => write!(f, "volatility_hedge"),
            InstructionReason::FlashCrashExit => write!(f, "flash_crash_exit"),
        }
    }
}

/// A planner-produced trade, consumed by the risk gate -> executor path.
#[derive(Debug, Clone)]
pub struct TradeInstruction {
    pub symbol: SymbolPair,
    pub side: Side,
    pub quantity: Decimal,
    pub reason: InstructionReason,
    pub leverage: Decimal,
    /// Stop price for protective exits
    pub stop_price: Option<Decimal>,
}

/// Rebalancing parameters.
#[derive(Debug, Clone)]
pub struct RebalanceConfig {
    /// Minimum dollar deviation worth trading
    pub min_trade_value: Decimal,
    /// Trailing window of daily closes feeding the optimizer
    pub lookback: usize,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            min_trade_value: dec!(10),
            lookback: 365,
        }
    }
}

/// Periodically recomputes target weights and plans the trades to reach them.
pub struct RebalancePlanner {
    history: Arc<dyn PriceHistory>,
    config: RebalanceConfig,
}

impl RebalancePlanner {
    pub fn new(history: Arc<dyn PriceHistory>, config: RebalanceConfig) -> Self {
        Self { history, config }
    }

    /// Target weights for the held symbols, keyed by symbol.
    ///
    /// Symbols without enough history are excluded (their exposure is left
    /// untouched by the plan).
    pub fn target_weights(
        &self,
        symbols: &[SymbolPair],
    ) -> Result<HashMap<SymbolPair, Decimal>> {
        let mut usable: Vec<(SymbolPair, Vec<Decimal>)> = Vec::new();
        for symbol in symbols {
            let closes = self.history.get_closes(symbol, self.config.lookback + 1)?;
            let returns = stats::returns(&closes);
            if returns.len() >= 2 {
                usable.push((symbol.clone(), returns));
            } else {
                trace!(%symbol, "Insufficient history; excluded from optimization");
            }
        }

        let series: Vec<&[Decimal]> = usable.iter().map(|(_, r)| r.as_slice()).collect();
        let weights = optimize_weights(&series);

        Ok(usable
            .into_iter()
            .zip(weights)
            .map(|((symbol, _), w)| (symbol, w))
            .collect())
    }

    /// Plan rebalancing trades for the current portfolio.
    ///
    /// `prices` supplies the current price per symbol for sizing; symbols
    /// without a usable price are skipped.
    #[instrument(skip(self, snapshot, prices))]
    pub fn plan(
        &self,
        snapshot: &PortfolioSnapshot,
        prices: &HashMap<SymbolPair, Decimal>,
    ) -> Result<Vec<TradeInstruction>> {
        let held: Vec<SymbolPair> = snapshot
            .exposures
            .iter()
            .filter(|(_, notional)| **notional > Decimal::ZERO)
            .map(|(s, _)| s.clone())
            .collect();
        if held.is_empty() {
            return Ok(Vec::new());
        }

        let weights = self.target_weights(&held)?;
        if weights.is_empty() {
            return Ok(Vec::new());
        }

        // Rebalance only the capital already invested in optimizable symbols.
        let invested: Decimal = weights
            .keys()
            .filter_map(|s| snapshot.exposures.get(s))
            .copied()
            .sum();

        let mut instructions = Vec::new();
        let mut symbols: Vec<&SymbolPair> = weights.keys().collect();
        symbols.sort();

        for symbol in symbols {
            let target = weights[symbol] * invested;
            let current = snapshot
                .exposures
                .get(symbol)
                .copied()
                .unwrap_or(Decimal::ZERO);
            let deviation = target - current;

            if deviation.abs() < self.config.min_trade_value {
                continue;
            }

            let Some(price) = prices.get(symbol).copied().filter(|p| *p > Decimal::ZERO)
            else {
                trace!(%symbol, "No current price; skipping rebalance leg");
                continue;
            };

            let side = if deviation > Decimal::ZERO {
                Side::Buy
            } else {
                Side::Sell
            };

            debug!(
                %symbol,
                %target,
                %current,
                %deviation,
                side = side.as_str(),
                "Rebalance instruction"
            );

            instructions.push(TradeInstruction {
                symbol: symbol.clone(),
                side,
                quantity: deviation.abs() / price,
                reason: InstructionReason::Rebalance,
                leverage: Decimal::ONE,
                stop_price: None,
            });
        }

        Ok(instructions)
    }
}

/// Maximize portfolio return/volatility over the weight simplex.
///
/// Shrinking-step coordinate search: perturb one weight at a time, project
/// back onto (weights in [0,1], sum = 1), keep strict improvements. Fully
/// deterministic for a given input.
pub fn optimize_weights(series: &[&[Decimal]]) -> Vec<Decimal> {
    let n = series.len();
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![Decimal::ONE];
    }

    let equal = Decimal::ONE / Decimal::from(n);
    let mut weights = vec![equal; n];
    let mut best = portfolio_sharpe(&weights, series);

    let mut step = dec!(0.1);
    for _ in 0..100 {
        if step < dec!(0.01) {
            break;
        }

        let mut improved = false;
        for i in 0..n {
            for direction in [step, -step] {
                let mut candidate = weights.clone();
                candidate[i] += direction;
                project_to_simplex(&mut candidate);

                let score = portfolio_sharpe(&candidate, series);
                if score > best {
                    best = score;
                    weights = candidate;
                    improved = true;
                }
            }
        }

        if !improved {
            step /= dec!(2);
        }
    }

    weights
}

/// Return/volatility of the weighted portfolio return series. Series are
/// aligned on their most recent common window.
fn portfolio_sharpe(weights: &[Decimal], series: &[&[Decimal]]) -> Decimal {
    let t = series.iter().map(|s| s.len()).min().unwrap_or(0);
    if t < 2 {
        return Decimal::ZERO;
    }

    let mut portfolio = vec![Decimal::ZERO; t];
    for (weight, returns) in weights.iter().zip(series) {
        let offset = returns.len() - t;
        for (i, slot) in portfolio.iter_mut().enumerate() {
            *slot += *weight * returns[offset + i];
        }
    }

    let sigma = stats::std_dev(&portfolio);
    if sigma == Decimal::ZERO {
        return Decimal::ZERO;
    }
    stats::mean(&portfolio) / sigma
}

/// Clamp weights into [0,1] and renormalize to sum 1.
fn project_to_simplex(weights: &mut [Decimal]) {
    for w in weights.iter_mut() {
        *w = (*w).clamp(Decimal::ZERO, Decimal::ONE);
    }
    let sum: Decimal = weights.iter().copied().sum();
    if sum == Decimal::ZERO {
        let equal = Decimal::ONE / Decimal::from(weights.len());
        for w in weights.iter_mut() {
            *w = equal;
        }
    } else {
        for w in weights.iter_mut() {
            *w /= sum;
        }
    }
}
