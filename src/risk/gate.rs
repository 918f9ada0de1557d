//! Pre-trade risk validation.
//!
//! Every proposed trade passes the same ordered checks, short-circuiting on
//! the first failure. Rejections always name the violated constraint; they
//! are expected, frequent, non-fatal outcomes.

use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::exchange::{Side, SymbolPair};
use crate::ledger::{LedgerRead, PortfolioSnapshot};

use super::profile::RiskProfile;

/// Portfolio value above which leverage is hard-capped regardless of profile.
pub const LEVERAGE_TIER_BOUNDARY: Decimal = dec!(50000);
/// The hard leverage ceiling applied above [`LEVERAGE_TIER_BOUNDARY`].
pub const LEVERAGE_HARD_CAP: Decimal = dec!(1.5);

/// Position-cap weight by portfolio size tier; caution grows with capital.
pub fn tier_weight(total_value: Decimal) -> Decimal {
    if total_value < dec!(1000) {
        Decimal::ONE
    } else if total_value <= dec!(10000) {
        dec!(0.75)
    } else {
        dec!(0.5)
    }
}

/// Effective leverage ceiling: the profile cap, hard-capped to 1.5 once the
/// portfolio crosses the tier boundary.
pub fn effective_leverage_cap(profile: &RiskProfile, total_value: Decimal) -> Decimal {
    if total_value > LEVERAGE_TIER_BOUNDARY {
        profile.max_leverage.min(LEVERAGE_HARD_CAP)
    } else {
        profile.max_leverage
    }
}

/// Tier-scaled position notional cap.
pub fn tiered_position_cap(profile: &RiskProfile, total_value: Decimal) -> Decimal {
    profile.max_position_fraction * total_value * tier_weight(total_value)
}

/// A trade awaiting risk approval.
#[derive(Debug, Clone)]
pub struct ProposedTrade {
    pub symbol: SymbolPair,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub leverage: Decimal,
}

impl ProposedTrade {
    /// Unlevered notional value.
    pub fn notional(&self) -> Decimal {
        self.quantity * self.price
    }
}

/// The specific constraint a rejected trade violated.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskViolation {
    #[error("leverage {requested} exceeds cap {cap}")]
    LeverageExceeded { requested: Decimal, cap: Decimal },
    #[error("levered notional {notional} exceeds tiered position cap {cap}")]
    PositionCapExceeded { notional: Decimal, cap: Decimal },
    #[error("daily loss budget exhausted: realized P&L {pnl} is below -{limit}")]
    DailyLossBreached { pnl: Decimal, limit: Decimal },
    #[error("expected profit {expected} does not cover round-trip fees {fees}")]
    NotWorthFees { expected: Decimal, fees: Decimal },
}

/// Outcome of a risk check.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Approved,
    Rejected(RiskViolation),
}

impl RiskDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, RiskDecision::Approved)
    }
}

/// Validates proposed trades against the active profile and the portfolio.
pub struct RiskGate {
    ledger: Arc<dyn LedgerRead>,
    /// Round-trip taker fee rate assumed by the profitability floor
    round_trip_fee: Decimal,
    /// Whether the optional pre-execution profitability floor is applied
    check_fee_floor: bool,
}

impl RiskGate {
    pub fn new(ledger: Arc<dyn LedgerRead>, round_trip_fee: Decimal, check_fee_floor: bool) -> Self {
        Self {
            ledger,
            round_trip_fee,
            check_fee_floor,
        }
    }

    /// Validate a proposed trade. Checks run in order and short-circuit on
    /// the first violated constraint.
    pub fn approve(
        &self,
        trade: &ProposedTrade,
        profile: &RiskProfile,
        snapshot: &PortfolioSnapshot,
    ) -> Result<RiskDecision> {
        let total = snapshot.total_value;

        // 1. Leverage ceiling (profile cap, hard-capped above the boundary).
        let leverage_cap = effective_leverage_cap(profile, total);
        if trade.leverage > leverage_cap {
            return Ok(RiskDecision::Rejected(RiskViolation::LeverageExceeded {
                requested: trade.leverage,
                cap: leverage_cap,
            }));
        }

        // 2. Tier-scaled position cap on levered notional.
        let position_cap = tiered_position_cap(profile, total);
        let levered_notional = trade.notional() * trade.leverage;
        if levered_notional > position_cap {
            return Ok(RiskDecision::Rejected(RiskViolation::PositionCapExceeded {
                notional: levered_notional,
                cap: position_cap,
            }));
        }

        // 3. Daily loss budget against today's realized, side-signed P&L.
        let pnl = self.todays_realized_pnl()?;
        let loss_limit = profile.max_daily_loss_fraction * total;
        if pnl < -loss_limit {
            return Ok(RiskDecision::Rejected(RiskViolation::DailyLossBreached {
                pnl,
                limit: loss_limit,
            }));
        }

        // 4. Optional profitability floor: the trade must be worth its fees
        // at the profile's take-profit distance.
        if self.check_fee_floor {
            let expected = trade.notional() * profile.take_profit_pct;
            let fees = trade.notional() * self.round_trip_fee;
            if expected <= fees {
                return Ok(RiskDecision::Rejected(RiskViolation::NotWorthFees {
                    expected,
                    fees,
                }));
            }
        }

        debug!(
            symbol = %trade.symbol,
            side = trade.side.as_str(),
            quantity = %trade.quantity,
            leverage = %trade.leverage,
            "Trade approved"
        );
        Ok(RiskDecision::Approved)
    }

    /// Side-signed realized P&L for trades executed since midnight UTC:
    /// sells positive, buys negative, each weighted by price × amount.
    fn todays_realized_pnl(&self) -> Result<Decimal> {
        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is valid")
            .and_utc();

        let trades = self.ledger.trades_since(midnight)?;
        Ok(trades.iter().map(|t| t.signed_value()).sum())
    }
}
