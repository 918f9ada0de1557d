//! Kelly-style position sizing and leverage recommendation.

use anyhow::Result;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::debug;

use crate::exchange::SymbolPair;
use crate::ledger::{PortfolioSnapshot, PriceHistory};
use crate::signal::MarketRegime;
use crate::utils::stats;

use super::gate::{effective_leverage_cap, tiered_position_cap};
use super::profile::RiskProfile;

/// Sizing parameters.
#[derive(Debug, Clone)]
pub struct SizingConfig {
    /// Number of historical closes feeding the Kelly estimate
    pub kelly_lookback: usize,
    /// Conservative floor for the Kelly fraction
    pub kelly_floor: Decimal,
    /// Ceiling for the Kelly fraction
    pub kelly_ceiling: Decimal,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            kelly_lookback: 20,
            kelly_floor: dec!(0.01),
            kelly_ceiling: dec!(0.5),
        }
    }
}

/// Variance below this is treated as degenerate rather than divided by.
const VARIANCE_EPSILON: Decimal = dec!(0.0000000001);

/// Kelly fraction over a return series: mean / variance, clamped to the
/// configured band. Degenerate (zero or near-zero) variance falls back to
/// the conservative floor instead of dividing by zero.
pub fn kelly_fraction(returns: &[Decimal], floor: Decimal, ceiling: Decimal) -> Decimal {
    let variance = stats::variance(returns);
    if variance < VARIANCE_EPSILON {
        return floor;
    }
    (stats::mean(returns) / variance).clamp(floor, ceiling)
}

/// Sizes positions relative to historical edge and the tiered position cap.
pub struct PositionSizer {
    history: Arc<dyn PriceHistory>,
    config: SizingConfig,
}

impl PositionSizer {
    pub fn new(history: Arc<dyn PriceHistory>, config: SizingConfig) -> Self {
        Self { history, config }
    }

    /// Shrink a requested base-unit amount to the Kelly-adjusted cap.
    ///
    /// The result is always in `[0, requested]` and the implied notional
    /// never exceeds the tiered position cap.
    pub fn adjust_size(
        &self,
        symbol: &SymbolPair,
        requested: Decimal,
        price: Decimal,
        profile: &RiskProfile,
        snapshot: &PortfolioSnapshot,
    ) -> Result<Decimal> {
        if requested <= Decimal::ZERO || price <= Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }

        let closes = self
            .history
            .get_closes(symbol, self.config.kelly_lookback + 1)?;
        let returns = stats::returns(&closes);
        let kelly = kelly_fraction(&returns, self.config.kelly_floor, self.config.kelly_ceiling);

        let cap_notional = tiered_position_cap(profile, snapshot.total_value);
        let kelly_cap = kelly * cap_notional / price;
        let approved = requested.min(kelly_cap).max(Decimal::ZERO);

        debug!(
            %symbol,
            %requested,
            %approved,
            %kelly,
            cap_notional = %cap_notional,
            "Position size adjusted"
        );
        Ok(approved)
    }
}

/// Regime- and confidence-aware leverage recommendation.
///
/// Conservative by construction: 1.0x in a bear regime or for small
/// portfolios, up to 3x only on high-confidence signals with meaningful
/// capital, and always re-capped by the profile and the large-portfolio
/// hard ceiling.
pub fn recommend_leverage(
    confidence: Decimal,
    regime: MarketRegime,
    profile: &RiskProfile,
    portfolio_value: Decimal,
) -> Decimal {
    let cap = effective_leverage_cap(profile, portfolio_value);

    let base = if regime == MarketRegime::Bear || portfolio_value < dec!(1000) {
        dec!(1.0)
    } else if confidence > dec!(0.8) && portfolio_value > dec!(5000) {
        dec!(3.0)
    } else {
        dec!(1.5)
    };

    base.min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Candle, VenueId};
    use crate::ledger::SqliteLedger;
    use chrono::{Duration, Utc};
    use std::collections::HashMap;

    fn btc() -> SymbolPair {
        SymbolPair::new("BTC", "USDT")
    }

    fn snapshot(total: Decimal) -> PortfolioSnapshot {
        PortfolioSnapshot {
            total_value: total,
            exposures: HashMap::new(),
            taken_at: Utc::now(),
        }
    }

    fn seeded_history(closes: &[Decimal]) -> Arc<SqliteLedger> {
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let count = closes.len() as i64;
        for (i, close) in closes.iter().enumerate() {
            let candle = Candle {
                symbol: btc(),
                venue: VenueId::Binance,
                open: *close,
                high: *close,
                low: *close,
                close: *close,
                volume: dec!(1000),
                timestamp: Utc::now() - Duration::minutes(count - i as i64),
            };
            ledger.record_candle(&candle).unwrap();
        }
        ledger
    }

    fn sizer(closes: &[Decimal]) -> PositionSizer {
        PositionSizer::new(seeded_history(closes), SizingConfig::default())
    }

    // =========================================================================
    // Kelly Fraction
    // =========================================================================

    #[test]
    fn test_kelly_clamped_to_band() {
        // Strong positive drift, tiny variance: raw kelly explodes, the
        // ceiling holds it at 0.5.
        let returns = vec![dec!(0.01), dec!(0.011), dec!(0.009), dec!(0.01)];
        let kelly = kelly_fraction(&returns, dec!(0.01), dec!(0.5));
        assert_eq!(kelly, dec!(0.5));

        // Negative drift clamps to the floor, never below.
        let returns = vec![dec!(-0.05), dec!(-0.04), dec!(-0.06)];
        let kelly = kelly_fraction(&returns, dec!(0.01), dec!(0.5));
        assert_eq!(kelly, dec!(0.01));
    }

    #[test]
    fn test_kelly_zero_variance_falls_back_to_floor() {
        // Identical returns: variance is exactly zero. Must not divide.
        let returns = vec![dec!(0.01); 20];
        let kelly = kelly_fraction(&returns, dec!(0.01), dec!(0.5));
        assert_eq!(kelly, dec!(0.01));

        // Empty history behaves the same.
        assert_eq!(kelly_fraction(&[], dec!(0.01), dec!(0.5)), dec!(0.01));
    }

    // =========================================================================
    // adjust_size
    // =========================================================================

    #[test]
    fn test_adjusted_size_never_exceeds_tiered_cap() {
        // Volatile history so kelly lands strictly inside the band.
        let closes: Vec<Decimal> = (0..21)
            .map(|i| dec!(100) + Decimal::from(i % 5))
            .collect();
        let sizer = sizer(&closes);
        let profile = RiskProfile::moderate();
        let snap = snapshot(dec!(5000)); // tiered cap = 0.10 * 5000 * 0.75 = 375

        let approved = sizer
            .adjust_size(&btc(), dec!(1000), dec!(100), &profile, &snap)
            .unwrap();

        assert!(approved >= Decimal::ZERO);
        // Implied notional stays under the tiered cap even before the kelly
        // haircut (kelly <= 0.5 of the cap).
        assert!(approved * dec!(100) <= dec!(375));
    }

    #[test]
    fn test_adjust_size_returns_requested_when_small() {
        let closes: Vec<Decimal> = (0..21)
            .map(|i| dec!(100) + Decimal::from(i % 3))
            .collect();
        let sizer = sizer(&closes);
        let profile = RiskProfile::aggressive();
        let snap = snapshot(dec!(500)); // cap = 0.20 * 500 = 100

        // Tiny request passes through unchanged.
        let approved = sizer
            .adjust_size(&btc(), dec!(0.001), dec!(100), &profile, &snap)
            .unwrap();
        assert_eq!(approved, dec!(0.001));
    }

    #[test]
    fn test_adjust_size_flat_history_uses_floor() {
        // Constant closes: zero variance, kelly floor applies, no panic.
        let closes = vec![dec!(100); 21];
        let sizer = sizer(&closes);
        let profile = RiskProfile::moderate();
        let snap = snapshot(dec!(5000)); // cap = 375, floor cap = 0.01*375/100

        let approved = sizer
            .adjust_size(&btc(), dec!(10), dec!(100), &profile, &snap)
            .unwrap();
        assert_eq!(approved, dec!(0.0375));
    }

    #[test]
    fn test_adjust_size_degenerate_inputs() {
        let sizer = sizer(&[]);
        let profile = RiskProfile::moderate();
        let snap = snapshot(dec!(5000));

        assert_eq!(
            sizer
                .adjust_size(&btc(), Decimal::ZERO, dec!(100), &profile, &snap)
                .unwrap(),
            Decimal::ZERO
        );
        assert_eq!(
            sizer
                .adjust_size(&btc(), dec!(1), Decimal::ZERO, &profile, &snap)
                .unwrap(),
            Decimal::ZERO
        );
    }

    // =========================================================================
    // Leverage Recommendation
    // =========================================================================

    #[test]
    fn test_bear_regime_pins_leverage_to_one() {
        let profile = RiskProfile::aggressive();
        let leverage =
            recommend_leverage(dec!(0.95), MarketRegime::Bear, &profile, dec!(20000));
        assert_eq!(leverage, dec!(1.0));
    }

    #[test]
    fn test_small_portfolio_pins_leverage_to_one() {
        let profile = RiskProfile::aggressive();
        let leverage =
            recommend_leverage(dec!(0.95), MarketRegime::Bull, &profile, dec!(500));
        assert_eq!(leverage, dec!(1.0));
    }

    #[test]
    fn test_high_confidence_unlocks_three_x() {
        let profile = RiskProfile::aggressive();
        let leverage =
            recommend_leverage(dec!(0.85), MarketRegime::Bull, &profile, dec!(20000));
        assert_eq!(leverage, dec!(3.0));

        // The profile cap binds first for a moderate profile.
        let profile = RiskProfile::moderate(); // max_leverage = 2.0
        let leverage =
            recommend_leverage(dec!(0.85), MarketRegime::Bull, &profile, dec!(20000));
        assert_eq!(leverage, dec!(2.0));
    }

    #[test]
    fn test_default_recommendation_is_one_and_a_half() {
        let profile = RiskProfile::aggressive();
        let leverage =
            recommend_leverage(dec!(0.5), MarketRegime::Sideways, &profile, dec!(20000));
        assert_eq!(leverage, dec!(1.5));
    }

    #[test]
    fn test_large_portfolio_ceiling_always_applies() {
        // Even a high-confidence bull signal is re-capped at 1.5x once the
        // portfolio crosses the hard boundary.
        let profile = RiskProfile::aggressive();
        let leverage =
            recommend_leverage(dec!(0.95), MarketRegime::Bull, &profile, dec!(60000));
        assert_eq!(leverage, dec!(1.5));
    }
}
