//! Named risk limit bundles.

use anyhow::{bail, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// A named bundle of risk limits. One profile is active at a time; swapping
/// profiles takes effect on the next risk check, not retroactively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskProfile {
    pub name: String,
    /// Maximum position notional as a fraction of portfolio value (0.0-1.0)
    pub max_position_fraction: Decimal,
    /// Daily loss budget as a fraction of portfolio value (0.0-1.0)
    pub max_daily_loss_fraction: Decimal,
    /// Stop-loss distance as a fraction of entry price
    pub stop_loss_pct: Decimal,
    /// Take-profit distance as a fraction of entry price
    pub take_profit_pct: Decimal,
    pub max_leverage: Decimal,
}

impl RiskProfile {
    pub fn conservative() -> Self {
        Self {
            name: "conservative".to_string(),
            max_position_fraction: dec!(0.05),
            max_daily_loss_fraction: dec!(0.01),
            stop_loss_pct: dec!(0.02),
            take_profit_pct: dec!(0.04),
            max_leverage: dec!(1.0),
        }
    }

    pub fn moderate() -> Self {
        Self {
            name: "moderate".to_string(),
            max_position_fraction: dec!(0.10),
            max_daily_loss_fraction: dec!(0.02),
            stop_loss_pct: dec!(0.03),
            take_profit_pct: dec!(0.06),
            max_leverage: dec!(2.0),
        }
    }

    pub fn aggressive() -> Self {
        Self {
            name: "aggressive".to_string(),
            max_position_fraction: dec!(0.20),
            max_daily_loss_fraction: dec!(0.05),
            stop_loss_pct: dec!(0.05),
            take_profit_pct: dec!(0.10),
            max_leverage: dec!(3.0),
        }
    }

    /// Resolve a profile by name.
    pub fn named(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "conservative" => Ok(Self::conservative()),
            "moderate" => Ok(Self::moderate()),
            "aggressive" => Ok(Self::aggressive()),
            other => bail!("unknown risk profile '{}'", other),
        }
    }
}

impl Default for RiskProfile {
    fn default() -> Self {
        Self::moderate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_lookup() {
        assert_eq!(RiskProfile::named("conservative").unwrap().max_leverage, dec!(1.0));
        assert_eq!(RiskProfile::named("AGGRESSIVE").unwrap().max_leverage, dec!(3.0));
        assert!(RiskProfile::named("yolo").is_err());
    }

    #[test]
    fn test_presets_are_ordered_by_appetite() {
        let c = RiskProfile::conservative();
        let m = RiskProfile::moderate();
        let a = RiskProfile::aggressive();

        assert!(c.max_position_fraction < m.max_position_fraction);
        assert!(m.max_position_fraction < a.max_position_fraction);
        assert!(c.max_daily_loss_fraction < a.max_daily_loss_fraction);
        assert!(c.max_leverage < a.max_leverage);
    }
}
