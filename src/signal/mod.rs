//! Prediction-signal boundary and market regime classification.
//!
//! The price-direction model is an external collaborator consumed as an
//! opaque oracle: a confidence score in [0,1] plus a suggested action.
//! Model internals and retraining are out of scope.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::exchange::Candle;
use crate::utils::stats;

/// Suggested action from the prediction model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

/// An opaque model output: direction plus confidence in [0,1].
#[derive(Debug, Clone, Copy)]
pub struct Prediction {
    pub action: SignalAction,
    pub confidence: Decimal,
}

impl Prediction {
    /// Clamp confidence into [0,1] at the boundary so downstream risk logic
    /// never sees an out-of-range score.
    pub fn new(action: SignalAction, confidence: Decimal) -> Self {
        Self {
            action,
            confidence: confidence.clamp(Decimal::ZERO, Decimal::ONE),
        }
    }
}

/// External prediction model interface.
pub trait PredictionOracle: Send + Sync {
    fn predict(&self, latest: &Candle) -> Prediction;
}

/// Neutral oracle used when no model is wired in: always hold, zero
/// confidence, so leverage recommendations stay at their floor.
#[derive(Debug, Default)]
pub struct HoldOracle;

impl PredictionOracle for HoldOracle {
    fn predict(&self, _latest: &Candle) -> Prediction {
        Prediction::new(SignalAction::Hold, Decimal::ZERO)
    }
}

/// Coarse market regime derived from trailing closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketRegime {
    Bull,
    Bear,
    Sideways,
}

/// Mean daily return beyond this magnitude flags a trending regime.
const REGIME_DRIFT_THRESHOLD: Decimal = dec!(0.001);

impl MarketRegime {
    /// Classify from a trailing close series (oldest first).
    pub fn classify(closes: &[Decimal]) -> MarketRegime {
        let returns = stats::returns(closes);
        if returns.is_empty() {
            return MarketRegime::Sideways;
        }

        let drift = stats::mean(&returns);
        if drift > REGIME_DRIFT_THRESHOLD {
            MarketRegime::Bull
        } else if drift < -REGIME_DRIFT_THRESHOLD {
            MarketRegime::Bear
        } else {
            MarketRegime::Sideways
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{SymbolPair, VenueId};
    use chrono::Utc;

    #[test]
    fn test_confidence_clamped() {
        assert_eq!(
            Prediction::new(SignalAction::Buy, dec!(1.7)).confidence,
            Decimal::ONE
        );
        assert_eq!(
            Prediction::new(SignalAction::Sell, dec!(-0.3)).confidence,
            Decimal::ZERO
        );
    }

    #[test]
    fn test_hold_oracle_is_neutral() {
        let candle = Candle {
            symbol: SymbolPair::new("BTC", "USDT"),
            venue: VenueId::Binance,
            open: dec!(100),
            high: dec!(101),
            low: dec!(99),
            close: dec!(100),
            volume: dec!(1000),
            timestamp: Utc::now(),
        };

        let prediction = HoldOracle.predict(&candle);
        assert_eq!(prediction.action, SignalAction::Hold);
        assert_eq!(prediction.confidence, Decimal::ZERO);
    }

    #[test]
    fn test_regime_classification() {
        let rising: Vec<Decimal> = (0..30).map(|i| dec!(100) + Decimal::from(i)).collect();
        assert_eq!(MarketRegime::classify(&rising), MarketRegime::Bull);

        let falling: Vec<Decimal> = (0..30).map(|i| dec!(100) - Decimal::from(i)).collect();
        assert_eq!(MarketRegime::classify(&falling), MarketRegime::Bear);

        let flat = vec![dec!(100); 30];
        assert_eq!(MarketRegime::classify(&flat), MarketRegime::Sideways);
        assert_eq!(MarketRegime::classify(&[]), MarketRegime::Sideways);
    }
}
