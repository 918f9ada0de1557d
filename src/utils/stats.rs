//! Return-series statistics for sizing, hedging, and weight optimization.
//!
//! All inputs are close-price series ordered oldest to newest.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::decimal::safe_div;

/// Convert a close-price series into simple period-over-period returns.
///
/// A series of `n` closes yields `n - 1` returns. Zero closes are skipped
/// rather than dividing by zero.
pub fn returns(closes: &[Decimal]) -> Vec<Decimal> {
    closes
        .windows(2)
        .filter(|w| w[0] != Decimal::ZERO)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

/// Arithmetic mean. Empty input yields zero.
pub fn mean(values: &[Decimal]) -> Decimal {
    if values.is_empty() {
        return Decimal::ZERO;
    }
    let sum: Decimal = values.iter().copied().sum();
    sum / Decimal::from(values.len())
}

/// Population variance. Empty input yields zero.
pub fn variance(values: &[Decimal]) -> Decimal {
    if values.is_empty() {
        return Decimal::ZERO;
    }
    let m = mean(values);
    let sum_sq: Decimal = values.iter().map(|v| (*v - m) * (*v - m)).sum();
    sum_sq / Decimal::from(values.len())
}

/// Population standard deviation.
pub fn std_dev(values: &[Decimal]) -> Decimal {
    sqrt(variance(values))
}

/// Decimal square root via Newton-Raphson.
///
/// Negative inputs yield zero. Converges well within the iteration cap for
/// the magnitudes seen in return series and prices.
pub fn sqrt(value: Decimal) -> Decimal {
    if value <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let two = dec!(2);
    let mut guess = if value > Decimal::ONE { value / two } else { value };
    if guess == Decimal::ZERO {
        guess = value;
    }
    for _ in 0..32 {
        let next = (guess + value / guess) / two;
        if (next - guess).abs() < dec!(0.0000000001) {
            return next;
        }
        guess = next;
    }
    guess
}

/// Pearson correlation between two equally-long return series.
///
/// Returns zero when either side is degenerate (shorter than two samples or
/// zero variance).
pub fn correlation(a: &[Decimal], b: &[Decimal]) -> Decimal {
    let n = a.len().min(b.len());
    if n < 2 {
        return Decimal::ZERO;
    }
    let a = &a[..n];
    let b = &b[..n];

    let mean_a = mean(a);
    let mean_b = mean(b);

    let mut cov = Decimal::ZERO;
    let mut var_a = Decimal::ZERO;
    let mut var_b = Decimal::ZERO;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    let denom = sqrt(var_a) * sqrt(var_b);
    safe_div(cov, denom)
}

/// True-range-style volatility: mean absolute period-over-period move of the
/// last `period` intervals, relative to the latest close.
///
/// Yields a dimensionless fraction (0.02 = 2% average range per period).
pub fn true_range_volatility(closes: &[Decimal], period: usize) -> Decimal {
    if closes.len() < 2 {
        return Decimal::ZERO;
    }
    let start = closes.len().saturating_sub(period + 1);
    let window = &closes[start..];
    let ranges: Vec<Decimal> = window
        .windows(2)
        .filter(|w| w[0] != Decimal::ZERO)
        .map(|w| (w[1] - w[0]).abs() / w[0])
        .collect();
    mean(&ranges)
}
