//! Decimal arithmetic utilities for price and indicator calculations.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

/// Upbit accepts at most 8 decimal places for order volume.
pub const VOLUME_DECIMALS: u32 = 8;

/// Round down to a fixed number of decimal places (never oversell).
pub fn round_down_dp(value: Decimal, decimals: u32) -> Decimal {
    value.round_dp_with_strategy(decimals, RoundingStrategy::ToZero)
}

/// Percentage change from `from` to `to`.
pub fn percent_change(from: Decimal, to: Decimal) -> Decimal {
    if from == Decimal::ZERO {
        return Decimal::ZERO;
    }
    (to - from) / from * dec!(100)
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Arithmetic mean, `None` for an empty slice.
pub fn mean(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    let sum: Decimal = values.iter().sum();
    Some(sum / Decimal::from(values.len()))
}

/// Weighted average of `(value, weight)` pairs, `None` if the weights sum to zero.
pub fn weighted_average(values: &[(Decimal, Decimal)]) -> Option<Decimal> {
    let (sum, weight_sum) = values.iter().fold(
        (Decimal::ZERO, Decimal::ZERO),
        |(sum, weight_sum), (val, weight)| (sum + val * weight, weight_sum + weight),
    );

    if weight_sum == Decimal::ZERO {
        None
    } else {
        Some(sum / weight_sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_down_dp() {
        assert_eq!(round_down_dp(dec!(1.123456789), 8), dec!(1.12345678));
        assert_eq!(round_down_dp(dec!(0.999999999), 8), dec!(0.99999999));
    }

    #[test]
    fn test_percent_change() {
        assert_eq!(percent_change(dec!(100), dec!(103)), dec!(3));
        assert_eq!(percent_change(Decimal::ZERO, dec!(103)), Decimal::ZERO);
    }

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[dec!(1), dec!(2), dec!(3)]), Some(dec!(2)));
        assert_eq!(mean(&[]), None);
    }

    #[test]
    fn test_weighted_average() {
        let values = vec![
            (dec!(100), dec!(2)), // 100 with weight 2
            (dec!(200), dec!(1)), // 200 with weight 1
        ];
        // (100*2 + 200*1) / (2+1) = 400/3 ≈ 133.33
        let avg = weighted_average(&values).unwrap();
        assert!(avg > dec!(133) && avg < dec!(134));

        assert_eq!(weighted_average(&[(dec!(100), Decimal::ZERO)]), None);
    }

    #[test]
    fn test_safe_div() {
        assert_eq!(safe_div(dec!(10000), dec!(200)), dec!(50));
        assert_eq!(safe_div(dec!(10000), Decimal::ZERO), Decimal::ZERO);
    }
}
