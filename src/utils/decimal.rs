//! Decimal arithmetic utilities for sizes, prices and exposure checks.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Round a decimal to a specific number of decimal places.
pub fn round_to_precision(value: Decimal, decimals: u32) -> Decimal {
    value.round_dp(decimals)
}

/// Round to tick size (e.g., 0.1 for BTC perpetual prices).
pub fn round_to_tick(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size == Decimal::ZERO {
        return value;
    }
    (value / tick_size).round() * tick_size
}

/// Convert basis points to decimal rate
pub fn from_basis_points(bps: Decimal) -> Decimal {
    bps / dec!(10000)
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Midpoint of a bid/ask pair.
pub fn mid(bid: Decimal, ask: Decimal) -> Decimal {
    (bid + ask) / dec!(2)
}

/// True when a signed position is small enough to count as flat.
pub fn is_dust(position: Decimal, tolerance: Decimal) -> bool {
    position.abs() < tolerance
}

/// True when `after` sits on the opposite side of zero from `before`,
/// beyond the dust tolerance.
pub fn sign_flipped(before: Decimal, after: Decimal, tolerance: Decimal) -> bool {
    (before > Decimal::ZERO && after < -tolerance) || (before < Decimal::ZERO && after > tolerance)
}

/// Lossy conversion from a sampled float, falling back to zero on NaN/inf.
pub fn from_f64(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_to_tick() {
        assert_eq!(round_to_tick(dec!(50123.456), dec!(0.1)), dec!(50123.5));
        assert_eq!(round_to_tick(dec!(50123.44), dec!(0.1)), dec!(50123.4));
        assert_eq!(round_to_tick(dec!(50123.456), dec!(1)), dec!(50123));
    }

    #[test]
    fn test_basis_points() {
        assert_eq!(from_basis_points(dec!(4)), dec!(0.0004));
        assert_eq!(from_basis_points(dec!(50)), dec!(0.005));
    }

    #[test]
    fn test_dust_and_sign_flip() {
        let tol = dec!(0.000005);
        assert!(is_dust(dec!(0.000004), tol));
        assert!(!is_dust(dec!(-0.00001), tol));

        assert!(sign_flipped(dec!(0.02), dec!(-0.001), tol));
        assert!(sign_flipped(dec!(-0.02), dec!(0.001), tol));
        // Crossing into dust on the other side is not a flip
        assert!(!sign_flipped(dec!(0.02), dec!(-0.000001), tol));
        assert!(!sign_flipped(dec!(0.02), dec!(0.01), tol));
    }

    #[test]
    fn test_mid_and_safe_div() {
        assert_eq!(mid(dec!(49990), dec!(50010)), dec!(50000));
        assert_eq!(safe_div(dec!(1), Decimal::ZERO), Decimal::ZERO);
    }
}
