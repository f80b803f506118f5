//! Fixed-point LMSR pricing kernel.
//!
//! Cost function: C(q_yes, q_no) = b * ln(e^(q_yes/b) + e^(q_no/b)),
//! stabilized by factoring out the larger quantity:
//! C = max(q_yes, q_no) + b * ln(1 + e^(-|q_yes - q_no|/b)).
//!
//! Quantities are micro-shares, monetary values micro-units, and the
//! liquidity parameter is PRECISION-scaled. All arithmetic runs on u128
//! with checked operations; the kernel never touches floating point.
//! Public surface intentionally small.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::KernelError;

/// Fixed-point scale factor: 1 unit = 10^6 micro-units.
pub const PRECISION: u64 = 1_000_000;

const P: u128 = PRECISION as u128;

/// ln(2) scaled by PRECISION.
const LN2: u128 = 693_147;

/// Exponent magnitude beyond which e^x saturates.
const EXP_SATURATION_INPUT: u128 = 500 * P;

/// Saturated e^x for out-of-range exponents: 10^15, PRECISION-scaled.
const EXP_SATURATION_VALUE: u128 = 1_000_000_000_000_000 * P;

/// Soft cap on intermediates. Exceeding it means a pricing-layer bug,
/// not a user error.
const SOFT_CAP: u128 = 10u128.pow(36);

/// Prices are clamped so they never reach 0 or PRECISION exactly.
pub const MIN_PRICE: u64 = PRECISION / 1000;
pub const MAX_PRICE: u64 = PRECISION - PRECISION / 1000;

/// Which side of an option a trade touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "yes",
            Side::No => "no",
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "yes" => Ok(Side::Yes),
            "no" => Ok(Side::No),
            other => Err(format!("invalid side: '{other}', expected 'yes' or 'no'")),
        }
    }
}

fn guard(value: u128) -> Result<u128, KernelError> {
    if value > SOFT_CAP {
        Err(KernelError::ArithmeticOverflow)
    } else {
        Ok(value)
    }
}

fn mul(a: u128, b: u128) -> Result<u128, KernelError> {
    a.checked_mul(b)
        .ok_or(KernelError::ArithmeticOverflow)
        .and_then(guard)
}

/// e^x for non-negative PRECISION-scaled x, as a PRECISION-scaled value.
///
/// Four-term Taylor series: 1 + x + x²/2 + x³/6 + x⁴/24. Trades keep
/// |q_yes - q_no| / b far below the saturation band, where the series
/// holds to better than quote granularity.
pub(crate) fn exp_scaled(x: u128) -> Result<u128, KernelError> {
    if x > EXP_SATURATION_INPUT {
        return Ok(EXP_SATURATION_VALUE);
    }
    let x2 = mul(x, x)?;
    let x3 = mul(x2, x)?;
    let x4 = mul(x3, x)?;
    let sum = P + x + x2 / (2 * P) + x3 / (6 * P * P) + x4 / (24 * P * P * P);
    guard(sum)
}

/// e^(-x): computed as PRECISION² / e^x so small results keep precision.
pub(crate) fn exp_neg_scaled(x: u128) -> Result<u128, KernelError> {
    if x > EXP_SATURATION_INPUT {
        return Ok(1);
    }
    let exp_x = exp_scaled(x)?;
    Ok(((P * P) / exp_x).max(1))
}

/// ln(1 + e^(-t)) for non-negative PRECISION-scaled t.
///
/// Small t: ln(2) - t/2 + t²/8. Medium t: ln(1 + y) ≈ y - y²/2 + y³/3
/// with y = e^(-t). Large t: 0.
fn ln_one_plus_exp_neg(t: u128) -> Result<u128, KernelError> {
    if t > EXP_SATURATION_INPUT {
        return Ok(0);
    }
    if t < P {
        let quadratic = mul(t, t)? / (8 * P);
        // t/2 <= P/2 < LN2, so the subtraction cannot underflow.
        return Ok(LN2 + quadratic - t / 2);
    }
    let y = exp_neg_scaled(t)?;
    let y2 = mul(y, y)? / (2 * P);
    let y3 = mul(mul(y, y)?, y)? / (3 * P * P);
    Ok((y + y3).saturating_sub(y2))
}

/// Total cost to reach the inventory state (q_yes, q_no), in micro-units.
pub fn cost_function(yes: u64, no: u64, b: u64) -> Result<u64, KernelError> {
    if b == 0 {
        return Err(KernelError::DivisionByZero);
    }
    let (larger, diff) = if yes >= no {
        (yes, yes - no)
    } else {
        (no, no - yes)
    };
    let x = mul(diff as u128, P)? / b as u128;
    let tail = mul(b as u128, ln_one_plus_exp_neg(x)?)? / P;
    let total = guard(larger as u128 + tail)?;
    u64::try_from(total).map_err(|_| KernelError::ArithmeticOverflow)
}

/// Instantaneous YES price, PRECISION-scaled and clamped to
/// [MIN_PRICE, MAX_PRICE]: 1 / (1 + e^((q_no - q_yes)/b)).
pub fn calculate_yes_price(yes: u64, no: u64, b: u64) -> Result<u64, KernelError> {
    if b == 0 {
        return Err(KernelError::DivisionByZero);
    }
    let exp_term = if no >= yes {
        exp_scaled(mul((no - yes) as u128, P)? / b as u128)?
    } else {
        exp_neg_scaled(mul((yes - no) as u128, P)? / b as u128)?
    };
    let price = (P * P) / (P + exp_term);
    Ok((price as u64).clamp(MIN_PRICE, MAX_PRICE))
}

/// NO price is the complement of the YES price by construction, so the
/// two always sum to PRECISION exactly.
pub fn calculate_no_price(yes: u64, no: u64, b: u64) -> Result<u64, KernelError> {
    Ok(PRECISION - calculate_yes_price(yes, no, b)?)
}

/// Cost of adding (delta_yes, delta_no) to the current inventory:
/// C(after) - C(before).
pub fn calculate_buy_cost(
    yes: u64,
    no: u64,
    delta_yes: u64,
    delta_no: u64,
    b: u64,
) -> Result<u64, KernelError> {
    let new_yes = yes
        .checked_add(delta_yes)
        .ok_or(KernelError::ArithmeticOverflow)?;
    let new_no = no
        .checked_add(delta_no)
        .ok_or(KernelError::ArithmeticOverflow)?;
    let before = cost_function(yes, no, b)?;
    let after = cost_function(new_yes, new_no, b)?;
    // The cost function is monotone in each quantity; a negative
    // difference here is a numerics bug.
    after
        .checked_sub(before)
        .ok_or(KernelError::ArithmeticUnderflow("buy cost went negative"))
}

/// Payout for removing (delta_yes, delta_no) from the current inventory:
/// C(before) - C(after). Fails when a delta exceeds the outstanding side.
pub fn calculate_sell_payout(
    yes: u64,
    no: u64,
    delta_yes: u64,
    delta_no: u64,
    b: u64,
) -> Result<u64, KernelError> {
    if delta_yes > yes || delta_no > no {
        return Err(KernelError::ArithmeticUnderflow(
            "sell exceeds outstanding shares",
        ));
    }
    let before = cost_function(yes, no, b)?;
    let after = cost_function(yes - delta_yes, no - delta_no, b)?;
    before
        .checked_sub(after)
        .ok_or(KernelError::ArithmeticUnderflow("sell payout went negative"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// b = 1000 units, PRECISION-scaled.
    const B: u64 = 1_000_000_000;

    #[test]
    fn exp_of_zero_is_one() {
        assert_eq!(exp_scaled(0).unwrap(), P);
    }

    #[test]
    fn exp_of_one_is_close_to_e() {
        // Four Taylor terms give 2.708333; e = 2.718282.
        let result = exp_scaled(P).unwrap();
        let expected = 2_718_281u128;
        assert!(expected.abs_diff(result) < P / 50, "e^1 = {result}");
    }

    #[test]
    fn exp_saturates_above_the_band() {
        assert_eq!(exp_scaled(501 * P).unwrap(), EXP_SATURATION_VALUE);
        assert_eq!(exp_neg_scaled(501 * P).unwrap(), 1);
    }

    #[test]
    fn cost_of_empty_market_is_b_ln_two() {
        let cost = cost_function(0, 0, B).unwrap();
        // 1000 * ln(2) = 693.147 units.
        assert_eq!(cost, 693_147_000);
    }

    #[test]
    fn balanced_market_prices_at_half() {
        assert_eq!(calculate_yes_price(0, 0, B).unwrap(), PRECISION / 2);
        assert_eq!(calculate_no_price(0, 0, B).unwrap(), PRECISION / 2);
    }

    #[test]
    fn prices_are_clamped_at_extremes() {
        // 400 units of one-sided YES inventory against b = 1: deep in the
        // saturation regime.
        let p = calculate_yes_price(400_000_000, 0, PRECISION).unwrap();
        assert_eq!(p, MAX_PRICE);
        let p = calculate_yes_price(0, 400_000_000, PRECISION).unwrap();
        assert_eq!(p, MIN_PRICE);
    }

    #[test]
    fn hundred_share_buy_moves_price_and_costs_half() {
        // Buying 100 shares into an empty b=1000 market costs ~51.25 units
        // and lifts the YES quote to ~0.525.
        let cost = calculate_buy_cost(0, 0, 100_000_000, 0, B).unwrap();
        assert!(
            (50_000_000..53_000_000).contains(&cost),
            "cost = {cost}"
        );
        let p = calculate_yes_price(100_000_000, 0, B).unwrap();
        assert!((520_000..530_000).contains(&p), "p = {p}");
    }

    #[test]
    fn zero_delta_buy_costs_nothing() {
        assert_eq!(calculate_buy_cost(5_000_000, 3_000_000, 0, 0, B).unwrap(), 0);
    }

    #[test]
    fn zero_liquidity_parameter_is_rejected() {
        assert_eq!(
            cost_function(1, 1, 0).unwrap_err(),
            KernelError::DivisionByZero
        );
        assert_eq!(
            calculate_yes_price(1, 1, 0).unwrap_err(),
            KernelError::DivisionByZero
        );
    }

    #[test]
    fn overselling_fails_with_underflow() {
        let err = calculate_sell_payout(100, 0, 200, 0, B).unwrap_err();
        assert!(matches!(err, KernelError::ArithmeticUnderflow(_)));
    }

    #[test]
    fn round_trip_never_profits() {
        let delta = 50_000_000u64;
        let cost = calculate_buy_cost(0, 0, delta, 0, B).unwrap();
        let payout = calculate_sell_payout(delta, 0, delta, 0, B).unwrap();
        assert!(payout <= cost, "payout {payout} > cost {cost}");
    }

    proptest! {
        #[test]
        fn prices_sum_to_precision(
            yes in 0u64..2_000_000_000,
            no in 0u64..2_000_000_000,
            b in 1_000_000u64..100_000_000_000,
        ) {
            let p_yes = calculate_yes_price(yes, no, b).unwrap();
            let p_no = calculate_no_price(yes, no, b).unwrap();
            prop_assert_eq!(p_yes + p_no, PRECISION);
        }

        #[test]
        fn prices_stay_inside_the_clamp(
            yes in 0u64..2_000_000_000,
            no in 0u64..2_000_000_000,
            b in 1_000_000u64..100_000_000_000,
        ) {
            let p = calculate_yes_price(yes, no, b).unwrap();
            prop_assert!(p >= MIN_PRICE && p <= MAX_PRICE);
        }

        #[test]
        fn cost_dominates_the_larger_inventory(
            yes in 0u64..2_000_000_000,
            no in 0u64..2_000_000_000,
            b in 1_000_000u64..100_000_000_000,
        ) {
            let cost = cost_function(yes, no, b).unwrap();
            prop_assert!(cost >= yes.max(no));
        }

        #[test]
        fn buy_cost_is_monotone_in_quantity(
            yes in 0u64..500_000_000,
            no in 0u64..500_000_000,
            delta in 1_000_000u64..200_000_000,
        ) {
            let small = calculate_buy_cost(yes, no, delta, 0, B).unwrap();
            let large = calculate_buy_cost(yes, no, delta * 2, 0, B).unwrap();
            prop_assert!(large > small, "large {} <= small {}", large, small);
        }

        #[test]
        fn round_trip_loss_is_bounded_for_small_trades(
            yes in 100_000_000u64..500_000_000,
            no in 100_000_000u64..500_000_000,
        ) {
            // Trades at <= 10% of the pooled inventory lose at most 10% of
            // the entry cost to price impact on an immediate exit.
            let delta = (yes + no) / 10;
            let cost = calculate_buy_cost(yes, no, delta, 0, B).unwrap();
            let payout = calculate_sell_payout(yes + delta, no, delta, 0, B).unwrap();
            prop_assert!(payout <= cost);
            prop_assert!(cost - payout <= cost / 10, "spread {} on cost {}", cost - payout, cost);
        }
    }
}
