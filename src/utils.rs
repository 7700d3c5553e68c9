//! Conversions from the protocol's fixed-point encodings.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::DecodeError;

/// Ray precision: rates carry an implicit denominator of 10^27.
pub const RAY_DECIMALS: u32 = 27;

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

fn non_negative(field: &'static str, raw: i128) -> Result<i128, DecodeError> {
    if raw < 0 {
        return Err(DecodeError::NegativeValue {
            field,
            value: raw.to_string(),
        });
    }
    Ok(raw)
}

fn scaled(field: &'static str, raw: i128, scale: u32) -> Result<Decimal, DecodeError> {
    if scale > Decimal::MAX_SCALE {
        return Err(DecodeError::UnsupportedDecimals(scale));
    }
    Decimal::try_from_i128_with_scale(non_negative(field, raw)?, scale)
        .map_err(|_| DecodeError::OutOfRange { field })
}

/// Ray-scaled rate to a percentage, e.g. `1.78e25` -> `1.78`.
pub fn ray_to_percent(ray_value: i128) -> Result<Decimal, DecodeError> {
    let fraction = scaled("rate", ray_value, RAY_DECIMALS)?;
    fraction
        .checked_mul(HUNDRED)
        .map(|p| p.normalize())
        .ok_or(DecodeError::OutOfRange { field: "rate" })
}

/// Token-decimal amount to a human amount.
pub fn to_human_amount(raw_amount: i128, decimals: u32) -> Result<Decimal, DecodeError> {
    scaled("amount", raw_amount, decimals).map(|d| d.normalize())
}

/// `borrowed / (borrowed + liquidity)` as a percentage, clamped to [0, 100].
///
/// An empty pool reports 0%.
pub fn calculate_utilization(total_borrowed: Decimal, available_liquidity: Decimal) -> Decimal {
    let borrowed = total_borrowed.max(Decimal::ZERO);
    let total = match borrowed.checked_add(available_liquidity.max(Decimal::ZERO)) {
        Some(total) if !total.is_zero() => total,
        _ => return Decimal::ZERO,
    };
    let ratio = borrowed
        .checked_div(total)
        .and_then(|r| r.checked_mul(HUNDRED))
        .unwrap_or(Decimal::ZERO);
    ratio.clamp(Decimal::ZERO, HUNDRED).normalize()
}

/// Half-up rounding for display.
pub fn round_display(value: Decimal, dp: u32) -> Decimal {
    value.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero)
}

/// Rounded for display only.
pub fn round_percent(value: Decimal) -> Decimal {
    round_display(value, 2)
}
