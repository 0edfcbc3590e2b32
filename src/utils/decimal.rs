//! Decimal arithmetic utilities for financial calculations.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

/// Round a decimal to a specific number of decimal places, half away from zero.
pub fn round_to_precision(value: Decimal, decimals: u32) -> Decimal {
    value.round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero)
}

/// Round up to the next multiple of the tick size.
pub fn round_up_to_tick(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size == Decimal::ZERO {
        return value;
    }
    (value / tick_size).ceil() * tick_size
}

/// Round down to the previous multiple of the tick size.
pub fn round_down_to_tick(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size == Decimal::ZERO {
        return value;
    }
    (value / tick_size).floor() * tick_size
}

/// Round down to lot size (quantity step).
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size == Decimal::ZERO {
        return value;
    }
    (value / lot_size).floor() * lot_size
}

/// Calculate percentage difference between two values.
pub fn percentage_diff(a: Decimal, b: Decimal) -> Decimal {
    if b == Decimal::ZERO {
        return Decimal::ZERO;
    }
    ((a - b) / b).abs() * dec!(100)
}
