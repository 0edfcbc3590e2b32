//! Order sizing and limit-price math for hedge legs.

use rust_decimal::Decimal;

use super::error::EngineError;
use crate::exchange::OrderSide;
use crate::utils::decimal::round_to_precision;

/// Decimal places kept on base-asset quantities.
pub const QUANTITY_DECIMALS: u32 = 6;

/// Base quantity for a USD notional at `reference_price`.
pub fn order_quantity(size_usd: Decimal, reference_price: Decimal) -> Result<Decimal, EngineError> {
    if reference_price <= Decimal::ZERO {
        return Err(EngineError::InvalidReferencePrice(reference_price));
    }
    let quantity = size_usd
        .checked_div(reference_price)
        .ok_or(EngineError::InvalidReferencePrice(reference_price))?;
    Ok(round_to_precision(quantity, QUANTITY_DECIMALS))
}

/// Marketable limit price: above the reference for buys, below it for sells.
pub fn slippage_price(price: Decimal, side: OrderSide, slippage: Decimal) -> Decimal {
    match side {
        OrderSide::Buy => price * (Decimal::ONE + slippage),
        OrderSide::Sell => price * (Decimal::ONE - slippage),
    }
}

/// Realized PnL of one leg opened on `side`.
pub fn leg_pnl(side: OrderSide, quantity: Decimal, entry: Decimal, exit: Decimal) -> Decimal {
    match side {
        OrderSide::Buy => (exit - entry) * quantity,
        OrderSide::Sell => (entry - exit) * quantity,
    }
}
