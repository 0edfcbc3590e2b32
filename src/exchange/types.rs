//! Venue-agnostic order, position and market data types.
//!
//! Every quantity and price is an exact [`Decimal`] and crosses serialization
//! boundaries as a decimal string.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// Time in force for limit orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc, // Good Till Cancel
    Ioc, // Immediate or Cancel
    Fok, // Fill or Kill
}

/// Order status after submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

/// Side of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that reduces a position on this side.
    pub fn closing_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }
}

/// Order submission request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub symbol: String,
    /// Venue-specific contract identifier (e.g. "BTCUSDT")
    pub contract_id: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    /// Base-asset quantity
    #[serde(with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
}

/// Order as acknowledged by a venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: String,
    pub symbol: String,
    pub contract_id: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    #[serde(with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub status: OrderStatus,
    #[serde(with = "rust_decimal::serde::str")]
    pub filled_quantity: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub avg_fill_price: Option<Decimal>,
}

impl Order {
    /// Best known execution price: average fill, falling back to the limit.
    pub fn execution_price(&self) -> Option<Decimal> {
        self.avg_fill_price
            .filter(|p| *p > Decimal::ZERO)
            .or(self.price)
    }
}

/// Open position on one venue.
///
/// `size` is always a non-negative magnitude; direction lives in `side`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub symbol: String,
    pub contract_id: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
    pub side: PositionSide,
    #[serde(with = "rust_decimal::serde::str")]
    pub entry_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub unrealized_pnl: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub margin_used: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub liquidation_price: Option<Decimal>,
}

impl Position {
    /// Build a position from a signed amount (negative = short).
    pub fn from_signed(
        symbol: &str,
        contract_id: &str,
        signed_size: Decimal,
        entry_price: Decimal,
    ) -> Self {
        let side = if signed_size < Decimal::ZERO {
            PositionSide::Short
        } else {
            PositionSide::Long
        };
        Self {
            symbol: symbol.to_string(),
            contract_id: contract_id.to_string(),
            size: signed_size.abs(),
            side,
            entry_price,
            unrealized_pnl: Decimal::ZERO,
            margin_used: Decimal::ZERO,
            liquidation_price: None,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.size.is_zero()
    }
}

/// Whether a venue position report means "nothing open".
pub fn is_flat(position: &Option<Position>) -> bool {
    position.as_ref().map_or(true, Position::is_flat)
}

/// Latest trade price for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub last_price: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub bid_price: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub ask_price: Option<Decimal>,
    pub timestamp: i64,
}

/// Collateral balance of an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub total: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub available: Decimal,
}
