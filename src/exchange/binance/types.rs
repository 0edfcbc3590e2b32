//! Type definitions for Binance USDⓈ-M futures API responses.

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::exchange::types::{OrderSide, OrderStatus, TimeInForce};

/// Exchange information for futures.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuturesExchangeInfo {
    pub symbols: Vec<FuturesSymbolInfo>,
}

/// Symbol information for futures.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuturesSymbolInfo {
    pub symbol: String,
    pub quantity_precision: u32,
    pub price_precision: u32,
    pub contract_type: String,
    pub status: String,
    pub base_asset: String,
    pub quote_asset: String,
    #[serde(default)]
    pub filters: Vec<SymbolFilter>,
}

impl FuturesSymbolInfo {
    /// Tradable USDT-margined perpetual.
    pub fn is_tradable_perpetual(&self) -> bool {
        self.contract_type == "PERPETUAL" && self.status == "TRADING" && self.quote_asset == "USDT"
    }

    /// PRICE_FILTER tick size, falling back to `pricePrecision`.
    pub fn tick_size(&self) -> Decimal {
        self.filters
            .iter()
            .find_map(|f| match f {
                SymbolFilter::PriceFilter { tick_size } if *tick_size > Decimal::ZERO => {
                    Some(*tick_size)
                }
                _ => None,
            })
            .unwrap_or_else(|| Decimal::new(1, self.price_precision))
    }

    /// LOT_SIZE step size, falling back to `quantityPrecision`.
    pub fn step_size(&self) -> Decimal {
        self.filters
            .iter()
            .find_map(|f| match f {
                SymbolFilter::LotSize { step_size } if *step_size > Decimal::ZERO => {
                    Some(*step_size)
                }
                _ => None,
            })
            .unwrap_or_else(|| Decimal::new(1, self.quantity_precision))
    }
}

/// Trading rule attached to a symbol. Only the price and lot filters are read.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "filterType")]
pub enum SymbolFilter {
    #[serde(rename = "PRICE_FILTER")]
    PriceFilter {
        #[serde(rename = "tickSize", with = "rust_decimal::serde::str")]
        tick_size: Decimal,
    },
    #[serde(rename = "LOT_SIZE")]
    LotSize {
        #[serde(rename = "stepSize", with = "rust_decimal::serde::str")]
        step_size: Decimal,
    },
    #[serde(other)]
    Other,
}

/// Latest price for a symbol.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceTicker {
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(default)]
    pub time: i64,
}

/// Account balance information.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountBalance {
    pub asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub margin_balance: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub available_balance: Decimal,
}

/// Futures position information (`/fapi/v2/positionRisk`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRisk {
    #[serde(with = "rust_decimal::serde::str")]
    pub position_amt: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub entry_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub unrealized_profit: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub liquidation_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub leverage: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub notional: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub isolated_margin: Decimal,
}

/// Order side on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WireSide {
    Buy,
    Sell,
}

impl From<WireSide> for OrderSide {
    fn from(side: WireSide) -> Self {
        match side {
            WireSide::Buy => OrderSide::Buy,
            WireSide::Sell => OrderSide::Sell,
        }
    }
}

/// Order status on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireOrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    ExpiredInMatch,
}

impl From<WireOrderStatus> for OrderStatus {
    fn from(status: WireOrderStatus) -> Self {
        match status {
            WireOrderStatus::New => OrderStatus::New,
            WireOrderStatus::PartiallyFilled => OrderStatus::PartiallyFilled,
            WireOrderStatus::Filled => OrderStatus::Filled,
            WireOrderStatus::Canceled => OrderStatus::Canceled,
            WireOrderStatus::Rejected => OrderStatus::Rejected,
            WireOrderStatus::Expired | WireOrderStatus::ExpiredInMatch => OrderStatus::Expired,
        }
    }
}

/// Time in force on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WireTimeInForce {
    Gtc,
    Ioc,
    Fok,
    Gtx,
    Gtd,
}

impl From<WireTimeInForce> for TimeInForce {
    fn from(tif: WireTimeInForce) -> Self {
        match tif {
            WireTimeInForce::Ioc => TimeInForce::Ioc,
            WireTimeInForce::Fok => TimeInForce::Fok,
            WireTimeInForce::Gtc | WireTimeInForce::Gtx | WireTimeInForce::Gtd => TimeInForce::Gtc,
        }
    }
}

/// Order response from the exchange.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: i64,
    pub symbol: String,
    pub status: WireOrderStatus,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub avg_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub orig_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub executed_qty: Decimal,
    pub side: WireSide,
    pub time_in_force: Option<WireTimeInForce>,
    #[serde(default)]
    pub reduce_only: bool,
}

/// Error payload returned with non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    pub msg: String,
}
