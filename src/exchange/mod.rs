//! Exchange integrations for hedge cycles.
//!
//! ## Capability
//! [`ExchangeCapability`] is the uniform interface the hedge engine drives:
//! contract resolution, tickers, positions, balances and order placement.
//!
//! ## Binance
//! USDⓈ-M futures REST adapter with signed requests.
//!
//! ## Paper
//! In-memory simulated venue for dry runs and tests.

pub mod binance;
mod error;
pub mod paper;
mod traits;
mod types;

pub use binance::BinanceFuturesClient;
pub use error::ExchangeError;
pub use paper::PaperExchange;
pub use traits::ExchangeCapability;
pub use types::*;
