//! Binance USDⓈ-M futures integration.
//!
//! Each client instance wraps one API key pair, so two accounts on the same
//! venue can serve as the two hedge legs.

mod client;
mod types;

pub use client::{BinanceFuturesClient, ContractSpec};
