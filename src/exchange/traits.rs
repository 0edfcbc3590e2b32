//! Venue-agnostic trading capability.
//!
//! The hedge engine only ever talks to venues through this trait, so a
//! Binance account, a second Binance account and the in-memory paper venue
//! are interchangeable from its point of view.

use async_trait::async_trait;

use super::error::ExchangeError;
use super::types::{Balance, Order, OrderRequest, Position, Ticker};

/// Order placement and account queries against one perpetuals venue.
#[async_trait]
pub trait ExchangeCapability: Send + Sync {
    /// Instance name for logs (e.g. "binance-a").
    fn name(&self) -> &str;

    /// Whether `initialize` has completed successfully.
    fn is_connected(&self) -> bool;

    /// Authenticate and load whatever metadata the venue needs.
    ///
    /// Calling this again after a successful run is a no-op.
    async fn initialize(&self) -> Result<(), ExchangeError>;

    /// Map a base symbol (e.g. "BTC") to the venue's contract identifier.
    async fn resolve_contract_id(&self, symbol: &str) -> Result<String, ExchangeError>;

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError>;

    /// Current position for `symbol`; `None` or a zero size both mean flat.
    async fn get_position(&self, symbol: &str) -> Result<Option<Position>, ExchangeError>;

    async fn get_balance(&self) -> Result<Balance, ExchangeError>;

    async fn place_order(&self, request: &OrderRequest) -> Result<Order, ExchangeError>;
}

