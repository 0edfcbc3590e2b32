//! In-memory paper venue for dry runs and tests.

use super::error::ExchangeError;
use super::traits::ExchangeCapability;
use super::types::*;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Simulated position (signed quantity, negative = short).
#[derive(Debug, Clone, Default)]
pub struct PaperPosition {
    pub symbol: String,
    pub qty: Decimal,
    pub entry_price: Decimal,
}

/// Paper account state.
#[derive(Debug, Clone)]
pub struct PaperState {
    pub initial_balance: Decimal,
    pub balance: Decimal,
    pub positions: HashMap<String, PaperPosition>,
    pub realized_pnl: Decimal,
    pub total_trading_fees: Decimal,
    pub order_count: u64,
    /// Every request that reached the venue, in submission order
    pub order_log: Vec<OrderRequest>,
}

impl PaperState {
    fn new(initial_balance: Decimal) -> Self {
        Self {
            initial_balance,
            balance: initial_balance,
            positions: HashMap::new(),
            realized_pnl: Decimal::ZERO,
            total_trading_fees: Decimal::ZERO,
            order_count: 0,
            order_log: Vec::new(),
        }
    }
}

/// Simulated perpetuals venue.
///
/// IOC limit orders fill in full at the current price when marketable and
/// expire otherwise. Faults and latency can be injected for tests.
pub struct PaperExchange {
    name: String,
    state: Arc<RwLock<PaperState>>,
    prices: Arc<RwLock<HashMap<String, Decimal>>>,
    order_id_counter: AtomicU64,
    /// Trading fee rate (0.04% taker)
    fee_rate: Decimal,
    latency: Duration,
    connected: AtomicBool,
    initialize_calls: AtomicUsize,
    order_failures: AtomicUsize,
    position_failures: AtomicUsize,
    sticky_orders: AtomicBool,
}

impl PaperExchange {
    /// Create a new paper venue with an initial USDT balance.
    pub fn new(name: impl Into<String>, initial_balance: Decimal) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(RwLock::new(PaperState::new(initial_balance))),
            prices: Arc::new(RwLock::new(HashMap::new())),
            order_id_counter: AtomicU64::new(1),
            fee_rate: dec!(0.0004),
            latency: Duration::ZERO,
            connected: AtomicBool::new(false),
            initialize_calls: AtomicUsize::new(0),
            order_failures: AtomicUsize::new(0),
            position_failures: AtomicUsize::new(0),
            sticky_orders: AtomicBool::new(false),
        }
    }

    /// Delay every venue call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Set the simulated last price for a symbol. Unpriced symbols are unknown.
    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.write().await.insert(symbol.to_string(), price);
    }

    /// Force a position into the account without trading.
    pub async fn seed_position(&self, symbol: &str, qty: Decimal, entry_price: Decimal) {
        let mut state = self.state.write().await;
        state.positions.insert(
            symbol.to_string(),
            PaperPosition {
                symbol: symbol.to_string(),
                qty,
                entry_price,
            },
        );
    }

    /// Fail the next `count` order submissions with a network error.
    pub fn fail_next_orders(&self, count: usize) {
        self.order_failures.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` position queries with a network error.
    pub fn fail_next_position_queries(&self, count: usize) {
        self.position_failures.store(count, Ordering::SeqCst);
    }

    /// Accept orders without ever filling them.
    pub fn set_sticky_orders(&self, sticky: bool) {
        self.sticky_orders.store(sticky, Ordering::SeqCst);
    }

    pub fn initialize_count(&self) -> usize {
        self.initialize_calls.load(Ordering::SeqCst)
    }

    /// Snapshot of the account state.
    pub async fn get_state(&self) -> PaperState {
        self.state.read().await.clone()
    }

    /// Requests submitted so far.
    pub async fn order_log(&self) -> Vec<OrderRequest> {
        self.state.read().await.order_log.clone()
    }

    /// Signed position quantity for a symbol (zero when none).
    pub async fn position_qty(&self, symbol: &str) -> Decimal {
        self.state
            .read()
            .await
            .positions
            .get(symbol)
            .map(|p| p.qty)
            .unwrap_or_default()
    }

    /// Reset balances, positions and counters.
    pub async fn reset(&self, initial_balance: Decimal) {
        *self.state.write().await = PaperState::new(initial_balance);
        self.order_id_counter.store(1, Ordering::SeqCst);
        debug!(venue = %self.name, balance = %initial_balance, "Paper venue state reset");
    }

    fn next_order_id(&self) -> u64 {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    /// Consume one injected fault from `counter`, if any remain.
    fn take_fault(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn price_of(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.prices
            .read()
            .await
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::unknown_symbol(&self.name, symbol))
    }

    fn contract_for(symbol: &str) -> String {
        format!("{symbol}USDT")
    }
}

/// Whether an order crosses the current price.
fn is_marketable(request: &OrderRequest, price: Decimal) -> bool {
    match (request.order_type, request.price) {
        (OrderType::Market, _) | (OrderType::Limit, None) => true,
        (OrderType::Limit, Some(limit)) => match request.side {
            OrderSide::Buy => limit >= price,
            OrderSide::Sell => limit <= price,
        },
    }
}

#[async_trait]
impl ExchangeCapability for PaperExchange {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn initialize(&self) -> Result<(), ExchangeError> {
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.connected.store(true, Ordering::SeqCst);
        info!(venue = %self.name, "Paper venue connected");
        Ok(())
    }

    async fn resolve_contract_id(&self, symbol: &str) -> Result<String, ExchangeError> {
        self.price_of(symbol).await?;
        Ok(Self::contract_for(symbol))
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        self.simulate_latency().await;
        let price = self.price_of(symbol).await?;
        Ok(Ticker {
            symbol: symbol.to_string(),
            last_price: price,
            bid_price: Some(price),
            ask_price: Some(price),
            timestamp: Utc::now().timestamp_millis(),
        })
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>, ExchangeError> {
        self.simulate_latency().await;
        if Self::take_fault(&self.position_failures) {
            return Err(ExchangeError::network(&self.name, "injected position query failure"));
        }

        let mark = self.prices.read().await.get(symbol).copied();
        let state = self.state.read().await;
        Ok(state.positions.get(symbol).map(|p| {
            let mut position =
                Position::from_signed(symbol, &Self::contract_for(symbol), p.qty, p.entry_price);
            if let Some(mark) = mark {
                position.unrealized_pnl = p.qty * (mark - p.entry_price);
                position.margin_used = p.qty.abs() * mark;
            }
            position
        }))
    }

    async fn get_balance(&self) -> Result<Balance, ExchangeError> {
        let prices = self.prices.read().await;
        let state = self.state.read().await;
        let unrealized: Decimal = state
            .positions
            .values()
            .filter_map(|p| prices.get(&p.symbol).map(|mark| p.qty * (mark - p.entry_price)))
            .sum();

        Ok(Balance {
            asset: "USDT".to_string(),
            total: state.balance + unrealized,
            available: state.balance,
        })
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<Order, ExchangeError> {
        self.simulate_latency().await;
        if Self::take_fault(&self.order_failures) {
            return Err(ExchangeError::network(&self.name, "injected order failure"));
        }

        let price = self.price_of(&request.symbol).await?;
        let mut state = self.state.write().await;
        state.order_log.push(request.clone());

        if request.quantity <= Decimal::ZERO {
            return Err(ExchangeError::business(
                &self.name,
                -4003,
                "Quantity less than or equal to zero.",
            ));
        }

        let current_qty = state
            .positions
            .get(&request.symbol)
            .map(|p| p.qty)
            .unwrap_or_default();

        let mut fill_qty = request.quantity;
        if request.reduce_only {
            let reducible = match request.side {
                OrderSide::Buy if current_qty < Decimal::ZERO => current_qty.abs(),
                OrderSide::Sell if current_qty > Decimal::ZERO => current_qty,
                _ => Decimal::ZERO,
            };
            if reducible.is_zero() {
                return Err(ExchangeError::business(
                    &self.name,
                    -2022,
                    "ReduceOnly Order is rejected.",
                ));
            }
            fill_qty = fill_qty.min(reducible);
        }

        if self.sticky_orders.load(Ordering::SeqCst) || !is_marketable(request, price) {
            fill_qty = Decimal::ZERO;
        }

        if fill_qty > Decimal::ZERO {
            let delta = match request.side {
                OrderSide::Buy => fill_qty,
                OrderSide::Sell => -fill_qty,
            };
            let fee = fill_qty * price * self.fee_rate;

            let realized = {
                let position = state
                    .positions
                    .entry(request.symbol.clone())
                    .or_insert_with(|| PaperPosition {
                        symbol: request.symbol.clone(),
                        ..Default::default()
                    });

                let old_qty = position.qty;
                let new_qty = old_qty + delta;
                let same_direction = old_qty.is_zero() || old_qty.is_sign_positive() == delta.is_sign_positive();

                let realized = if same_direction {
                    // Weighted average entry when adding to a position
                    position.entry_price = (old_qty.abs() * position.entry_price
                        + fill_qty * price)
                        / new_qty.abs();
                    Decimal::ZERO
                } else {
                    let closed = fill_qty.min(old_qty.abs());
                    let pnl = if old_qty > Decimal::ZERO {
                        closed * (price - position.entry_price)
                    } else {
                        closed * (position.entry_price - price)
                    };
                    if new_qty.is_zero() {
                        position.entry_price = Decimal::ZERO;
                    } else if new_qty.is_sign_positive() != old_qty.is_sign_positive() {
                        position.entry_price = price;
                    }
                    pnl
                };
                position.qty = new_qty;
                realized
            };

            state.realized_pnl += realized;
            state.balance += realized - fee;
            state.total_trading_fees += fee;
        }
        state.order_count += 1;

        let status = if fill_qty.is_zero() {
            if self.sticky_orders.load(Ordering::SeqCst) {
                OrderStatus::New
            } else {
                OrderStatus::Expired
            }
        } else if fill_qty < request.quantity {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::Filled
        };

        let order_id = self.next_order_id();

        info!(
            venue = %self.name,
            order_id,
            symbol = %request.symbol,
            side = %request.side,
            quantity = %request.quantity,
            filled = %fill_qty,
            price = %price,
            reduce_only = request.reduce_only,
            status = ?status,
            "Paper order executed"
        );

        Ok(Order {
            order_id: order_id.to_string(),
            symbol: request.symbol.clone(),
            contract_id: request.contract_id.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            price: request.price,
            time_in_force: request.time_in_force,
            reduce_only: request.reduce_only,
            status,
            filled_quantity: fill_qty,
            avg_fill_price: (fill_qty > Decimal::ZERO).then_some(price),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    // =========================================================================
    // Helper functions
    // =========================================================================

    async fn setup_venue_with_price(price: Decimal) -> PaperExchange {
        let venue = PaperExchange::new("paper-test", dec!(10000));
        venue.set_price("BTC", price).await;
        venue
    }

    fn ioc(side: OrderSide, quantity: Decimal, price: Decimal, reduce_only: bool) -> OrderRequest {
        OrderRequest {
            symbol: "BTC".to_string(),
            contract_id: "BTCUSDT".to_string(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            time_in_force: TimeInForce::Ioc,
            reduce_only,
        }
    }

    // =========================================================================
    // Order Execution Tests
    // =========================================================================

    #[tokio::test]
    async fn test_marketable_ioc_fills_at_last_price() {
        let venue = setup_venue_with_price(dec!(50000)).await;

        let order = venue
            .place_order(&ioc(OrderSide::Buy, dec!(0.5), dec!(51000), false))
            .await
            .unwrap();

        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_quantity, dec!(0.5));
        assert_eq!(order.avg_fill_price, Some(dec!(50000)));
        assert_eq!(venue.position_qty("BTC").await, dec!(0.5));

        let state = venue.get_state().await;
        assert_eq!(state.order_count, 1);
        assert_eq!(state.total_trading_fees, dec!(10)); // 0.5 * 50000 * 0.0004
    }

    #[tokio::test]
    async fn test_non_marketable_ioc_expires() {
        let venue = setup_venue_with_price(dec!(50000)).await;

        let order = venue
            .place_order(&ioc(OrderSide::Sell, dec!(1), dec!(50500), false))
            .await
            .unwrap();

        assert_eq!(order.status, OrderStatus::Expired);
        assert_eq!(order.filled_quantity, Decimal::ZERO);
        assert_eq!(venue.position_qty("BTC").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_reduce_only_is_clamped_and_realizes_pnl() {
        let venue = setup_venue_with_price(dec!(50000)).await;
        venue.seed_position("BTC", dec!(-1), dec!(51000)).await;

        let order = venue
            .place_order(&ioc(OrderSide::Buy, dec!(2), dec!(51000), true))
            .await
            .unwrap();

        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.filled_quantity, dec!(1));
        assert_eq!(venue.position_qty("BTC").await, Decimal::ZERO);

        let state = venue.get_state().await;
        assert_eq!(state.realized_pnl, dec!(1000)); // short from 51000, covered at 50000
    }

    #[tokio::test]
    async fn test_reduce_only_without_position_is_rejected() {
        let venue = setup_venue_with_price(dec!(50000)).await;

        let err = venue
            .place_order(&ioc(OrderSide::Sell, dec!(1), dec!(49000), true))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Business { code: -2022, .. }));
    }

    #[tokio::test]
    async fn test_weighted_entry_price() {
        let venue = setup_venue_with_price(dec!(100)).await;
        venue
            .place_order(&ioc(OrderSide::Buy, dec!(1), dec!(200), false))
            .await
            .unwrap();
        venue.set_price("BTC", dec!(200)).await;
        venue
            .place_order(&ioc(OrderSide::Buy, dec!(1), dec!(300), false))
            .await
            .unwrap();

        let state = venue.get_state().await;
        assert_eq!(state.positions["BTC"].entry_price, dec!(150));
    }

    // =========================================================================
    // Query & Fault Injection Tests
    // =========================================================================

    #[tokio::test]
    async fn test_position_report_uses_magnitude_and_side() {
        let venue = setup_venue_with_price(dec!(3000)).await;
        venue.seed_position("BTC", dec!(-1.5), dec!(3100)).await;

        let position = venue.get_position("BTC").await.unwrap().unwrap();
        assert_eq!(position.size, dec!(1.5));
        assert_eq!(position.side, PositionSide::Short);
        assert_eq!(position.unrealized_pnl, dec!(150));
        assert_eq!(position.margin_used, dec!(4500));
    }

    #[tokio::test]
    async fn test_unknown_symbol() {
        let venue = setup_venue_with_price(dec!(50000)).await;
        assert_err!(venue.resolve_contract_id("DOGE").await);
        assert_eq!(venue.resolve_contract_id("BTC").await.unwrap(), "BTCUSDT");
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let venue = setup_venue_with_price(dec!(50000)).await;
        venue.fail_next_orders(1);
        venue.fail_next_position_queries(1);

        let request = ioc(OrderSide::Buy, dec!(0.1), dec!(51000), false);
        assert!(matches!(
            venue.place_order(&request).await,
            Err(ExchangeError::Network { .. })
        ));
        assert!(venue.place_order(&request).await.is_ok());

        assert!(venue.get_position("BTC").await.is_err());
        assert!(venue.get_position("BTC").await.is_ok());

        // Failed submissions never reach the order log
        assert_eq!(venue.order_log().await.len(), 1);
    }

    #[tokio::test]
    async fn test_sticky_orders_accept_without_filling() {
        let venue = setup_venue_with_price(dec!(50000)).await;
        venue.set_sticky_orders(true);

        let order = venue
            .place_order(&ioc(OrderSide::Buy, dec!(1), dec!(51000), false))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::New);
        assert_eq!(venue.position_qty("BTC").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_initialize_sets_connected_and_reset_clears_state() {
        let venue = setup_venue_with_price(dec!(50000)).await;
        assert!(!venue.is_connected());
        venue.initialize().await.unwrap();
        assert!(venue.is_connected());
        assert_eq!(venue.initialize_count(), 1);

        venue
            .place_order(&ioc(OrderSide::Buy, dec!(1), dec!(51000), false))
            .await
            .unwrap();
        venue.reset(dec!(5000)).await;

        let state = venue.get_state().await;
        assert_eq!(state.balance, dec!(5000));
        assert!(state.positions.is_empty());
        assert!(state.order_log.is_empty());
    }

    #[tokio::test]
    async fn test_balance_includes_unrealized() {
        let venue = setup_venue_with_price(dec!(100)).await;
        venue.seed_position("BTC", dec!(2), dec!(90)).await;

        let balance = venue.get_balance().await.unwrap();
        assert_eq!(balance.available, dec!(10000));
        assert_eq!(balance.total, dec!(10020));
    }
}
