//! Hedge cycle engine.
//!
//! Each cycle opens an opposite-side pair of IOC limit orders on the two
//! venues for one symbol, holds the pair for a random interval, then
//! flattens both legs with reduce-only orders. Leg submissions always run
//! concurrently and are always driven to completion, so a failure on one
//! venue never cancels an order that is already in flight on the other.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use super::error::{EngineError, Leg};
use super::pricing::{leg_pnl, order_quantity, slippage_price};
use super::random::{coin_flip, pick_index, uniform_decimal, uniform_u64, RandomSource, StdRandom};
use crate::config::HedgeConfig;
use crate::exchange::{
    is_flat, ExchangeCapability, ExchangeError, Order, OrderRequest, OrderSide, OrderType,
    Position, TimeInForce,
};
use crate::persistence::{NewTradeRecord, TradeRecordStore, TradeRecordUpdate};
use crate::utils::decimal::percentage_diff;

/// Close attempts per flatten before giving up.
pub const CLOSE_MAX_ATTEMPTS: u32 = 5;
/// Pause between close attempts.
pub const CLOSE_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Extra pause after a cycle fails to flatten.
const CLOSE_FAILURE_BACKOFF: Duration = Duration::from_secs(1);
/// Minimum spacing between loop iterations.
const ITERATION_FLOOR: Duration = Duration::from_secs(1);

/// How a single cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOutcome {
    Completed,
    /// Stop was requested while the pair was held
    Stopped,
    /// The pre-trade sweep left exposure on the symbol
    NotFlat,
    /// The post-hold close left exposure on the symbol
    CloseFailed,
}

/// Result of a flatten, with the latest filled close order per leg.
#[derive(Debug, Default)]
struct FlattenReport {
    flat: bool,
    first_close: Option<Order>,
    second_close: Option<Order>,
}

/// A hedged pair waiting to be closed.
struct OpenedPair {
    record_id: Option<i64>,
    first: Order,
    second: Order,
}

/// Resets the running flag if the loop future is dropped mid-flight.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drives hedge cycles across two venues.
pub struct HedgeEngine {
    first: Arc<dyn ExchangeCapability>,
    second: Arc<dyn ExchangeCapability>,
    store: Option<Arc<dyn TradeRecordStore>>,
    config: HedgeConfig,
    rng: Mutex<Box<dyn RandomSource>>,
    running: AtomicBool,
}

impl HedgeEngine {
    /// Create an engine over two venues. The config is validated up front.
    pub fn new(
        first: Arc<dyn ExchangeCapability>,
        second: Arc<dyn ExchangeCapability>,
        store: Option<Arc<dyn TradeRecordStore>>,
        config: HedgeConfig,
    ) -> Result<Self, EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            first,
            second,
            store,
            config,
            rng: Mutex::new(Box::new(StdRandom::from_entropy())),
            running: AtomicBool::new(false),
        })
    }

    /// Replace the random source (seeded or scripted runs).
    pub fn with_random_source(mut self, source: Box<dyn RandomSource>) -> Self {
        self.rng = Mutex::new(source);
        self
    }

    pub fn config(&self) -> &HedgeConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Initialize any venue that is not already connected.
    pub async fn initialize(&self) -> Result<(), EngineError> {
        for exchange in [&self.first, &self.second] {
            if exchange.is_connected() {
                debug!(venue = %exchange.name(), "Venue already connected");
                continue;
            }
            exchange.initialize().await?;
        }

        info!(
            first = %self.first.name(),
            second = %self.second.name(),
            "Hedge engine initialized"
        );
        Ok(())
    }

    /// Open an opposite-side pair of IOC limit orders for `size_usd` notional.
    ///
    /// Quantity is derived from the first venue's last price and used on both
    /// legs. If either leg fails the error is returned after both submissions
    /// have finished; a leg that did fill is left for the next sweep.
    pub async fn place_market_order(
        &self,
        symbol: &str,
        size_usd: Decimal,
        first_side: OrderSide,
        second_side: OrderSide,
    ) -> Result<[Order; 2], EngineError> {
        let (first_contract, second_contract) = tokio::try_join!(
            self.first.resolve_contract_id(symbol),
            self.second.resolve_contract_id(symbol)
        )?;
        let (first_ticker, second_ticker) = tokio::try_join!(
            self.first.get_ticker(symbol),
            self.second.get_ticker(symbol)
        )?;

        let quantity = order_quantity(size_usd, first_ticker.last_price)?;
        let slippage = self.config.slippage;

        let first_request = ioc_order(
            symbol,
            first_contract,
            first_side,
            quantity,
            slippage_price(first_ticker.last_price, first_side, slippage),
            false,
        );
        let second_request = ioc_order(
            symbol,
            second_contract,
            second_side,
            quantity,
            slippage_price(second_ticker.last_price, second_side, slippage),
            false,
        );

        info!(
            %symbol,
            %size_usd,
            %quantity,
            first_side = %first_side,
            first_price = ?first_request.price,
            second_side = %second_side,
            second_price = ?second_request.price,
            "Submitting hedge legs"
        );

        let (first_result, second_result) = tokio::join!(
            self.first.place_order(&first_request),
            self.second.place_order(&second_request)
        );

        match (first_result, second_result) {
            (Ok(first), Ok(second)) => {
                if first.filled_quantity != second.filled_quantity {
                    warn!(
                        %symbol,
                        first_filled = %first.filled_quantity,
                        second_filled = %second.filled_quantity,
                        diff_pct = %percentage_diff(first.filled_quantity, second.filled_quantity),
                        "Hedge legs filled unevenly"
                    );
                }
                info!(
                    %symbol,
                    first_order_id = %first.order_id,
                    first_status = ?first.status,
                    second_order_id = %second.order_id,
                    second_status = ?second.status,
                    "Hedge legs submitted"
                );
                Ok([first, second])
            }
            (Err(e), Ok(second)) => {
                error!(
                    %symbol,
                    error = %e,
                    second_order_id = %second.order_id,
                    second_filled = %second.filled_quantity,
                    "First leg failed - position may be unhedged"
                );
                Err(EngineError::LegFailed {
                    symbol: symbol.to_string(),
                    leg: Leg::First,
                    source: e,
                })
            }
            (Ok(first), Err(e)) => {
                error!(
                    %symbol,
                    error = %e,
                    first_order_id = %first.order_id,
                    first_filled = %first.filled_quantity,
                    "Second leg failed - position may be unhedged"
                );
                Err(EngineError::LegFailed {
                    symbol: symbol.to_string(),
                    leg: Leg::Second,
                    source: e,
                })
            }
            (Err(first_error), Err(second_error)) => {
                error!(
                    %symbol,
                    first_error = %first_error,
                    second_error = %second_error,
                    "Both hedge legs failed"
                );
                Err(EngineError::LegFailed {
                    symbol: symbol.to_string(),
                    leg: Leg::First,
                    source: first_error,
                })
            }
        }
    }

    /// Submit a reduce-only IOC order that closes `position` on `exchange`.
    pub async fn close_position(
        &self,
        exchange: &dyn ExchangeCapability,
        position: &Position,
    ) -> Result<Order, ExchangeError> {
        let side = position.side.closing_side();
        let ticker = exchange.get_ticker(&position.symbol).await?;
        let price = slippage_price(ticker.last_price, side, self.config.slippage);

        let request = ioc_order(
            &position.symbol,
            position.contract_id.clone(),
            side,
            position.size,
            price,
            true,
        );

        debug!(
            venue = %exchange.name(),
            symbol = %position.symbol,
            %side,
            size = %position.size,
            %price,
            "Closing position"
        );
        exchange.place_order(&request).await
    }

    /// Flatten `symbol` on both venues. Returns whether both ended flat.
    pub async fn close_positions(&self, symbol: &str) -> bool {
        self.flatten(symbol).await.flat
    }

    #[instrument(skip(self), fields(first = %self.first.name(), second = %self.second.name()))]
    async fn flatten(&self, symbol: &str) -> FlattenReport {
        let mut report = FlattenReport::default();

        for attempt in 1..=CLOSE_MAX_ATTEMPTS {
            match self.close_attempt(symbol, &mut report).await {
                Ok(true) => {
                    debug!(attempt, "Both venues flat");
                    report.flat = true;
                    return report;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(attempt, error = %e, kind = e.kind(), "Close attempt failed");
                }
            }
            sleep(CLOSE_RETRY_DELAY).await;
        }

        report.flat = self.verify_flat(symbol).await;
        report
    }

    /// One pass: query both venues and close whatever is open.
    ///
    /// `Ok(true)` means nothing was open.
    async fn close_attempt(
        &self,
        symbol: &str,
        report: &mut FlattenReport,
    ) -> Result<bool, ExchangeError> {
        let (first_position, second_position) = tokio::try_join!(
            self.first.get_position(symbol),
            self.second.get_position(symbol)
        )?;

        let first_open = first_position.filter(|p| !p.is_flat());
        let second_open = second_position.filter(|p| !p.is_flat());
        if first_open.is_none() && second_open.is_none() {
            return Ok(true);
        }

        info!(
            first_size = ?first_open.as_ref().map(|p| p.size),
            second_size = ?second_open.as_ref().map(|p| p.size),
            "Closing open legs"
        );

        let first_close = async {
            match &first_open {
                Some(position) => Some(self.close_position(self.first.as_ref(), position).await),
                None => None,
            }
        };
        let second_close = async {
            match &second_open {
                Some(position) => Some(self.close_position(self.second.as_ref(), position).await),
                None => None,
            }
        };
        let (first_result, second_result) = tokio::join!(first_close, second_close);

        let mut failure = None;
        for (leg, result, slot) in [
            (Leg::First, first_result, &mut report.first_close),
            (Leg::Second, second_result, &mut report.second_close),
        ] {
            match result {
                Some(Ok(order)) => {
                    debug!(%leg, order_id = %order.order_id, status = ?order.status, filled = %order.filled_quantity, "Close order submitted");
                    if order.filled_quantity > Decimal::ZERO {
                        *slot = Some(order);
                    }
                }
                Some(Err(e)) => {
                    warn!(%leg, error = %e, "Close order failed");
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
                None => {}
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(false),
        }
    }

    /// Final re-query after retries ran out. A failed query counts as not flat.
    async fn verify_flat(&self, symbol: &str) -> bool {
        match tokio::try_join!(
            self.first.get_position(symbol),
            self.second.get_position(symbol)
        ) {
            Ok((first, second)) => {
                let flat = is_flat(&first) && is_flat(&second);
                if !flat {
                    error!(
                        first_size = ?first.map(|p| p.size),
                        second_size = ?second.map(|p| p.size),
                        attempts = CLOSE_MAX_ATTEMPTS,
                        "Positions still open after close retries"
                    );
                }
                flat
            }
            Err(e) => {
                error!(error = %e, "Could not verify positions after close retries");
                false
            }
        }
    }

    /// Run hedge cycles over `symbols` until stopped.
    ///
    /// On exit every symbol is flattened; flatten failures are logged.
    pub async fn run(&self, symbols: &[String]) -> Result<(), EngineError> {
        if symbols.is_empty() {
            return Err(EngineError::NoSymbols);
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EngineError::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);

        info!(?symbols, "Hedge engine started");
        self.cycle_loop(symbols).await;

        self.running.store(false, Ordering::SeqCst);
        info!("Flattening all symbols before exit");
        for symbol in symbols {
            if self.close_positions(symbol).await {
                info!(%symbol, "Symbol flat");
            } else {
                error!(%symbol, "Symbol left with open positions");
            }
        }

        info!("Hedge engine stopped");
        Ok(())
    }

    async fn cycle_loop(&self, symbols: &[String]) {
        let mut stuck: Option<String> = None;
        let mut cycle: u64 = 0;

        while self.is_running() {
            cycle += 1;
            let symbol = self.next_symbol(symbols, &mut stuck);

            match self.run_cycle(cycle, &symbol).await {
                Ok(CycleOutcome::Completed) => {}
                Ok(CycleOutcome::Stopped) => break,
                Ok(CycleOutcome::NotFlat) => {
                    warn!(cycle, %symbol, "Symbol not flat before opening, skipping cycle");
                }
                Ok(CycleOutcome::CloseFailed) => {
                    error!(cycle, %symbol, "Failed to close hedge, retrying it next");
                    stuck = Some(symbol);
                    sleep(CLOSE_FAILURE_BACKOFF).await;
                }
                Err(e @ EngineError::LegFailed { .. }) => {
                    // One leg may have filled
                    error!(cycle, %symbol, error = %e, "Hedge open failed, retrying it next");
                    stuck = Some(symbol);
                }
                Err(e) => {
                    error!(cycle, %symbol, error = %e, "Hedge cycle failed");
                }
            }

            sleep(ITERATION_FLOOR).await;
        }
    }

    /// A symbol left with exposure is retried before any new random pick.
    fn next_symbol(&self, symbols: &[String], stuck: &mut Option<String>) -> String {
        if let Some(symbol) = stuck.take() {
            return symbol;
        }
        let index = self.with_rng(|rng| pick_index(rng, symbols.len()));
        symbols[index].clone()
    }

    async fn run_cycle(&self, cycle: u64, symbol: &str) -> Result<CycleOutcome, EngineError> {
        let size_usd = self.draw_size();

        if !self.close_positions(symbol).await {
            return Ok(CycleOutcome::NotFlat);
        }

        let (first_side, second_side) = if self.with_rng(coin_flip) {
            (OrderSide::Buy, OrderSide::Sell)
        } else {
            (OrderSide::Sell, OrderSide::Buy)
        };

        info!(cycle, %symbol, %size_usd, %first_side, %second_side, "Starting hedge cycle");

        let [first, second] = self
            .place_market_order(symbol, size_usd, first_side, second_side)
            .await?;
        let pair = OpenedPair {
            record_id: self.record_open(symbol, &first, &second),
            first,
            second,
        };

        let hold = self.draw_millis(self.config.min_hold_time_ms, self.config.max_hold_time_ms);
        info!(cycle, %symbol, hold_ms = hold.as_millis() as u64, "Holding hedge");
        sleep(hold).await;

        if !self.is_running() {
            info!(cycle, %symbol, "Stop requested during hold");
            return Ok(CycleOutcome::Stopped);
        }

        let report = self.flatten(symbol).await;
        if !report.flat {
            return Ok(CycleOutcome::CloseFailed);
        }
        self.record_close(symbol, &pair, &report);

        let pause = self.draw_millis(
            self.config.min_sleep_between_orders_ms,
            self.config.max_sleep_between_orders_ms,
        );
        info!(cycle, %symbol, pause_ms = pause.as_millis() as u64, "Hedge cycle complete");
        sleep(pause).await;

        Ok(CycleOutcome::Completed)
    }

    /// Stop the loop and flatten `symbol`.
    pub async fn stop(&self, symbol: &str) -> bool {
        self.running.store(false, Ordering::SeqCst);
        info!(%symbol, "Stop requested");
        self.close_positions(symbol).await
    }

    /// Stop the loop and flatten every symbol in `symbols`.
    pub async fn stop_all(&self, symbols: &[String]) -> bool {
        self.running.store(false, Ordering::SeqCst);
        info!(?symbols, "Stop requested");

        let mut all_flat = true;
        for symbol in symbols {
            if !self.close_positions(symbol).await {
                error!(%symbol, "Symbol left with open positions");
                all_flat = false;
            }
        }
        all_flat
    }

    fn with_rng<T>(&self, draw: impl FnOnce(&mut dyn RandomSource) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        draw(&mut **rng)
    }

    fn draw_size(&self) -> Decimal {
        let (min, max) = (self.config.min_size_usd, self.config.max_size_usd);
        self.with_rng(|rng| uniform_decimal(rng, min, max))
    }

    fn draw_millis(&self, min: u64, max: u64) -> Duration {
        Duration::from_millis(self.with_rng(|rng| uniform_u64(rng, min, max)))
    }

    fn record_open(&self, symbol: &str, first: &Order, second: &Order) -> Option<i64> {
        let store = self.store.as_ref()?;
        let record = NewTradeRecord {
            symbol: symbol.to_string(),
            size: first.quantity,
            opened_at: Utc::now().timestamp(),
            first_side: first.side,
            first_order_id: first.order_id.clone(),
            second_order_id: second.order_id.clone(),
            first_entry_price: first.execution_price(),
            second_entry_price: second.execution_price(),
        };

        match store.create(record) {
            Ok(stored) => Some(stored.id),
            Err(e) => {
                warn!(%symbol, error = %e, "Failed to record opened trade");
                None
            }
        }
    }

    fn record_close(&self, symbol: &str, pair: &OpenedPair, report: &FlattenReport) {
        let (Some(store), Some(id)) = (self.store.as_ref(), pair.record_id) else {
            return;
        };

        let (first_exit, first_pnl) = leg_outcome(&pair.first, report.first_close.as_ref());
        let (second_exit, second_pnl) = leg_outcome(&pair.second, report.second_close.as_ref());
        let spread = first_pnl.zip(second_pnl).map(|(a, b)| a - b);

        let update = TradeRecordUpdate {
            closed_at: Utc::now().timestamp(),
            first_close_order_id: report.first_close.as_ref().map(|o| o.order_id.clone()),
            second_close_order_id: report.second_close.as_ref().map(|o| o.order_id.clone()),
            first_exit_price: first_exit,
            second_exit_price: second_exit,
            first_pnl,
            second_pnl,
            spread,
        };

        match store.update(id, update) {
            Ok(_) => info!(%symbol, record_id = id, spread = ?spread, "Trade record closed"),
            Err(e) => warn!(%symbol, record_id = id, error = %e, "Failed to record closed trade"),
        }
    }
}

/// Exit price and realized PnL of one leg, when both ends are known.
fn leg_outcome(entry: &Order, exit: Option<&Order>) -> (Option<Decimal>, Option<Decimal>) {
    let exit_price = exit.and_then(Order::execution_price);
    let pnl = entry
        .execution_price()
        .zip(exit_price)
        .map(|(open, close)| leg_pnl(entry.side, entry.filled_quantity, open, close));
    (exit_price, pnl)
}

fn ioc_order(
    symbol: &str,
    contract_id: String,
    side: OrderSide,
    quantity: Decimal,
    price: Decimal,
    reduce_only: bool,
) -> OrderRequest {
    OrderRequest {
        symbol: symbol.to_string(),
        contract_id,
        side,
        order_type: OrderType::Limit,
        quantity,
        price: Some(price),
        time_in_force: TimeInForce::Ioc,
        reduce_only,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{OrderStatus, PaperExchange, PositionSide};
    use crate::hedge::random::SequenceRandom;
    use crate::persistence::{MockTradeRecordStore, TradeRecord, TradeStatus};
    use rust_decimal_macros::dec;
    use tokio::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    fn test_config() -> HedgeConfig {
        HedgeConfig {
            min_size_usd: dec!(500),
            max_size_usd: dec!(500),
            min_sleep_between_orders_ms: 1_000,
            max_sleep_between_orders_ms: 1_000,
            min_hold_time_ms: 1_000,
            max_hold_time_ms: 1_000,
            slippage: dec!(0.02),
        }
    }

    async fn venues(first_price: Decimal, second_price: Decimal) -> (Arc<PaperExchange>, Arc<PaperExchange>) {
        let first = Arc::new(PaperExchange::new("first", dec!(10000)));
        let second = Arc::new(PaperExchange::new("second", dec!(10000)));
        for (venue, btc) in [(&first, first_price), (&second, second_price)] {
            venue.set_price("BTC", btc).await;
            venue.set_price("ETH", dec!(3000)).await;
        }
        (first, second)
    }

    fn engine_with(
        first: &Arc<PaperExchange>,
        second: &Arc<PaperExchange>,
        store: Option<Arc<dyn TradeRecordStore>>,
        config: HedgeConfig,
    ) -> HedgeEngine {
        HedgeEngine::new(first.clone(), second.clone(), store, config)
            .unwrap()
            // 0.25 on every draw: first index, first leg buys
            .with_random_source(Box::new(SequenceRandom::new(vec![0.25])))
    }

    fn symbols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn stored(id: i64, record: NewTradeRecord) -> TradeRecord {
        TradeRecord {
            id,
            symbol: record.symbol,
            size: record.size,
            status: TradeStatus::Open,
            opened_at: record.opened_at,
            closed_at: None,
            first_side: record.first_side,
            first_order_id: record.first_order_id,
            second_order_id: record.second_order_id,
            first_entry_price: record.first_entry_price,
            second_entry_price: record.second_entry_price,
            first_close_order_id: None,
            second_close_order_id: None,
            first_exit_price: None,
            second_exit_price: None,
            first_pnl: None,
            second_pnl: None,
            spread: None,
        }
    }

    #[tokio::test]
    async fn test_place_market_order_prices_both_legs() {
        let (first, second) = venues(dec!(50000), dec!(50010)).await;
        let engine = engine_with(&first, &second, None, test_config());

        let [first_order, second_order] = engine
            .place_market_order("BTC", dec!(500), OrderSide::Buy, OrderSide::Sell)
            .await
            .unwrap();

        assert_eq!(first_order.quantity, dec!(0.01));
        assert_eq!(first_order.price, Some(dec!(51000.0)));
        assert_eq!(first_order.side, OrderSide::Buy);
        assert_eq!(second_order.quantity, dec!(0.01));
        assert_eq!(second_order.price, Some(dec!(49009.8)));
        assert_eq!(second_order.side, OrderSide::Sell);

        let request = &first.order_log().await[0];
        assert_eq!(request.contract_id, "BTCUSDT");
        assert_eq!(request.order_type, OrderType::Limit);
        assert_eq!(request.time_in_force, TimeInForce::Ioc);
        assert!(!request.reduce_only);

        assert_eq!(first.position_qty("BTC").await, dec!(0.01));
        assert_eq!(second.position_qty("BTC").await, dec!(-0.01));
    }

    #[tokio::test(start_paused = true)]
    async fn test_place_market_order_submits_legs_concurrently() {
        let latency = Duration::from_millis(100);
        let first = Arc::new(PaperExchange::new("first", dec!(10000)).with_latency(latency));
        let second = Arc::new(PaperExchange::new("second", dec!(10000)).with_latency(latency));
        first.set_price("BTC", dec!(50000)).await;
        second.set_price("BTC", dec!(50010)).await;
        let engine = engine_with(&first, &second, None, test_config());

        let started = Instant::now();
        engine
            .place_market_order("BTC", dec!(500), OrderSide::Buy, OrderSide::Sell)
            .await
            .unwrap();

        // Tickers then orders, each pair overlapping
        assert!(started.elapsed() < latency * 3);
    }

    #[tokio::test]
    async fn test_place_market_order_rejects_zero_reference_price() {
        let (first, second) = venues(Decimal::ZERO, dec!(50010)).await;
        let engine = engine_with(&first, &second, None, test_config());

        let err = assert_err!(
            engine
                .place_market_order("BTC", dec!(500), OrderSide::Buy, OrderSide::Sell)
                .await
        );

        assert!(matches!(err, EngineError::InvalidReferencePrice(_)));
        assert!(first.order_log().await.is_empty());
        assert!(second.order_log().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_leg_is_reported_and_swept() {
        let (first, second) = venues(dec!(50000), dec!(50010)).await;
        second.fail_next_orders(1);
        let engine = engine_with(&first, &second, None, test_config());

        let result = engine
            .place_market_order("BTC", dec!(500), OrderSide::Buy, OrderSide::Sell)
            .await;
        assert!(matches!(
            result,
            Err(EngineError::LegFailed { leg: Leg::Second, .. })
        ));
        // The first leg still went through
        assert_eq!(first.position_qty("BTC").await, dec!(0.01));

        assert!(engine.close_positions("BTC").await);
        assert!(first.position_qty("BTC").await.is_zero());
        assert!(second.order_log().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_positions_closes_legs_concurrently() {
        let latency = Duration::from_millis(100);
        let first = Arc::new(PaperExchange::new("first", dec!(10000)).with_latency(latency));
        let second = Arc::new(PaperExchange::new("second", dec!(10000)).with_latency(latency));
        first.set_price("BTC", dec!(50000)).await;
        second.set_price("BTC", dec!(50010)).await;
        first.seed_position("BTC", dec!(0.01), dec!(50000)).await;
        second.seed_position("BTC", dec!(-0.01), dec!(50010)).await;
        let engine = engine_with(&first, &second, None, test_config());

        let started = Instant::now();
        assert!(engine.close_positions("BTC").await);

        // Query, ticker and close overlap across venues, then one retry delay and a clean query
        assert_eq!(started.elapsed(), CLOSE_RETRY_DELAY + latency * 4);
        assert_eq!(first.order_log().await.len(), 1);
        assert_eq!(second.order_log().await.len(), 1);
        assert!(first.position_qty("BTC").await.is_zero());
        assert!(second.position_qty("BTC").await.is_zero());
    }

    #[tokio::test]
    async fn test_close_position_uses_closing_side() {
        let (first, second) = venues(dec!(50000), dec!(50010)).await;
        first.seed_position("BTC", dec!(-0.02), dec!(49000)).await;
        let engine = engine_with(&first, &second, None, test_config());

        let position = first.get_position("BTC").await.unwrap().unwrap();
        assert_eq!(position.side, PositionSide::Short);

        let order = engine.close_position(first.as_ref(), &position).await.unwrap();
        assert_eq!(order.side, OrderSide::Buy);
        assert_eq!(order.quantity, dec!(0.02));
        assert_eq!(order.price, Some(dec!(51000)));
        assert!(order.reduce_only);
        assert_eq!(order.status, OrderStatus::Filled);
        assert!(first.position_qty("BTC").await.is_zero());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_positions_when_already_flat() {
        let (first, second) = venues(dec!(50000), dec!(50010)).await;
        let engine = engine_with(&first, &second, None, test_config());

        let started = Instant::now();
        assert!(engine.close_positions("BTC").await);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(first.order_log().await.is_empty());
        assert!(second.order_log().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_positions_closes_only_open_leg() {
        let (first, second) = venues(dec!(50000), dec!(50010)).await;
        first.seed_position("ETH", Decimal::ZERO, Decimal::ZERO).await;
        second.seed_position("ETH", dec!(1.5), dec!(2900)).await;
        let engine = engine_with(&first, &second, None, test_config());

        assert!(engine.close_positions("ETH").await);

        assert!(first.order_log().await.is_empty());
        let closes = second.order_log().await;
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].side, OrderSide::Sell);
        assert_eq!(closes[0].quantity, dec!(1.5));
        assert_eq!(closes[0].price, Some(dec!(2940)));
        assert!(closes[0].reduce_only);
        assert!(second.position_qty("ETH").await.is_zero());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_positions_gives_up_after_max_attempts() {
        let (first, second) = venues(dec!(50000), dec!(50010)).await;
        second.seed_position("BTC", dec!(0.01), dec!(50000)).await;
        second.set_sticky_orders(true);
        let engine = engine_with(&first, &second, None, test_config());

        let started = Instant::now();
        assert!(!engine.close_positions("BTC").await);

        assert_eq!(second.order_log().await.len(), CLOSE_MAX_ATTEMPTS as usize);
        assert_eq!(started.elapsed(), CLOSE_RETRY_DELAY * CLOSE_MAX_ATTEMPTS);
        assert_eq!(second.position_qty("BTC").await, dec!(0.01));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_positions_retries_failed_queries() {
        let (first, second) = venues(dec!(50000), dec!(50010)).await;
        second.seed_position("BTC", dec!(-0.01), dec!(50010)).await;
        first.fail_next_position_queries(2);
        let engine = engine_with(&first, &second, None, test_config());

        let started = Instant::now();
        assert!(engine.close_positions("BTC").await);

        // Two failed passes, one closing pass, then a clean check
        assert_eq!(started.elapsed(), CLOSE_RETRY_DELAY * 3);
        assert_eq!(second.order_log().await.len(), 1);
    }

    #[tokio::test]
    async fn test_initialize_skips_connected_venues() {
        let (first, second) = venues(dec!(50000), dec!(50010)).await;
        assert_ok!(first.initialize().await);
        let engine = engine_with(&first, &second, None, test_config());

        assert_ok!(engine.initialize().await);

        assert_eq!(first.initialize_count(), 1);
        assert_eq!(second.initialize_count(), 1);
        assert!(second.is_connected());
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let (first, second) = venues(dec!(50000), dec!(50010)).await;
        let mut config = test_config();
        config.min_hold_time_ms = 5_000;
        config.max_hold_time_ms = 1_000;

        let result = HedgeEngine::new(first, second, None, config);
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_run_rejects_empty_symbols() {
        let (first, second) = venues(dec!(50000), dec!(50010)).await;
        let engine = engine_with(&first, &second, None, test_config());

        assert!(matches!(engine.run(&[]).await, Err(EngineError::NoSymbols)));
        assert!(!engine.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_rejects_second_invocation() {
        let (first, second) = venues(dec!(50000), dec!(50010)).await;
        let engine = Arc::new(engine_with(&first, &second, None, test_config()));
        let names = symbols(&["BTC"]);

        let handle = tokio::spawn({
            let engine = engine.clone();
            let names = names.clone();
            async move { engine.run(&names).await }
        });
        while !engine.is_running() {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            engine.run(&names).await,
            Err(EngineError::AlreadyRunning)
        ));

        assert!(engine.stop_all(&names).await);
        handle.await.unwrap().unwrap();
        assert!(!engine.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_hold_flattens_and_exits() {
        let (first, second) = venues(dec!(50000), dec!(50010)).await;
        let mut config = test_config();
        config.min_hold_time_ms = 10_000;
        config.max_hold_time_ms = 10_000;
        let engine = Arc::new(engine_with(&first, &second, None, config));
        let names = symbols(&["BTC"]);

        let handle = tokio::spawn({
            let engine = engine.clone();
            let names = names.clone();
            async move { engine.run(&names).await }
        });

        sleep(Duration::from_secs(1)).await;
        assert_eq!(first.position_qty("BTC").await, dec!(0.01));
        assert_eq!(second.position_qty("BTC").await, dec!(-0.01));

        assert!(engine.stop("BTC").await);
        assert!(!engine.is_running());
        assert!(first.position_qty("BTC").await.is_zero());
        assert!(second.position_qty("BTC").await.is_zero());
        // The loop is still parked in its hold
        assert!(!handle.is_finished());

        handle.await.unwrap().unwrap();
        // Open plus the stop's close; no post-hold close after the stop
        assert_eq!(first.order_log().await.len(), 2);
        assert_eq!(second.order_log().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_survives_failed_open() {
        let (first, second) = venues(dec!(50000), dec!(50010)).await;
        first.fail_next_orders(1);
        let engine = Arc::new(engine_with(&first, &second, None, test_config()));
        let names = symbols(&["BTC"]);

        let handle = tokio::spawn({
            let engine = engine.clone();
            let names = names.clone();
            async move { engine.run(&names).await }
        });

        // Cycle 1 fails on the first leg; cycle 2 sweeps the orphan and reopens
        sleep(Duration::from_millis(2_500)).await;
        assert!(engine.is_running());
        assert_eq!(first.position_qty("BTC").await, dec!(0.01));
        assert_eq!(second.position_qty("BTC").await, dec!(-0.01));

        assert!(engine.stop_all(&names).await);
        handle.await.unwrap().unwrap();

        let log = second.order_log().await;
        assert_eq!(log.len(), 4);
        assert!(!log[0].reduce_only);
        assert!(log[1].reduce_only && log[1].side == OrderSide::Buy);
        assert!(!log[2].reduce_only);
        assert!(log[3].reduce_only);
        assert!(first.position_qty("BTC").await.is_zero());
        assert!(second.position_qty("BTC").await.is_zero());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_open_retargets_symbol() {
        let (first, second) = venues(dec!(50000), dec!(50010)).await;
        first.fail_next_orders(1);
        // pick BTC, size, buy first; then 0.9 would pick ETH if cycle 2 drew a symbol
        let draws = vec![0.25, 0.25, 0.25, 0.9, 0.25, 0.25];
        let engine = Arc::new(
            HedgeEngine::new(first.clone(), second.clone(), None, test_config())
                .unwrap()
                .with_random_source(Box::new(SequenceRandom::new(draws))),
        );
        let names = symbols(&["BTC", "ETH"]);

        let handle = tokio::spawn({
            let engine = engine.clone();
            let names = names.clone();
            async move { engine.run(&names).await }
        });

        // Cycle 1 leaves a short on the second venue; cycle 2 sweeps and reopens BTC
        sleep(Duration::from_millis(2_500)).await;
        let first_log = first.order_log().await;
        let second_log = second.order_log().await;
        assert!(first_log.iter().chain(&second_log).all(|o| o.symbol == "BTC"));
        assert_eq!(second_log.len(), 3);
        assert!(!second_log[0].reduce_only && second_log[0].side == OrderSide::Sell);
        assert!(second_log[1].reduce_only && second_log[1].side == OrderSide::Buy);
        assert!(!second_log[2].reduce_only);
        assert_eq!(first_log.len(), 1);
        assert_eq!(first.position_qty("BTC").await, dec!(0.01));
        assert_eq!(second.position_qty("BTC").await, dec!(-0.01));

        assert!(engine.stop_all(&names).await);
        handle.await.unwrap().unwrap();
        assert!(second.position_qty("BTC").await.is_zero());
        assert!(first.position_qty("ETH").await.is_zero());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_cycle_is_recorded() {
        let (first, second) = venues(dec!(50000), dec!(50010)).await;
        let mut store = MockTradeRecordStore::new();
        store
            .expect_create()
            .times(1)
            .withf(|record| {
                record.symbol == "BTC"
                    && record.size == dec!(0.01)
                    && record.first_side == OrderSide::Buy
                    && record.first_entry_price == Some(dec!(50000))
                    && record.second_entry_price == Some(dec!(50010))
            })
            .returning(|record| Ok(stored(7, record)));
        store
            .expect_update()
            .times(1)
            .withf(|id, update| {
                *id == 7
                    && update.first_close_order_id.is_some()
                    && update.second_close_order_id.is_some()
                    && update.first_exit_price == Some(dec!(50000))
                    && update.spread == Some(Decimal::ZERO)
            })
            .returning(|id, _| {
                let mut record = stored(
                    id,
                    NewTradeRecord {
                        symbol: "BTC".to_string(),
                        size: dec!(0.01),
                        opened_at: 0,
                        first_side: OrderSide::Buy,
                        first_order_id: "1".to_string(),
                        second_order_id: "1".to_string(),
                        first_entry_price: None,
                        second_entry_price: None,
                    },
                );
                record.status = TradeStatus::Close;
                Ok(record)
            });

        let engine = Arc::new(engine_with(&first, &second, Some(Arc::new(store)), test_config()));
        let names = symbols(&["BTC"]);

        let handle = tokio::spawn({
            let engine = engine.clone();
            let names = names.clone();
            async move { engine.run(&names).await }
        });

        // open at 0s, close by 2s, pause and floor until 4s
        sleep(Duration::from_millis(3_500)).await;
        assert!(engine.stop("BTC").await);
        assert_ok!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_stuck_symbol_is_retargeted() {
        let (first, second) = venues(dec!(50000), dec!(50010)).await;
        let engine = HedgeEngine::new(first, second, None, test_config())
            .unwrap()
            .with_random_source(Box::new(SequenceRandom::new(vec![0.9])));
        let names = symbols(&["BTC", "ETH"]);

        let mut stuck = Some("BTC".to_string());
        assert_eq!(engine.next_symbol(&names, &mut stuck), "BTC");
        assert!(stuck.is_none());
        assert_eq!(engine.next_symbol(&names, &mut stuck), "ETH");
    }

    #[test]
    fn test_draws_stay_within_configured_ranges() {
        let first = Arc::new(PaperExchange::new("first", dec!(10000)));
        let second = Arc::new(PaperExchange::new("second", dec!(10000)));
        let config = HedgeConfig::default();
        let engine = HedgeEngine::new(first, second, None, config.clone())
            .unwrap()
            .with_random_source(Box::new(StdRandom::seeded(11)));

        for _ in 0..2_000 {
            let size = engine.draw_size();
            assert!(size >= config.min_size_usd && size <= config.max_size_usd);

            let hold = engine.draw_millis(config.min_hold_time_ms, config.max_hold_time_ms);
            assert!(hold >= Duration::from_millis(config.min_hold_time_ms));
            assert!(hold <= Duration::from_millis(config.max_hold_time_ms));
        }
    }

    #[test]
    fn test_leg_outcome() {
        let entry = Order {
            order_id: "1".to_string(),
            symbol: "BTC".to_string(),
            contract_id: "BTCUSDT".to_string(),
            side: OrderSide::Sell,
            order_type: OrderType::Limit,
            quantity: dec!(0.01),
            price: Some(dec!(49009.8)),
            time_in_force: TimeInForce::Ioc,
            reduce_only: false,
            status: OrderStatus::Filled,
            filled_quantity: dec!(0.01),
            avg_fill_price: Some(dec!(50010)),
        };
        let mut exit = entry.clone();
        exit.side = OrderSide::Buy;
        exit.avg_fill_price = Some(dec!(49910));

        assert_eq!(leg_outcome(&entry, Some(&exit)), (Some(dec!(49910)), Some(dec!(1))));
        assert_eq!(leg_outcome(&entry, None), (None, None));
    }
}
