//! Binance USDⓈ-M futures REST adapter.

use super::types::*;
use crate::config::BinanceConfig;
use crate::exchange::error::ExchangeError;
use crate::exchange::traits::ExchangeCapability;
use crate::exchange::types::*;
use crate::utils::decimal::{round_down_to_lot, round_down_to_tick, round_up_to_tick};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

const FUTURES_BASE_URL: &str = "https://fapi.binance.com";
const FUTURES_TESTNET_URL: &str = "https://testnet.binancefuture.com";
const RECV_WINDOW_MS: u64 = 5000;

/// Trading rules cached per contract at initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractSpec {
    pub contract_id: String,
    /// PRICE_FILTER tick size
    pub tick_size: Decimal,
    /// LOT_SIZE step size
    pub step_size: Decimal,
}

/// One Binance futures account exposed as an [`ExchangeCapability`].
pub struct BinanceFuturesClient {
    name: String,
    http: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
    /// Keyed by both base asset ("BTC") and contract name ("BTCUSDT")
    contracts: RwLock<HashMap<String, ContractSpec>>,
    connected: AtomicBool,
}

impl BinanceFuturesClient {
    /// Create a new client from configuration.
    pub fn new(name: impl Into<String>, config: &BinanceConfig) -> Result<Self> {
        let base_url = if config.testnet {
            FUTURES_TESTNET_URL
        } else {
            FUTURES_BASE_URL
        };
        Self::with_base_url(name, config, base_url)
    }

    /// Create a new client against a custom base URL.
    pub fn with_base_url(
        name: impl Into<String>,
        config: &BinanceConfig,
        base_url: &str,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            name: name.into(),
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            contracts: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(false),
        })
    }

    /// Generate HMAC-SHA256 signature for authenticated requests.
    fn sign(&self, query_string: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn encode_params(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Map a non-success response to the failure taxonomy.
    fn classify_error(&self, status: StatusCode, body: &str) -> ExchangeError {
        let parsed: Option<ApiErrorBody> = serde_json::from_str(body).ok();
        let (code, msg) = parsed
            .map(|e| (e.code, e.msg))
            .unwrap_or((i64::from(status.as_u16()), body.to_string()));

        let auth_failure = status == StatusCode::UNAUTHORIZED
            || status == StatusCode::FORBIDDEN
            || matches!(code, -2014 | -2015 | -1022);
        // 418 means the IP was banned after ignoring 429s
        let rate_limited = status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::IM_A_TEAPOT
            || code == -1003;

        if auth_failure {
            ExchangeError::authentication(&self.name, msg)
        } else if rate_limited {
            ExchangeError::rate_limit(&self.name, msg)
        } else {
            ExchangeError::business(&self.name, code, msg)
        }
    }

    async fn decode<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T, ExchangeError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExchangeError::network(&self.name, e.to_string()))?;

        if !status.is_success() {
            return Err(self.classify_error(status, &body));
        }

        serde_json::from_str(&body).map_err(|e| {
            ExchangeError::network(&self.name, format!("malformed response: {e}"))
        })
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let mut url = format!("{}{}", self.base_url, path);
        if !params.is_empty() {
            url = format!("{}?{}", url, Self::encode_params(params));
        }

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::network(&self.name, e.to_string()))?;

        self.decode(response).await
    }

    async fn signed_request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> Result<T, ExchangeError> {
        params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));

        let query_string = Self::encode_params(&params);
        let signature = self.sign(&query_string);
        let url = format!(
            "{}{}?{}&signature={}",
            self.base_url, path, query_string, signature
        );

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| ExchangeError::network(&self.name, e.to_string()))?;

        self.decode(response).await
    }

    async fn contract_spec(&self, symbol: &str) -> Result<ContractSpec, ExchangeError> {
        self.contracts
            .read()
            .await
            .get(&symbol.to_uppercase())
            .cloned()
            .ok_or_else(|| ExchangeError::unknown_symbol(&self.name, symbol))
    }

    /// Load tradable perpetual contracts into the symbol cache.
    #[instrument(skip(self), fields(venue = %self.name))]
    pub async fn load_contracts(&self) -> Result<usize, ExchangeError> {
        let info: FuturesExchangeInfo = self.public_get("/fapi/v1/exchangeInfo", &[]).await?;

        let mut contracts = self.contracts.write().await;
        contracts.clear();
        for s in info.symbols.into_iter().filter(|s| s.is_tradable_perpetual()) {
            let spec = ContractSpec {
                contract_id: s.symbol.clone(),
                tick_size: s.tick_size(),
                step_size: s.step_size(),
            };
            contracts.insert(s.base_asset.clone(), spec.clone());
            contracts.insert(s.symbol, spec);
        }

        debug!(count = contracts.len(), "Loaded futures contracts");
        Ok(contracts.len())
    }
}

#[async_trait]
impl ExchangeCapability for BinanceFuturesClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    #[instrument(skip(self), fields(venue = %self.name))]
    async fn initialize(&self) -> Result<(), ExchangeError> {
        if self.is_connected() {
            return Ok(());
        }

        self.load_contracts().await?;
        // Credentials are only proven by a signed call
        let balance = self.get_balance().await?;

        self.connected.store(true, Ordering::SeqCst);
        info!(
            venue = %self.name,
            available = %balance.available,
            "Binance futures account connected"
        );
        Ok(())
    }

    async fn resolve_contract_id(&self, symbol: &str) -> Result<String, ExchangeError> {
        Ok(self.contract_spec(symbol).await?.contract_id)
    }

    #[instrument(skip(self), fields(venue = %self.name))]
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let contract = self.contract_spec(symbol).await?.contract_id;
        let ticker: PriceTicker = self
            .public_get("/fapi/v1/ticker/price", &[("symbol", contract)])
            .await?;

        Ok(Ticker {
            symbol: symbol.to_string(),
            last_price: ticker.price,
            bid_price: None,
            ask_price: None,
            timestamp: ticker.time,
        })
    }

    #[instrument(skip(self), fields(venue = %self.name))]
    async fn get_position(&self, symbol: &str) -> Result<Option<Position>, ExchangeError> {
        let contract = self.contract_spec(symbol).await?.contract_id;
        let rows: Vec<PositionRisk> = self
            .signed_request(
                Method::GET,
                "/fapi/v2/positionRisk",
                vec![("symbol", contract.clone())],
            )
            .await?;

        // One-way mode reports a single BOTH row; hedge mode reports two
        let row = rows
            .iter()
            .find(|r| !r.position_amt.is_zero())
            .or_else(|| rows.first());

        Ok(row.map(|r| {
            let mut position =
                Position::from_signed(symbol, &contract, r.position_amt, r.entry_price);
            position.unrealized_pnl = r.unrealized_profit;
            position.margin_used = if r.isolated_margin > Decimal::ZERO {
                r.isolated_margin
            } else if r.leverage > Decimal::ZERO {
                r.notional.abs() / r.leverage
            } else {
                r.notional.abs()
            };
            position.liquidation_price =
                (r.liquidation_price > Decimal::ZERO).then_some(r.liquidation_price);
            position
        }))
    }

    #[instrument(skip(self), fields(venue = %self.name))]
    async fn get_balance(&self) -> Result<Balance, ExchangeError> {
        let balances: Vec<AccountBalance> = self
            .signed_request(Method::GET, "/fapi/v2/balance", Vec::new())
            .await?;

        balances
            .into_iter()
            .find(|b| b.asset == "USDT")
            .map(|b| Balance {
                asset: b.asset,
                total: b.margin_balance,
                available: b.available_balance,
            })
            .ok_or_else(|| ExchangeError::business(&self.name, 0, "no USDT balance on account"))
    }

    #[instrument(skip(self), fields(venue = %self.name))]
    async fn place_order(&self, request: &OrderRequest) -> Result<Order, ExchangeError> {
        let spec = self.contract_spec(&request.symbol).await?;
        let quantity = round_down_to_lot(request.quantity, spec.step_size);
        if quantity <= Decimal::ZERO {
            return Err(ExchangeError::business(
                &self.name,
                -4003,
                format!(
                    "quantity {} below lot step {}",
                    request.quantity, spec.step_size
                ),
            ));
        }

        let mut params = vec![
            ("symbol", spec.contract_id.clone()),
            ("side", request.side.as_str().to_uppercase()),
            ("quantity", quantity.normalize().to_string()),
            ("newOrderRespType", "RESULT".to_string()),
        ];

        match (request.order_type, request.price) {
            (OrderType::Limit, Some(price)) => {
                // Buys round up, sells round down
                let price = match request.side {
                    OrderSide::Buy => round_up_to_tick(price, spec.tick_size),
                    OrderSide::Sell => round_down_to_tick(price, spec.tick_size),
                };
                let tif = match request.time_in_force {
                    TimeInForce::Gtc => "GTC",
                    TimeInForce::Ioc => "IOC",
                    TimeInForce::Fok => "FOK",
                };
                params.push(("type", "LIMIT".to_string()));
                params.push(("price", price.normalize().to_string()));
                params.push(("timeInForce", tif.to_string()));
            }
            _ => params.push(("type", "MARKET".to_string())),
        }

        if request.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        debug!(?request, "Placing futures order");

        let response: OrderResponse = self
            .signed_request(Method::POST, "/fapi/v1/order", params)
            .await?;

        Ok(Order {
            order_id: response.order_id.to_string(),
            symbol: request.symbol.clone(),
            contract_id: response.symbol,
            side: response.side.into(),
            order_type: request.order_type,
            quantity: response.orig_qty,
            price: (response.price > Decimal::ZERO).then_some(response.price),
            time_in_force: response
                .time_in_force
                .map(TimeInForce::from)
                .unwrap_or(request.time_in_force),
            reduce_only: response.reduce_only,
            status: response.status.into(),
            filled_quantity: response.executed_qty,
            avg_fill_price: (response.avg_price > Decimal::ZERO).then_some(response.avg_price),
        })
    }
}
