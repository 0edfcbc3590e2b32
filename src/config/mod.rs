//! Configuration management for the volume hedger.
//!
//! Loads settings from environment variables and config files. Every field
//! has a default, so a partial file or environment merges over them.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base symbols to cycle through (e.g. "BTC")
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    /// Venue holding the first leg
    #[serde(default)]
    pub first: VenueConfig,
    /// Venue holding the second (opposite) leg
    #[serde(default)]
    pub second: VenueConfig,
    /// Hedge cycle sizing and cadence
    #[serde(default)]
    pub hedge: HedgeConfig,
    /// Trade record persistence
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

/// Which adapter backs a venue slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VenueKind {
    Binance,
    #[default]
    Paper,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    #[serde(default)]
    pub kind: VenueKind,
    /// API key for authentication
    #[serde(default)]
    pub api_key: String,
    /// Secret key for signing requests
    #[serde(default)]
    pub secret_key: String,
    /// Use testnet instead of production
    #[serde(default)]
    pub testnet: bool,
    /// Starting USDT balance when `kind = "paper"`
    #[serde(default = "default_paper_balance")]
    pub paper_balance: Decimal,
}

impl VenueConfig {
    /// Credentials for the Binance adapter.
    pub fn binance(&self) -> BinanceConfig {
        BinanceConfig {
            api_key: self.api_key.clone(),
            secret_key: self.secret_key.clone(),
            testnet: self.testnet,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BinanceConfig {
    pub api_key: String,
    pub secret_key: String,
    pub testnet: bool,
}

/// Sizing, timing and slippage for hedge cycles. All ranges are inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HedgeConfig {
    /// Minimum notional per leg in USD
    #[serde(default = "default_min_size_usd")]
    pub min_size_usd: Decimal,
    /// Maximum notional per leg in USD
    #[serde(default = "default_max_size_usd")]
    pub max_size_usd: Decimal,
    /// Minimum pause between cycles (ms)
    #[serde(default = "default_min_sleep_ms")]
    pub min_sleep_between_orders_ms: u64,
    /// Maximum pause between cycles (ms)
    #[serde(default = "default_max_sleep_ms")]
    pub max_sleep_between_orders_ms: u64,
    /// Minimum time a hedged pair stays open (ms)
    #[serde(default = "default_min_hold_ms")]
    pub min_hold_time_ms: u64,
    /// Maximum time a hedged pair stays open (ms)
    #[serde(default = "default_max_hold_ms")]
    pub max_hold_time_ms: u64,
    /// Slippage tolerance applied to limit prices (0.0-1.0)
    #[serde(default = "default_slippage")]
    pub slippage: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Record each cycle in SQLite
    #[serde(default = "default_persistence_enabled")]
    pub enabled: bool,
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

// Default value functions
fn default_symbols() -> Vec<String> {
    vec!["BTC".to_string(), "ETH".to_string()]
}

fn default_paper_balance() -> Decimal {
    Decimal::new(10_000, 0) // 10k USDT
}

fn default_min_size_usd() -> Decimal {
    Decimal::new(100, 0)
}

fn default_max_size_usd() -> Decimal {
    Decimal::new(1000, 0)
}

fn default_min_sleep_ms() -> u64 {
    1_000
}

fn default_max_sleep_ms() -> u64 {
    5_000
}

fn default_min_hold_ms() -> u64 {
    30_000
}

fn default_max_hold_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_slippage() -> Decimal {
    Decimal::new(2, 2) // 0.02
}

fn default_persistence_enabled() -> bool {
    true
}

fn default_db_path() -> String {
    "data/trades.db".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .prefix("VH")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("symbols"),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.symbols.is_empty(), "at least one symbol is required");

        self.hedge.validate()?;

        for (slot, venue) in [("first", &self.first), ("second", &self.second)] {
            if venue.kind == VenueKind::Binance {
                anyhow::ensure!(
                    !venue.api_key.is_empty() && !venue.secret_key.is_empty(),
                    "{slot} venue is binance but has no API credentials"
                );
            }
        }

        Ok(())
    }
}

impl HedgeConfig {
    /// Check that every range is ordered and slippage is a fraction.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.min_size_usd > Decimal::ZERO && self.min_size_usd <= self.max_size_usd,
            "min_size_usd must be > 0 and <= max_size_usd"
        );

        anyhow::ensure!(
            self.min_sleep_between_orders_ms <= self.max_sleep_between_orders_ms,
            "min_sleep_between_orders_ms must be <= max_sleep_between_orders_ms"
        );

        anyhow::ensure!(
            self.min_hold_time_ms <= self.max_hold_time_ms,
            "min_hold_time_ms must be <= max_hold_time_ms"
        );

        anyhow::ensure!(
            self.slippage >= Decimal::ZERO && self.slippage < Decimal::ONE,
            "slippage must be in [0, 1)"
        );

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            first: VenueConfig::default(),
            second: VenueConfig::default(),
            hedge: HedgeConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            kind: VenueKind::Paper,
            api_key: String::new(),
            secret_key: String::new(),
            testnet: false,
            paper_balance: default_paper_balance(),
        }
    }
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            min_size_usd: default_min_size_usd(),
            max_size_usd: default_max_size_usd(),
            min_sleep_between_orders_ms: default_min_sleep_ms(),
            max_sleep_between_orders_ms: default_max_sleep_ms(),
            min_hold_time_ms: default_min_hold_ms(),
            max_hold_time_ms: default_max_hold_ms(),
            slippage: default_slippage(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: default_persistence_enabled(),
            db_path: default_db_path(),
        }
    }
}
