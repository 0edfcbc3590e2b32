//! Volume Hedger - Main Entry Point

use anyhow::{bail, Context, Result};
use chrono::DateTime;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;
use volume_hedger::config::{BinanceConfig, Config, VenueConfig, VenueKind};
use volume_hedger::exchange::{BinanceFuturesClient, ExchangeCapability, PaperExchange};
use volume_hedger::hedge::HedgeEngine;
use volume_hedger::persistence::{SqliteTradeStore, TradeRecordStore, TradeStatus};

/// How often paper venues pull fresh prices from Binance
const PRICE_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Volume Hedger CLI
#[derive(Parser)]
#[command(name = "volume-hedger")]
#[command(version, about = "Randomized delta-neutral hedge cycles across two perpetual futures accounts")]
struct Cli {
    /// Override the configured symbols (e.g. BTC,ETH)
    #[arg(long, global = true, value_delimiter = ',')]
    symbols: Option<Vec<String>>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Close every open position on both venues and exit
    Flatten,

    /// Show recent hedge cycles from the trade database
    Status {
        /// Path to SQLite database (default: persistence.db_path)
        #[arg(short, long)]
        db: Option<String>,

        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let mut config = Config::load()?;
    if let Some(symbols) = cli.symbols {
        config.symbols = symbols
            .into_iter()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    match cli.command {
        Some(Commands::Status { db, limit }) => {
            let db_path = db.unwrap_or_else(|| config.persistence.db_path.clone());
            show_status(&db_path, limit)
        }
        Some(Commands::Flatten) => {
            let engine = build_engine(&config).await?;
            flatten_all(&engine, &config.symbols).await
        }
        None => {
            info!(
                "Volume Hedger v{} starting",
                env!("CARGO_PKG_VERSION")
            );
            let engine = build_engine(&config).await?;
            run_until_stopped(engine, config.symbols).await
        }
    }
}

/// Validate configuration, wire both venues and the store, and initialize.
async fn build_engine(config: &Config) -> Result<Arc<HedgeEngine>> {
    config.validate()?;
    log_config(config);

    let first = build_venue("first", &config.first, &config.symbols).await?;
    let second = build_venue("second", &config.second, &config.symbols).await?;

    let store: Option<Arc<dyn TradeRecordStore>> = if config.persistence.enabled {
        Some(Arc::new(SqliteTradeStore::new(&config.persistence.db_path)?))
    } else {
        info!("📂 [PERSISTENCE] Disabled, cycles will not be recorded");
        None
    };

    let engine = HedgeEngine::new(first, second, store, config.hedge.clone())?;
    engine
        .initialize()
        .await
        .context("Failed to initialize venues")?;

    Ok(Arc::new(engine))
}

async fn build_venue(
    name: &str,
    venue: &VenueConfig,
    symbols: &[String],
) -> Result<Arc<dyn ExchangeCapability>> {
    match venue.kind {
        VenueKind::Binance => {
            let client = BinanceFuturesClient::new(name, &venue.binance())?;
            info!(venue = name, testnet = venue.testnet, "Using Binance futures account");
            Ok(Arc::new(client))
        }
        VenueKind::Paper => {
            let paper = Arc::new(PaperExchange::new(name, venue.paper_balance));
            start_price_feed(paper.clone(), symbols.to_vec(), venue.testnet).await?;
            info!(venue = name, balance = %venue.paper_balance, "📝 Using paper venue");
            Ok(paper)
        }
    }
}

/// Seed a paper venue from Binance public prices and keep refreshing them.
async fn start_price_feed(
    paper: Arc<PaperExchange>,
    symbols: Vec<String>,
    testnet: bool,
) -> Result<()> {
    let feed = BinanceFuturesClient::new(
        format!("{}-prices", paper.name()),
        &BinanceConfig {
            testnet,
            ..Default::default()
        },
    )?;
    feed.load_contracts()
        .await
        .context("Failed to load contracts for paper price feed")?;
    refresh_prices(&feed, &paper, &symbols).await;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PRICE_REFRESH_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            refresh_prices(&feed, &paper, &symbols).await;
        }
    });

    Ok(())
}

async fn refresh_prices(feed: &BinanceFuturesClient, paper: &PaperExchange, symbols: &[String]) {
    for symbol in symbols {
        match feed.get_ticker(symbol).await {
            Ok(ticker) => paper.set_price(symbol, ticker.last_price).await,
            Err(e) => warn!(%symbol, error = %e, "Failed to refresh paper price"),
        }
    }
}

/// Run hedge cycles until Ctrl-C, then flatten everything.
async fn run_until_stopped(engine: Arc<HedgeEngine>, symbols: Vec<String>) -> Result<()> {
    let shutdown = tokio::spawn({
        let engine = engine.clone();
        let symbols = symbols.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("🛑 Shutdown signal received");
                if !engine.stop_all(&symbols).await {
                    error!("Positions remain open after shutdown flatten");
                }
            }
        }
    });

    info!("🚀 Starting hedge loop...");
    engine.run(&symbols).await?;

    shutdown.await.context("Shutdown task failed")?;
    info!("👋 Volume Hedger stopped");
    Ok(())
}

async fn flatten_all(engine: &HedgeEngine, symbols: &[String]) -> Result<()> {
    let mut still_open = Vec::new();
    for symbol in symbols {
        if engine.close_positions(symbol).await {
            info!(%symbol, "✅ Flat on both venues");
        } else {
            error!(%symbol, "❌ Positions still open");
            still_open.push(symbol.as_str());
        }
    }

    if !still_open.is_empty() {
        bail!("positions still open for: {}", still_open.join(", "));
    }
    Ok(())
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "volume-hedger.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("volume_hedger=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    let hedge = &config.hedge;
    info!("📋 Configuration:");
    info!("   Symbols: {}", config.symbols.join(", "));
    info!("   First Venue: {:?}", config.first.kind);
    info!("   Second Venue: {:?}", config.second.kind);
    info!("   Size: ${} - ${}", hedge.min_size_usd, hedge.max_size_usd);
    info!(
        "   Hold: {}s - {}s",
        hedge.min_hold_time_ms / 1000,
        hedge.max_hold_time_ms / 1000
    );
    info!(
        "   Pause: {}ms - {}ms",
        hedge.min_sleep_between_orders_ms, hedge.max_sleep_between_orders_ms
    );
    info!("   Slippage: {:.2}%", hedge.slippage * dec!(100));
    if config.persistence.enabled {
        info!("   Trade DB: {}", config.persistence.db_path);
    }
}

fn show_status(db_path: &str, limit: usize) -> Result<()> {
    use std::path::Path;

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              VOLUME HEDGER STATUS                          ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   No cycles have been recorded yet, or the database path is incorrect.");
        return Ok(());
    }

    let store = SqliteTradeStore::new(db_path)?;
    let records = store.recent(limit)?;
    if records.is_empty() {
        println!("\n❌ No trade records found.");
        return Ok(());
    }

    let closed: Vec<_> = records
        .iter()
        .filter(|r| r.status == TradeStatus::Close)
        .collect();
    let total_spread: Decimal = closed.iter().filter_map(|r| r.spread).sum();

    println!("\n📊 Last {} cycles", records.len());
    println!("   ├─ Closed:       {}", closed.len());
    println!("   ├─ Still open:   {}", records.len() - closed.len());
    println!("   └─ Net spread:   ${:.4}", total_spread);

    println!("\n📈 Cycles");
    for record in &records {
        let opened = DateTime::from_timestamp(record.opened_at, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        let spread = record
            .spread
            .map(|s| format!("{:+.4}", s))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "   #{:<5} {:<6} {:<5} first {:<4} qty {:<12} opened {}  spread {}",
            record.id,
            record.symbol,
            record.status.as_str(),
            record.first_side.as_str(),
            record.size,
            opened,
            spread
        );
    }

    println!();
    Ok(())
}
