//! SQLite persistence for hedge cycle trade records.
//!
//! One row per cycle: created when both legs are submitted, closed when the
//! legs are flattened. Only the hedge engine writes these rows.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::exchange::OrderSide;

/// Lifecycle status of a trade record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeStatus {
    Open,
    Close,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Open => "open",
            TradeStatus::Close => "close",
        }
    }
}

/// Fields written when a cycle opens.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTradeRecord {
    pub symbol: String,
    /// Base-asset quantity traded on each leg
    pub size: Decimal,
    /// Unix seconds
    pub opened_at: i64,
    /// Side of the first leg; the second leg is the opposite
    pub first_side: OrderSide,
    pub first_order_id: String,
    pub second_order_id: String,
    pub first_entry_price: Option<Decimal>,
    pub second_entry_price: Option<Decimal>,
}

/// Fields written when a cycle closes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TradeRecordUpdate {
    /// Unix seconds
    pub closed_at: i64,
    pub first_close_order_id: Option<String>,
    pub second_close_order_id: Option<String>,
    pub first_exit_price: Option<Decimal>,
    pub second_exit_price: Option<Decimal>,
    pub first_pnl: Option<Decimal>,
    pub second_pnl: Option<Decimal>,
    /// first_pnl - second_pnl
    pub spread: Option<Decimal>,
}

/// Stored trade record.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRecord {
    pub id: i64,
    pub symbol: String,
    pub size: Decimal,
    pub status: TradeStatus,
    pub opened_at: i64,
    pub closed_at: Option<i64>,
    pub first_side: OrderSide,
    pub first_order_id: String,
    pub second_order_id: String,
    pub first_entry_price: Option<Decimal>,
    pub second_entry_price: Option<Decimal>,
    pub first_close_order_id: Option<String>,
    pub second_close_order_id: Option<String>,
    pub first_exit_price: Option<Decimal>,
    pub second_exit_price: Option<Decimal>,
    pub first_pnl: Option<Decimal>,
    pub second_pnl: Option<Decimal>,
    pub spread: Option<Decimal>,
}

/// Storage for trade records. Optional at runtime.
#[cfg_attr(test, mockall::automock)]
pub trait TradeRecordStore: Send + Sync {
    /// Insert an open record.
    fn create(&self, record: NewTradeRecord) -> Result<TradeRecord>;

    /// Close a record with exit data.
    fn update(&self, id: i64, update: TradeRecordUpdate) -> Result<TradeRecord>;

    /// Most recent records, newest first.
    fn recent(&self, limit: usize) -> Result<Vec<TradeRecord>>;
}

/// SQLite-backed trade record store.
pub struct SqliteTradeStore {
    conn: Mutex<Connection>,
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, symbol, size, status, opened_at, closed_at, first_side,
           first_order_id, second_order_id, first_entry_price, second_entry_price,
           first_close_order_id, second_close_order_id, first_exit_price, second_exit_price,
           first_pnl, second_pnl, spread
    FROM trades
"#;

fn decimal_text(value: Option<Decimal>) -> Option<String> {
    value.map(|v| v.to_string())
}

fn parse_decimal(text: Option<String>) -> Option<Decimal> {
    text.and_then(|t| Decimal::from_str(&t).ok())
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<TradeRecord> {
    let status: String = row.get(3)?;
    let side: String = row.get(6)?;

    Ok(TradeRecord {
        id: row.get(0)?,
        symbol: row.get(1)?,
        size: Decimal::from_str(&row.get::<_, String>(2)?).unwrap_or_default(),
        status: if status == "close" {
            TradeStatus::Close
        } else {
            TradeStatus::Open
        },
        opened_at: row.get(4)?,
        closed_at: row.get(5)?,
        first_side: if side == "sell" {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        },
        first_order_id: row.get(7)?,
        second_order_id: row.get(8)?,
        first_entry_price: parse_decimal(row.get(9)?),
        second_entry_price: parse_decimal(row.get(10)?),
        first_close_order_id: row.get(11)?,
        second_close_order_id: row.get(12)?,
        first_exit_price: parse_decimal(row.get(13)?),
        second_exit_price: parse_decimal(row.get(14)?),
        first_pnl: parse_decimal(row.get(15)?),
        second_pnl: parse_decimal(row.get(16)?),
        spread: parse_decimal(row.get(17)?),
    })
}

impl SqliteTradeStore {
    /// Open (or create) the database and initialize the schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at {:?}", db_path))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("Trade store initialized at {:?}", db_path);
        Ok(store)
    }

    /// In-memory store, used by tests.
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("trade store connection mutex poisoned"))
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        self.lock()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                size TEXT NOT NULL,
                status TEXT NOT NULL,
                opened_at INTEGER NOT NULL,
                closed_at INTEGER,
                first_side TEXT NOT NULL,
                first_order_id TEXT NOT NULL,
                second_order_id TEXT NOT NULL,
                first_entry_price TEXT,
                second_entry_price TEXT,
                first_close_order_id TEXT,
                second_close_order_id TEXT,
                first_exit_price TEXT,
                second_exit_price TEXT,
                first_pnl TEXT,
                second_pnl TEXT,
                spread TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol);
            CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    fn fetch(conn: &Connection, id: i64) -> Result<TradeRecord> {
        conn.query_row(
            &format!("{SELECT_COLUMNS} WHERE id = ?1"),
            [id],
            row_to_record,
        )
        .optional()?
        .ok_or_else(|| anyhow!("trade record {id} not found"))
    }
}

impl TradeRecordStore for SqliteTradeStore {
    fn create(&self, record: NewTradeRecord) -> Result<TradeRecord> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO trades (symbol, size, status, opened_at, first_side,
                                first_order_id, second_order_id,
                                first_entry_price, second_entry_price)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                record.symbol,
                record.size.to_string(),
                TradeStatus::Open.as_str(),
                record.opened_at,
                record.first_side.as_str(),
                record.first_order_id,
                record.second_order_id,
                decimal_text(record.first_entry_price),
                decimal_text(record.second_entry_price),
            ],
        )?;

        let id = conn.last_insert_rowid();
        debug!(id, symbol = %record.symbol, size = %record.size, "Trade record created");
        Self::fetch(&conn, id)
    }

    fn update(&self, id: i64, update: TradeRecordUpdate) -> Result<TradeRecord> {
        let conn = self.lock()?;
        let changed = conn.execute(
            r#"
            UPDATE trades SET
                status = ?2,
                closed_at = ?3,
                first_close_order_id = ?4,
                second_close_order_id = ?5,
                first_exit_price = ?6,
                second_exit_price = ?7,
                first_pnl = ?8,
                second_pnl = ?9,
                spread = ?10
            WHERE id = ?1
            "#,
            params![
                id,
                TradeStatus::Close.as_str(),
                update.closed_at,
                update.first_close_order_id,
                update.second_close_order_id,
                decimal_text(update.first_exit_price),
                decimal_text(update.second_exit_price),
                decimal_text(update.first_pnl),
                decimal_text(update.second_pnl),
                decimal_text(update.spread),
            ],
        )?;
        anyhow::ensure!(changed == 1, "trade record {id} not found");

        debug!(id, spread = ?update.spread, "Trade record closed");
        Self::fetch(&conn, id)
    }

    fn recent(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY id DESC LIMIT ?1"))?;
        let records = stmt
            .query_map([limit as i64], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}
