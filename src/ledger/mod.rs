//! SQLite-backed portfolio ledger and historical price store.
//!
//! The ledger is the one piece of mutable shared state: the risk gate reads
//! it, the executor writes it. All writes are durable once the call returns.
//! Reads used for risk approval are point-in-time snapshots; nothing is held
//! locked across order placement (see the executor's drift re-check).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::exchange::{Candle, Side, SymbolPair, VenueId};

/// An open position owned by the ledger.
///
/// Mutated only through the executor's confirmed fills.
#[derive(Debug, Clone)]
pub struct Position {
    pub symbol: SymbolPair,
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Notional value at entry.
    pub fn notional(&self) -> Decimal {
        self.quantity * self.entry_price
    }
}

/// A single executed order leg.
#[derive(Debug, Clone)]
pub struct TradeRecord {
    pub symbol: SymbolPair,
    pub venue: VenueId,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub executed_at: DateTime<Utc>,
}

impl TradeRecord {
    /// Side-signed cash flow: sells positive, buys negative.
    pub fn signed_value(&self) -> Decimal {
        match self.side {
            Side::Sell => self.price * self.quantity,
            Side::Buy => -(self.price * self.quantity),
        }
    }
}

/// Lifecycle of a two-leg arbitrage execution.
///
/// `BuyFilled` is the recorded intermediate state: a crash between legs
/// leaves an inspectable row showing that a naked position exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbStatus {
    BuyFilled,
    Completed,
    PartialFill,
}

impl ArbStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArbStatus::BuyFilled => "buy_filled",
            ArbStatus::Completed => "completed",
            ArbStatus::PartialFill => "partial_fill",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "buy_filled" => Some(ArbStatus::BuyFilled),
            "completed" => Some(ArbStatus::Completed),
            "partial_fill" => Some(ArbStatus::PartialFill),
            _ => None,
        }
    }
}

/// Snapshot of a two-leg arbitrage execution, immutable once completed.
///
/// Realized profit is recomputed from actual fill prices, never from the
/// pre-trade estimate.
#[derive(Debug, Clone)]
pub struct ArbitrageTrade {
    pub trade_id: String,
    pub symbol: SymbolPair,
    pub buy_venue: VenueId,
    pub sell_venue: VenueId,
    pub buy_order_id: String,
    pub sell_order_id: Option<String>,
    pub buy_price: Decimal,
    pub sell_price: Option<Decimal>,
    pub quantity: Decimal,
    pub realized_profit: Option<Decimal>,
    pub status: ArbStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Read-only portfolio view taken at decision time.
///
/// Reflects the state "as of now"; not transactionally locked across the
/// decision that consumes it.
#[derive(Debug, Clone)]
pub struct PortfolioSnapshot {
    pub total_value: Decimal,
    pub exposures: HashMap<SymbolPair, Decimal>,
    pub taken_at: DateTime<Utc>,
}

impl PortfolioSnapshot {
    /// Capture the current portfolio state from the ledger.
    pub fn capture<L: LedgerRead + ?Sized>(ledger: &L) -> Result<Self> {
        let total_value = ledger.portfolio_value()?;
        let exposures = ledger
            .positions()?
            .into_iter()
            .map(|p| (p.symbol.clone(), p.notional()))
            .collect();

        Ok(Self {
            total_value,
            exposures,
            taken_at: Utc::now(),
        })
    }
}

/// Read side of the ledger contract.
pub trait LedgerRead: Send + Sync {
    fn portfolio_value(&self) -> Result<Decimal>;
    fn positions(&self) -> Result<Vec<Position>>;
    fn trades_since(&self, since: DateTime<Utc>) -> Result<Vec<TradeRecord>>;
}

/// Write side of the ledger contract.
pub trait LedgerWrite: Send + Sync {
    fn record_trade(&self, trade: &TradeRecord) -> Result<()>;
    /// Insert or replace a position; zero quantity removes it.
    fn upsert_position(&self, position: &Position) -> Result<()>;
    fn record_arbitrage_trade(&self, record: &ArbitrageTrade) -> Result<()>;
    /// Finalize the sell leg of a previously recorded arbitrage trade.
    fn update_arbitrage_trade(
        &self,
        trade_id: &str,
        status: ArbStatus,
        sell_order_id: Option<&str>,
        sell_price: Option<Decimal>,
        realized_profit: Option<Decimal>,
    ) -> Result<()>;
}

/// Historical price reader used by sizing, hedging, and weight optimization.
pub trait PriceHistory: Send + Sync {
    fn record_candle(&self, candle: &Candle) -> Result<()>;
    /// Most recent `lookback` closes for a symbol, oldest first.
    fn get_closes(&self, symbol: &SymbolPair, lookback: usize) -> Result<Vec<Decimal>>;
}

/// Full ledger capability bundle.
pub trait Ledger: LedgerRead + LedgerWrite + PriceHistory {}
impl<T: LedgerRead + LedgerWrite + PriceHistory> Ledger for T {}

/// SQLite implementation of the ledger contract.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    /// Open (or create) the ledger at the given path.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open ledger at {:?}", db_path.as_ref()))?;

        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.init_schema()?;

        info!("Ledger initialized at {:?}", db_path.as_ref());
        Ok(ledger)
    }

    /// In-memory ledger for tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        conn.execute_batch(
            r#"
            -- Cash balance (singleton row)
            CREATE TABLE IF NOT EXISTS account (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                balance TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Open positions
            CREATE TABLE IF NOT EXISTS positions (
                symbol TEXT PRIMARY KEY,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                stop_loss TEXT,
                take_profit TEXT,
                opened_at TEXT NOT NULL
            );

            -- Executed order legs
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                venue TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                executed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_executed ON trades(executed_at);
            CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol);

            -- Two-leg arbitrage executions
            CREATE TABLE IF NOT EXISTS arbitrage_trades (
                trade_id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                buy_venue TEXT NOT NULL,
                sell_venue TEXT NOT NULL,
                buy_order_id TEXT NOT NULL,
                sell_order_id TEXT,
                buy_price TEXT NOT NULL,
                sell_price TEXT,
                quantity TEXT NOT NULL,
                realized_profit TEXT,
                status TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                closed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_arb_opened ON arbitrage_trades(opened_at);

            -- Historical quotes (one candle per venue per poll cycle)
            CREATE TABLE IF NOT EXISTS candles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                venue TEXT NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_candles_symbol_ts ON candles(symbol, timestamp);
            "#,
        )?;

        debug!("Ledger schema initialized");
        Ok(())
    }

    /// Set the cash balance.
    pub fn set_balance(&self, balance: Decimal) -> Result<()> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        conn.execute(
            r#"
            INSERT INTO account (id, balance, updated_at) VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET balance = ?1, updated_at = ?2
            "#,
            params![balance.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Cash balance, zero if never set.
    pub fn balance(&self) -> Result<Decimal> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        let row: Option<String> = conn
            .query_row("SELECT balance FROM account WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        Ok(row
            .and_then(|s| Decimal::from_str(&s).ok())
            .unwrap_or(Decimal::ZERO))
    }

    /// Recent arbitrage executions, newest first.
    pub fn recent_arbitrage_trades(&self, limit: usize) -> Result<Vec<ArbitrageTrade>> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        let mut stmt = conn.prepare(
            r#"
            SELECT trade_id, symbol, buy_venue, sell_venue, buy_order_id, sell_order_id,
                   buy_price, sell_price, quantity, realized_profit, status, opened_at, closed_at
            FROM arbitrage_trades
            ORDER BY opened_at DESC
            LIMIT ?1
            "#,
        )?;

        let trades = stmt
            .query_map([limit], |row| {
                Ok(RawArbRow {
                    trade_id: row.get(0)?,
                    symbol: row.get(1)?,
                    buy_venue: row.get(2)?,
                    sell_venue: row.get(3)?,
                    buy_order_id: row.get(4)?,
                    sell_order_id: row.get(5)?,
                    buy_price: row.get(6)?,
                    sell_price: row.get(7)?,
                    quantity: row.get(8)?,
                    realized_profit: row.get(9)?,
                    status: row.get(10)?,
                    opened_at: row.get(11)?,
                    closed_at: row.get(12)?,
                })
            })?
            .filter_map(|r| r.ok())
            .filter_map(|raw| raw.into_trade())
            .collect();

        Ok(trades)
    }
}

struct RawArbRow {
    trade_id: String,
    symbol: String,
    buy_venue: String,
    sell_venue: String,
    buy_order_id: String,
    sell_order_id: Option<String>,
    buy_price: String,
    sell_price: Option<String>,
    quantity: String,
    realized_profit: Option<String>,
    status: String,
    opened_at: String,
    closed_at: Option<String>,
}

impl RawArbRow {
    fn into_trade(self) -> Option<ArbitrageTrade> {
        Some(ArbitrageTrade {
            trade_id: self.trade_id,
            symbol: self.symbol.parse().ok()?,
            buy_venue: self.buy_venue.parse().ok()?,
            sell_venue: self.sell_venue.parse().ok()?,
            buy_order_id: self.buy_order_id,
            sell_order_id: self.sell_order_id,
            buy_price: Decimal::from_str(&self.buy_price).ok()?,
            sell_price: self.sell_price.and_then(|s| Decimal::from_str(&s).ok()),
            quantity: Decimal::from_str(&self.quantity).ok()?,
            realized_profit: self
                .realized_profit
                .and_then(|s| Decimal::from_str(&s).ok()),
            status: ArbStatus::parse(&self.status)?,
            opened_at: parse_ts(&self.opened_at),
            closed_at: self.closed_at.map(|s| parse_ts(&s)),
        })
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_side(s: &str) -> Side {
    if s == "sell" {
        Side::Sell
    } else {
        Side::Buy
    }
}

impl LedgerRead for SqliteLedger {
    fn portfolio_value(&self) -> Result<Decimal> {
        let cash = self.balance()?;
        let held: Decimal = self.positions()?.iter().map(|p| p.notional()).sum();
        Ok(cash + held)
    }

    fn positions(&self) -> Result<Vec<Position>> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        let mut stmt = conn.prepare(
            r#"
            SELECT symbol, side, quantity, entry_price, stop_loss, take_profit, opened_at
            FROM positions
            "#,
        )?;

        let positions = stmt
            .query_map([], |row| {
                let symbol: String = row.get(0)?;
                let side: String = row.get(1)?;
                let quantity: String = row.get(2)?;
                let entry_price: String = row.get(3)?;
                let stop_loss: Option<String> = row.get(4)?;
                let take_profit: Option<String> = row.get(5)?;
                let opened_at: String = row.get(6)?;
                Ok((
                    symbol,
                    side,
                    quantity,
                    entry_price,
                    stop_loss,
                    take_profit,
                    opened_at,
                ))
            })?
            .filter_map(|r| r.ok())
            .filter_map(
                |(symbol, side, quantity, entry_price, stop_loss, take_profit, opened_at)| {
                    Some(Position {
                        symbol: symbol.parse().ok()?,
                        side: parse_side(&side),
                        quantity: Decimal::from_str(&quantity).ok()?,
                        entry_price: Decimal::from_str(&entry_price).ok()?,
                        stop_loss: stop_loss.and_then(|s| Decimal::from_str(&s).ok()),
                        take_profit: take_profit.and_then(|s| Decimal::from_str(&s).ok()),
                        opened_at: parse_ts(&opened_at),
                    })
                },
            )
            .collect();

        Ok(positions)
    }

    fn trades_since(&self, since: DateTime<Utc>) -> Result<Vec<TradeRecord>> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        let mut stmt = conn.prepare(
            r#"
            SELECT symbol, venue, side, quantity, price, executed_at
            FROM trades
            WHERE executed_at >= ?1
            ORDER BY executed_at ASC
            "#,
        )?;

        let trades = stmt
            .query_map([since.to_rfc3339()], |row| {
                let symbol: String = row.get(0)?;
                let venue: String = row.get(1)?;
                let side: String = row.get(2)?;
                let quantity: String = row.get(3)?;
                let price: String = row.get(4)?;
                let executed_at: String = row.get(5)?;
                Ok((symbol, venue, side, quantity, price, executed_at))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(symbol, venue, side, quantity, price, executed_at)| {
                Some(TradeRecord {
                    symbol: symbol.parse().ok()?,
                    venue: venue.parse().ok()?,
                    side: parse_side(&side),
                    quantity: Decimal::from_str(&quantity).ok()?,
                    price: Decimal::from_str(&price).ok()?,
                    executed_at: parse_ts(&executed_at),
                })
            })
            .collect();

        Ok(trades)
    }
}

impl LedgerWrite for SqliteLedger {
    fn record_trade(&self, trade: &TradeRecord) -> Result<()> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        conn.execute(
            r#"
            INSERT INTO trades (symbol, venue, side, quantity, price, executed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                trade.symbol.to_string(),
                trade.venue.to_string(),
                trade.side.as_str(),
                trade.quantity.to_string(),
                trade.price.to_string(),
                trade.executed_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn upsert_position(&self, position: &Position) -> Result<()> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");

        if position.quantity == Decimal::ZERO {
            conn.execute(
                "DELETE FROM positions WHERE symbol = ?1",
                params![position.symbol.to_string()],
            )?;
            return Ok(());
        }

        conn.execute(
            r#"
            INSERT INTO positions (symbol, side, quantity, entry_price, stop_loss, take_profit, opened_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(symbol) DO UPDATE SET
                side = ?2,
                quantity = ?3,
                entry_price = ?4,
                stop_loss = ?5,
                take_profit = ?6,
                opened_at = ?7
            "#,
            params![
                position.symbol.to_string(),
                position.side.as_str(),
                position.quantity.to_string(),
                position.entry_price.to_string(),
                position.stop_loss.map(|v| v.to_string()),
                position.take_profit.map(|v| v.to_string()),
                position.opened_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn record_arbitrage_trade(&self, record: &ArbitrageTrade) -> Result<()> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        conn.execute(
            r#"
            INSERT OR REPLACE INTO arbitrage_trades
                (trade_id, symbol, buy_venue, sell_venue, buy_order_id, sell_order_id,
                 buy_price, sell_price, quantity, realized_profit, status, opened_at, closed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                record.trade_id,
                record.symbol.to_string(),
                record.buy_venue.to_string(),
                record.sell_venue.to_string(),
                record.buy_order_id,
                record.sell_order_id,
                record.buy_price.to_string(),
                record.sell_price.map(|v| v.to_string()),
                record.quantity.to_string(),
                record.realized_profit.map(|v| v.to_string()),
                record.status.as_str(),
                record.opened_at.to_rfc3339(),
                record.closed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    fn update_arbitrage_trade(
        &self,
        trade_id: &str,
        status: ArbStatus,
        sell_order_id: Option<&str>,
        sell_price: Option<Decimal>,
        realized_profit: Option<Decimal>,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        conn.execute(
            r#"
            UPDATE arbitrage_trades
            SET status = ?2, sell_order_id = ?3, sell_price = ?4,
                realized_profit = ?5, closed_at = ?6
            WHERE trade_id = ?1
            "#,
            params![
                trade_id,
                status.as_str(),
                sell_order_id,
                sell_price.map(|v| v.to_string()),
                realized_profit.map(|v| v.to_string()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

impl PriceHistory for SqliteLedger {
    fn record_candle(&self, candle: &Candle) -> Result<()> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        conn.execute(
            r#"
            INSERT INTO candles (symbol, venue, open, high, low, close, volume, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                candle.symbol.to_string(),
                candle.venue.to_string(),
                candle.open.to_string(),
                candle.high.to_string(),
                candle.low.to_string(),
                candle.close.to_string(),
                candle.volume.to_string(),
                candle.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn get_closes(&self, symbol: &SymbolPair, lookback: usize) -> Result<Vec<Decimal>> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        let mut stmt = conn.prepare(
            r#"
            SELECT close FROM candles
            WHERE symbol = ?1
            ORDER BY timestamp DESC, id DESC
            LIMIT ?2
            "#,
        )?;

        let mut closes: Vec<Decimal> = stmt
            .query_map(params![symbol.to_string(), lookback], |row| {
                row.get::<_, String>(0)
            })?
            .filter_map(|r| r.ok())
            .filter_map(|s| Decimal::from_str(&s).ok())
            .collect();

        closes.reverse();
        Ok(closes)
    }
}
