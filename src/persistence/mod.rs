//! SQLite purchase ledger.
//!
//! Persists buy events so the once-per-day rule survives restarts:
//! - Open purchases (one row per symbol, rewritten wholesale on every change)
//! - Completed round trips, archived on sell
//!
//! The in-memory daily-buy map is hydrated at startup from the open
//! purchases plus the buy dates of trades archived today.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, Transaction};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// An open position: bought, not yet sold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseRecord {
    pub symbol: String,
    /// Exchange-local date of the buy
    pub date: NaiveDate,
    pub buy_price: Decimal,
    pub volume: Decimal,
}

/// A completed buy/sell round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeRecord {
    pub symbol: String,
    pub buy_date: NaiveDate,
    pub buy_price: Decimal,
    pub volume: Decimal,
    pub sell_price: Decimal,
    pub sold_at: DateTime<Utc>,
}

impl TradeRecord {
    /// Realized profit in KRW, before fees.
    pub fn profit(&self) -> Decimal {
        (self.sell_price - self.buy_price) * self.volume
    }
}

/// Durable record of buy events plus the derived daily-buy state.
pub struct PurchaseLedger {
    conn: Mutex<Connection>,
    open: Mutex<HashMap<String, PurchaseRecord>>,
    last_buy: Mutex<HashMap<String, NaiveDate>>,
}

impl PurchaseLedger {
    /// Open (or create) the ledger database and hydrate in-memory state.
    pub fn open<P: AsRef<Path>>(db_path: P, today: NaiveDate) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create ledger directory {:?}", parent))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open ledger at {:?}", path))?;
        Self::init_schema(&conn)?;

        let ledger = Self {
            conn: Mutex::new(conn),
            open: Mutex::new(HashMap::new()),
            last_buy: Mutex::new(HashMap::new()),
        };
        ledger.load(today)?;

        info!("Purchase ledger initialized at {:?}", path);
        Ok(ledger)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS purchases (
                symbol TEXT PRIMARY KEY,
                date TEXT NOT NULL,
                buy_price TEXT NOT NULL,
                volume TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS trade_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                buy_date TEXT NOT NULL,
                buy_price TEXT NOT NULL,
                volume TEXT NOT NULL,
                sell_price TEXT NOT NULL,
                sold_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_history_buy_date ON trade_history(buy_date);
            "#,
        )?;
        debug!("Ledger schema initialized");
        Ok(())
    }

    /// Reload open purchases and today's daily-buy state from disk.
    pub fn load(&self, today: NaiveDate) -> Result<()> {
        let (open, archived_today) = {
            let conn = self.conn()?;
            let open = Self::read_purchases(&conn)?;
            let archived = Self::read_history(&conn, today)?;
            (open, archived)
        };

        let mut last_buy: HashMap<String, NaiveDate> = open
            .values()
            .map(|r| (r.symbol.clone(), r.date))
            .collect();
        for trade in &archived_today {
            let entry = last_buy.entry(trade.symbol.clone()).or_insert(trade.buy_date);
            *entry = (*entry).max(trade.buy_date);
        }

        info!(
            open = open.len(),
            bought_today = last_buy.values().filter(|d| **d == today).count(),
            "Loaded purchase ledger"
        );

        *lock(&self.open)? = open;
        *lock(&self.last_buy)? = last_buy;
        Ok(())
    }

    /// Whether `symbol` has already been bought on `date`.
    pub fn bought_on(&self, symbol: &str, date: NaiveDate) -> bool {
        lock(&self.last_buy)
            .map(|m| m.get(symbol) == Some(&date))
            .unwrap_or(false)
    }

    pub fn purchase(&self, symbol: &str) -> Option<PurchaseRecord> {
        lock(&self.open).ok()?.get(symbol).cloned()
    }

    /// Open purchases sorted by symbol.
    pub fn open_purchases(&self) -> Vec<PurchaseRecord> {
        let mut records: Vec<PurchaseRecord> = lock(&self.open)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        records
    }

    /// Record a buy.
    ///
    /// The daily-buy state is updated first and stays updated even if the
    /// write fails; the error is returned for the caller to report.
    pub fn record_purchase(&self, record: PurchaseRecord) -> Result<()> {
        lock(&self.last_buy)?.insert(record.symbol.clone(), record.date);

        let snapshot = {
            let mut open = lock(&self.open)?;
            open.insert(record.symbol.clone(), record.clone());
            open.clone()
        };

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        Self::rewrite_purchases(&tx, &snapshot)?;
        tx.commit()?;

        debug!(
            symbol = %record.symbol,
            date = %record.date,
            buy_price = %record.buy_price,
            volume = %record.volume,
            "Purchase recorded"
        );
        Ok(())
    }

    /// Archive the round trip and drop the open purchase.
    ///
    /// Returns the archived record, or `None` if `symbol` had no open purchase.
    pub fn complete_sale(
        &self,
        symbol: &str,
        sell_price: Decimal,
        sold_at: DateTime<Utc>,
    ) -> Result<Option<TradeRecord>> {
        let (removed, snapshot) = {
            let mut open = lock(&self.open)?;
            let removed = open.remove(symbol);
            (removed, open.clone())
        };

        let Some(purchase) = removed else {
            warn!(%symbol, "Sale completed without an open purchase");
            return Ok(None);
        };

        let trade = TradeRecord {
            symbol: purchase.symbol,
            buy_date: purchase.date,
            buy_price: purchase.buy_price,
            volume: purchase.volume,
            sell_price,
            sold_at,
        };

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO trade_history (symbol, buy_date, buy_price, volume, sell_price, sold_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                trade.symbol,
                trade.buy_date.format(DATE_FORMAT).to_string(),
                trade.buy_price.to_string(),
                trade.volume.to_string(),
                trade.sell_price.to_string(),
                trade.sold_at.to_rfc3339(),
            ],
        )?;
        Self::rewrite_purchases(&tx, &snapshot)?;
        tx.commit()?;

        debug!(%symbol, profit = %trade.profit(), "Trade archived");
        Ok(Some(trade))
    }

    /// Archived trades whose buy happened on `date`.
    pub fn history_for(&self, date: NaiveDate) -> Result<Vec<TradeRecord>> {
        let conn = self.conn()?;
        Self::read_history(&conn, date)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        lock(&self.conn)
    }

    fn rewrite_purchases(tx: &Transaction<'_>, open: &HashMap<String, PurchaseRecord>) -> Result<()> {
        tx.execute("DELETE FROM purchases", [])?;
        for record in open.values() {
            tx.execute(
                "INSERT INTO purchases (symbol, date, buy_price, volume) VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.symbol,
                    record.date.format(DATE_FORMAT).to_string(),
                    record.buy_price.to_string(),
                    record.volume.to_string(),
                ],
            )?;
        }
        Ok(())
    }

    fn read_purchases(conn: &Connection) -> Result<HashMap<String, PurchaseRecord>> {
        let mut stmt = conn.prepare("SELECT symbol, date, buy_price, volume FROM purchases")?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut records = HashMap::new();
        for row in rows {
            let (symbol, date, price, volume) = row?;
            let record = PurchaseRecord {
                date: parse_date(&date)?,
                buy_price: parse_decimal(&price)?,
                volume: parse_decimal(&volume)?,
                symbol: symbol.clone(),
            };
            records.insert(symbol, record);
        }
        Ok(records)
    }

    fn read_history(conn: &Connection, date: NaiveDate) -> Result<Vec<TradeRecord>> {
        let mut stmt = conn.prepare(
            r#"
            SELECT symbol, buy_date, buy_price, volume, sell_price, sold_at
            FROM trade_history
            WHERE buy_date = ?1
            ORDER BY id
            "#,
        )?;

        let rows = stmt.query_map([date.format(DATE_FORMAT).to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut trades = Vec::new();
        for row in rows {
            let (symbol, buy_date, buy_price, volume, sell_price, sold_at) = row?;
            trades.push(TradeRecord {
                symbol,
                buy_date: parse_date(&buy_date)?,
                buy_price: parse_decimal(&buy_price)?,
                volume: parse_decimal(&volume)?,
                sell_price: parse_decimal(&sell_price)?,
                sold_at: DateTime::parse_from_rfc3339(&sold_at)
                    .with_context(|| format!("Invalid sold_at in ledger: {}", sold_at))?
                    .with_timezone(&Utc),
            });
        }
        Ok(trades)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| anyhow!("Ledger lock poisoned"))
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .with_context(|| format!("Invalid date in ledger: {}", s))
}

fn parse_decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).with_context(|| format!("Invalid decimal in ledger: {}", s))
}
