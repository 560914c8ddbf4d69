// State Manager for the grid engine
// SQLite-based persistence of the ledger and the append-only trade log
//
// A tick's ledger update and its trade records are written in a single
// transaction: either both are durable or neither is.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info};

use crate::ledger::Ledger;
use crate::{Side, TradeRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt stored value in {column}: {reason}")]
    Corrupt { column: &'static str, reason: String },

    #[error("state store lock poisoned")]
    Poisoned,

    #[error("{0}")]
    Unavailable(String),
}

/// Durable ledger state and trade log
pub trait StateStore: Send {
    fn load(&self, ledger_id: &str) -> Result<Option<Ledger>, StoreError>;

    fn save(&self, ledger_id: &str, ledger: &Ledger) -> Result<(), StoreError>;

    fn append_trade(&self, ledger_id: &str, trade: &TradeRecord) -> Result<(), StoreError>;

    /// Most recent first
    fn recent_trades(&self, ledger_id: &str, limit: usize) -> Result<Vec<TradeRecord>, StoreError>;

    /// Save the ledger and append `trades` atomically
    fn commit(&self, ledger_id: &str, ledger: &Ledger, trades: &[TradeRecord]) -> Result<(), StoreError>;
}

fn parse_decimal(column: &'static str, raw: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(raw).map_err(|e| StoreError::Corrupt {
        column,
        reason: format!("'{}': {}", raw, e),
    })
}

// =============================================================================
// SQLite
// =============================================================================

pub struct SqliteStateManager {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateManager {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        // WAL keeps readers (status command) off the writer's back
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let manager = Self::from_connection(conn)?;
        info!(path = %db_path.display(), "SQLite state manager initialized");
        Ok(manager)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let manager = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        manager.create_tables()?;
        Ok(manager)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn create_tables(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS ledger (
                id TEXT PRIMARY KEY,
                cash TEXT NOT NULL,
                position TEXT NOT NULL,
                initial_capital TEXT NOT NULL,
                leverage TEXT NOT NULL,
                cost_basis TEXT NOT NULL DEFAULT '0',
                margin_locked TEXT NOT NULL DEFAULT '0',
                halted INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ledger_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                side TEXT NOT NULL,
                price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                cash_after TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_ledger ON trades(ledger_id, id)",
            [],
        )?;

        debug!("Database schema created/verified");
        Ok(())
    }

    fn write_ledger(conn: &Connection, ledger_id: &str, ledger: &Ledger) -> Result<(), StoreError> {
        conn.execute(
            "INSERT OR REPLACE INTO ledger
             (id, cash, position, initial_capital, leverage, cost_basis,
              margin_locked, halted, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, CURRENT_TIMESTAMP)",
            params![
                ledger_id,
                ledger.cash().to_string(),
                ledger.position().to_string(),
                ledger.initial_capital().to_string(),
                ledger.leverage().to_string(),
                ledger.cost_basis().to_string(),
                ledger.margin_locked().to_string(),
                ledger.is_halted(),
            ],
        )?;
        Ok(())
    }

    fn write_trade(conn: &Connection, ledger_id: &str, trade: &TradeRecord) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO trades (ledger_id, timestamp, side, price, quantity, cash_after)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                ledger_id,
                trade.timestamp.to_rfc3339(),
                trade.side.as_str(),
                trade.price.to_string(),
                trade.quantity.to_string(),
                trade.cash_after.to_string(),
            ],
        )?;
        Ok(())
    }
}

/// Raw trade columns as stored
type TradeRow = (String, String, String, String, String);

fn trade_from_row(row: TradeRow) -> Result<TradeRecord, StoreError> {
    let (timestamp, side, price, quantity, cash_after) = row;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| StoreError::Corrupt {
            column: "timestamp",
            reason: e.to_string(),
        })?
        .with_timezone(&Utc);
    let side = Side::from_str(&side).map_err(|reason| StoreError::Corrupt {
        column: "side",
        reason,
    })?;

    Ok(TradeRecord::new(
        timestamp,
        side,
        parse_decimal("price", &price)?,
        parse_decimal("quantity", &quantity)?,
        parse_decimal("cash_after", &cash_after)?,
    ))
}

impl StateStore for SqliteStateManager {
    fn load(&self, ledger_id: &str) -> Result<Option<Ledger>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT cash, position, initial_capital, leverage, cost_basis, margin_locked, halted
                 FROM ledger WHERE id = ?1",
                params![ledger_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, bool>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((cash, position, initial, leverage, basis, margin, halted)) = row else {
            debug!(ledger_id, "No stored ledger found");
            return Ok(None);
        };

        let ledger = Ledger::restore(
            parse_decimal("cash", &cash)?,
            parse_decimal("position", &position)?,
            parse_decimal("initial_capital", &initial)?,
            parse_decimal("leverage", &leverage)?,
            parse_decimal("cost_basis", &basis)?,
            parse_decimal("margin_locked", &margin)?,
            halted,
        )
        .map_err(|e| StoreError::Corrupt {
            column: "ledger",
            reason: e.to_string(),
        })?;

        info!(
            ledger_id,
            cash = %ledger.cash(),
            position = %ledger.position(),
            halted = ledger.is_halted(),
            "Loaded ledger"
        );
        Ok(Some(ledger))
    }

    fn save(&self, ledger_id: &str, ledger: &Ledger) -> Result<(), StoreError> {
        let conn = self.lock()?;
        Self::write_ledger(&conn, ledger_id, ledger)?;
        debug!(ledger_id, cash = %ledger.cash(), "Ledger saved");
        Ok(())
    }

    fn append_trade(&self, ledger_id: &str, trade: &TradeRecord) -> Result<(), StoreError> {
        let conn = self.lock()?;
        Self::write_trade(&conn, ledger_id, trade)
    }

    fn recent_trades(&self, ledger_id: &str, limit: usize) -> Result<Vec<TradeRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, side, price, quantity, cash_after
             FROM trades WHERE ledger_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![ledger_id, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?
            .collect::<Result<Vec<TradeRow>, _>>()?;

        rows.into_iter().map(trade_from_row).collect()
    }

    fn commit(&self, ledger_id: &str, ledger: &Ledger, trades: &[TradeRecord]) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        Self::write_ledger(&tx, ledger_id, ledger)?;
        for trade in trades {
            Self::write_trade(&tx, ledger_id, trade)?;
        }
        tx.commit()?;

        debug!(ledger_id, trades = trades.len(), "Tick committed");
        Ok(())
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Debug, Default)]
struct MemoryInner {
    ledgers: HashMap<String, Ledger>,
    trades: Vec<(String, TradeRecord)>,
}

/// Non-durable store; clones share the same contents
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Total trades recorded across all ledgers
    pub fn trade_count(&self) -> usize {
        self.lock().map(|inner| inner.trades.len()).unwrap_or(0)
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, ledger_id: &str) -> Result<Option<Ledger>, StoreError> {
        Ok(self.lock()?.ledgers.get(ledger_id).cloned())
    }

    fn save(&self, ledger_id: &str, ledger: &Ledger) -> Result<(), StoreError> {
        self.lock()?
            .ledgers
            .insert(ledger_id.to_string(), ledger.clone());
        Ok(())
    }

    fn append_trade(&self, ledger_id: &str, trade: &TradeRecord) -> Result<(), StoreError> {
        self.lock()?
            .trades
            .push((ledger_id.to_string(), trade.clone()));
        Ok(())
    }

    fn recent_trades(&self, ledger_id: &str, limit: usize) -> Result<Vec<TradeRecord>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .trades
            .iter()
            .rev()
            .filter(|(id, _)| id == ledger_id)
            .take(limit)
            .map(|(_, trade)| trade.clone())
            .collect())
    }

    fn commit(&self, ledger_id: &str, ledger: &Ledger, trades: &[TradeRecord]) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.ledgers.insert(ledger_id.to_string(), ledger.clone());
        inner
            .trades
            .extend(trades.iter().map(|t| (ledger_id.to_string(), t.clone())));
        Ok(())
    }
}
