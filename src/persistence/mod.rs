//! SQLite persistence for the trade history.
//!
//! The trade log is append-only: rows are inserted once per exchange order
//! uuid and never updated, so lot reconstruction can always be re-derived.

use crate::exchange::TradeKind;
use crate::ledger::TradeEvent;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Append-only store of confirmed trades.
pub trait TradeStore: Send + Sync {
    /// Record a trade. Re-recording an existing id is a no-op.
    fn append(&self, event: &TradeEvent) -> Result<()>;

    /// Every recorded trade, ascending by `created_at`.
    fn load_all(&self) -> Result<Vec<TradeEvent>>;
}

/// SQLite-backed trade history.
pub struct SqliteTradeStore {
    conn: Mutex<Connection>,
}

impl SqliteTradeStore {
    /// Open the store, initializing the database if needed.
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

        info!("Trade history initialized at {:?}", db_path);
        Ok(store)
    }

    /// In-memory store (tests, paper trading).
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("trade history connection poisoned"))
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS trade_history (
                uuid TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                market TEXT NOT NULL,
                executed_volume TEXT NOT NULL,
                created_at TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                data TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trade_created ON trade_history(created_at_ms);
            CREATE INDEX IF NOT EXISTS idx_trade_market ON trade_history(market);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Number of recorded trades.
    pub fn count(&self) -> Result<usize> {
        let count: i64 =
            self.conn()?
                .query_row("SELECT COUNT(*) FROM trade_history", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl TradeStore for SqliteTradeStore {
    fn append(&self, event: &TradeEvent) -> Result<()> {
        let inserted = self.conn()?.execute(
            r#"
            INSERT OR IGNORE INTO trade_history
                (uuid, kind, market, executed_volume, created_at, created_at_ms, data, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                event.id,
                event.kind.as_str(),
                event.market,
                event.executed_volume.to_string(),
                event.created_at.to_rfc3339(),
                event.created_at.timestamp_millis(),
                event.raw_payload.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;

        if inserted == 0 {
            warn!(uuid = %event.id, "Trade already recorded, ignoring duplicate");
        } else {
            debug!(uuid = %event.id, market = %event.market, kind = %event.kind, "Trade recorded");
        }
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<TradeEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT uuid, kind, market, executed_volume, created_at, data
            FROM trade_history
            ORDER BY created_at_ms ASC, rowid ASC
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (uuid, kind, market, volume, created_at, data) = row?;
            let event = TradeEvent {
                kind: TradeKind::from_str(&kind)
                    .map_err(anyhow::Error::msg)
                    .with_context(|| format!("Corrupt trade kind for {}", uuid))?,
                executed_volume: Decimal::from_str(&volume)
                    .with_context(|| format!("Corrupt executed_volume for {}", uuid))?,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .with_context(|| format!("Corrupt created_at for {}", uuid))?,
                raw_payload: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
                id: uuid,
                market,
            };
            events.push(event);
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn trade(id: &str, kind: TradeKind, volume: Decimal, day: u32) -> TradeEvent {
        TradeEvent {
            id: id.to_string(),
            kind,
            market: "KRW-ETH".to_string(),
            executed_volume: volume,
            created_at: Utc.with_ymd_and_hms(2024, 4, day, 3, 0, 0).unwrap(),
            raw_payload: serde_json::json!({"uuid": id}),
        }
    }

    #[test]
    fn test_load_returns_chronological_order() {
        let store = SqliteTradeStore::in_memory().unwrap();
        store.append(&trade("b", TradeKind::Sell, dec!(0.5), 9)).unwrap();
        store.append(&trade("a", TradeKind::Buy, dec!(1.25), 2)).unwrap();

        let events = store.load_all().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, "a");
        assert_eq!(events[0].executed_volume, dec!(1.25));
        assert_eq!(events[1].kind, TradeKind::Sell);
        assert_eq!(events[1].raw_payload["uuid"], "b");
    }

    #[test]
    fn test_duplicate_uuid_is_ignored() {
        let store = SqliteTradeStore::in_memory().unwrap();
        let event = trade("a", TradeKind::Buy, dec!(1), 2);
        store.append(&event).unwrap();

        let mut altered = event.clone();
        altered.executed_volume = dec!(99);
        store.append(&altered).unwrap();

        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.load_all().unwrap()[0].executed_volume, dec!(1));
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("trades-{}", uuid::Uuid::new_v4()));
        let path = dir.join("history.db");

        {
            let store = SqliteTradeStore::new(&path).unwrap();
            store.append(&trade("a", TradeKind::Buy, dec!(2), 2)).unwrap();
        }

        let reopened = SqliteTradeStore::new(&path).unwrap();
        assert_eq!(reopened.load_all().unwrap().len(), 1);
        std::fs::remove_dir_all(dir).ok();
    }
}
