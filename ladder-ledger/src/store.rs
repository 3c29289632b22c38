//! Durable persistence for positions and their execution logs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use rusqlite::{params, Connection};
use tracing::debug;
use uuid::Uuid;

use crate::{
    ExecutionRecord, ExecutionStatus, LedgerError, LedgerResult, Position, PositionStatus,
};

/// Storage contract for the position ledger.
///
/// `commit_fill` is the critical operation: a position-state transition and
/// its execution-log row must land in one atomic unit so a crash between
/// "exchange fill observed" and "ledger updated" can never surface a trade
/// without a matching log entry.
pub trait PositionStore: Send + Sync {
    fn create_position(&self, position: &Position) -> LedgerResult<()>;

    /// Persist position mutations that have no accompanying order (e.g.,
    /// trailing-stop activation).
    fn update_position(&self, position: &Position) -> LedgerResult<()>;

    /// Remove a position row. Only legal for a campaign whose first entry
    /// failed outright; execution rows are retained for audit.
    fn delete_position(&self, id: &Uuid) -> LedgerResult<()>;

    fn position(&self, id: &Uuid) -> LedgerResult<Option<Position>>;

    /// The open (non-closed) campaign for an (owner, market) pair, if any.
    fn position_for(&self, owner: &str, symbol: &str) -> LedgerResult<Option<Position>>;

    fn open_positions(&self) -> LedgerResult<Vec<Position>>;

    fn insert_execution(&self, record: &ExecutionRecord) -> LedgerResult<()>;

    /// Update a pending execution row. Terminal rows are immutable.
    fn update_execution(&self, record: &ExecutionRecord) -> LedgerResult<()>;

    /// Atomically persist a position transition together with its
    /// execution-log row.
    fn commit_fill(&self, position: &Position, record: &ExecutionRecord) -> LedgerResult<()>;

    fn executions_for(&self, position_id: &Uuid) -> LedgerResult<Vec<ExecutionRecord>>;
}

fn status_str(status: PositionStatus) -> &'static str {
    match status {
        PositionStatus::Pending => "pending",
        PositionStatus::Entering => "entering",
        PositionStatus::Active => "active",
        PositionStatus::Exiting => "exiting",
        PositionStatus::Closed => "closed",
    }
}

fn exec_status_str(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Pending => "pending",
        ExecutionStatus::Partial => "partial",
        ExecutionStatus::Filled => "filled",
        ExecutionStatus::Cancelled => "cancelled",
        ExecutionStatus::Failed => "failed",
        ExecutionStatus::Timeout => "timeout",
    }
}

/// SQLite-backed implementation of the position ledger.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the ledger database at `path`.
    pub fn new(path: &Path) -> LedgerResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory ledger, used by tests and the paper demo.
    pub fn new_in_memory() -> LedgerResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> LedgerResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                symbol TEXT NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_positions_owner_symbol
                ON positions(owner, symbol);
            CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status);

            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                position_id TEXT NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_executions_position
                ON executions(position_id);
            "#,
        )?;
        Ok(())
    }

    fn decode_position(payload: &str) -> LedgerResult<Position> {
        Ok(serde_json::from_str(payload)?)
    }
}

impl PositionStore for SqliteStore {
    fn create_position(&self, position: &Position) -> LedgerResult<()> {
        let payload = serde_json::to_string(position)?;
        let conn = self.conn.lock().expect("ledger connection poisoned");
        conn.execute(
            "INSERT INTO positions (id, owner, symbol, status, payload, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                position.id.to_string(),
                position.owner,
                position.symbol,
                status_str(position.status),
                payload,
                position.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn update_position(&self, position: &Position) -> LedgerResult<()> {
        let payload = serde_json::to_string(position)?;
        let conn = self.conn.lock().expect("ledger connection poisoned");
        let changed = conn.execute(
            "UPDATE positions SET status = ?2, payload = ?3, updated_at = ?4 WHERE id = ?1",
            params![
                position.id.to_string(),
                status_str(position.status),
                payload,
                position.updated_at.to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(LedgerError::NotFound(position.id));
        }
        Ok(())
    }

    fn delete_position(&self, id: &Uuid) -> LedgerResult<()> {
        let conn = self.conn.lock().expect("ledger connection poisoned");
        conn.execute(
            "DELETE FROM positions WHERE id = ?1",
            params![id.to_string()],
        )?;
        debug!(position_id = %id, "discarded position after failed first entry");
        Ok(())
    }

    fn position(&self, id: &Uuid) -> LedgerResult<Option<Position>> {
        let conn = self.conn.lock().expect("ledger connection poisoned");
        let mut stmt = conn.prepare("SELECT payload FROM positions WHERE id = ?1")?;
        let mut rows = stmt.query(params![id.to_string()])?;
        match rows.next()? {
            Some(row) => {
                let payload: String = row.get(0)?;
                Ok(Some(Self::decode_position(&payload)?))
            }
            None => Ok(None),
        }
    }

    fn position_for(&self, owner: &str, symbol: &str) -> LedgerResult<Option<Position>> {
        let conn = self.conn.lock().expect("ledger connection poisoned");
        let mut stmt = conn.prepare(
            "SELECT payload FROM positions
             WHERE owner = ?1 AND symbol = ?2 AND status != 'closed'
             ORDER BY updated_at DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![owner, symbol])?;
        match rows.next()? {
            Some(row) => {
                let payload: String = row.get(0)?;
                Ok(Some(Self::decode_position(&payload)?))
            }
            None => Ok(None),
        }
    }

    fn open_positions(&self) -> LedgerResult<Vec<Position>> {
        let conn = self.conn.lock().expect("ledger connection poisoned");
        let mut stmt =
            conn.prepare("SELECT payload FROM positions WHERE status != 'closed'")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut positions = Vec::new();
        for payload in rows {
            positions.push(Self::decode_position(&payload?)?);
        }
        Ok(positions)
    }

    fn insert_execution(&self, record: &ExecutionRecord) -> LedgerResult<()> {
        let payload = serde_json::to_string(record)?;
        let conn = self.conn.lock().expect("ledger connection poisoned");
        conn.execute(
            "INSERT INTO executions (id, position_id, status, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id.to_string(),
                record.position_id.to_string(),
                exec_status_str(record.status),
                payload,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn update_execution(&self, record: &ExecutionRecord) -> LedgerResult<()> {
        let payload = serde_json::to_string(record)?;
        let conn = self.conn.lock().expect("ledger connection poisoned");
        let stored: Option<String> = conn
            .query_row(
                "SELECT status FROM executions WHERE id = ?1",
                params![record.id.to_string()],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        match stored.as_deref() {
            None => return Err(LedgerError::NotFound(record.id)),
            Some("pending") => {}
            Some(_) => return Err(LedgerError::RecordFinalized),
        }
        conn.execute(
            "UPDATE executions SET status = ?2, payload = ?3 WHERE id = ?1",
            params![
                record.id.to_string(),
                exec_status_str(record.status),
                payload,
            ],
        )?;
        Ok(())
    }

    fn commit_fill(&self, position: &Position, record: &ExecutionRecord) -> LedgerResult<()> {
        let position_payload = serde_json::to_string(position)?;
        let record_payload = serde_json::to_string(record)?;
        let mut conn = self.conn.lock().expect("ledger connection poisoned");
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE positions SET status = ?2, payload = ?3, updated_at = ?4 WHERE id = ?1",
            params![
                position.id.to_string(),
                status_str(position.status),
                position_payload,
                position.updated_at.to_rfc3339(),
            ],
        )?;
        tx.execute(
            "INSERT INTO executions (id, position_id, status, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 payload = excluded.payload",
            params![
                record.id.to_string(),
                record.position_id.to_string(),
                exec_status_str(record.status),
                record_payload,
                record.created_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn executions_for(&self, position_id: &Uuid) -> LedgerResult<Vec<ExecutionRecord>> {
        let conn = self.conn.lock().expect("ledger connection poisoned");
        let mut stmt = conn.prepare(
            "SELECT payload FROM executions WHERE position_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![position_id.to_string()], |row| {
            row.get::<_, String>(0)
        })?;
        let mut records = Vec::new();
        for payload in rows {
            records.push(serde_json::from_str(&payload?)?);
        }
        Ok(records)
    }
}

/// Read-through cache over a durable store.
///
/// Writes always reach the durable store first; the map is refreshed
/// afterwards, so on any conflict the durable truth wins.
pub struct CachedStore {
    inner: Arc<dyn PositionStore>,
    by_id: RwLock<HashMap<Uuid, Position>>,
    by_key: RwLock<HashMap<(String, String), Uuid>>,
}

impl CachedStore {
    #[must_use]
    pub fn new(inner: Arc<dyn PositionStore>) -> Self {
        Self {
            inner,
            by_id: RwLock::new(HashMap::new()),
            by_key: RwLock::new(HashMap::new()),
        }
    }

    fn remember(&self, position: &Position) {
        let mut by_id = self.by_id.write().expect("position cache poisoned");
        by_id.insert(position.id, position.clone());
        drop(by_id);
        let mut by_key = self.by_key.write().expect("position cache poisoned");
        let key = (position.owner.clone(), position.symbol.clone());
        if position.is_closed() {
            by_key.remove(&key);
        } else {
            by_key.insert(key, position.id);
        }
    }

    fn evict(&self, id: &Uuid) {
        let mut by_id = self.by_id.write().expect("position cache poisoned");
        if let Some(position) = by_id.remove(id) {
            let mut by_key = self.by_key.write().expect("position cache poisoned");
            by_key.remove(&(position.owner, position.symbol));
        }
    }
}

impl PositionStore for CachedStore {
    fn create_position(&self, position: &Position) -> LedgerResult<()> {
        self.inner.create_position(position)?;
        self.remember(position);
        Ok(())
    }

    fn update_position(&self, position: &Position) -> LedgerResult<()> {
        self.inner.update_position(position)?;
        self.remember(position);
        Ok(())
    }

    fn delete_position(&self, id: &Uuid) -> LedgerResult<()> {
        self.inner.delete_position(id)?;
        self.evict(id);
        Ok(())
    }

    fn position(&self, id: &Uuid) -> LedgerResult<Option<Position>> {
        {
            let by_id = self.by_id.read().expect("position cache poisoned");
            if let Some(position) = by_id.get(id) {
                return Ok(Some(position.clone()));
            }
        }
        let fetched = self.inner.position(id)?;
        if let Some(ref position) = fetched {
            self.remember(position);
        }
        Ok(fetched)
    }

    fn position_for(&self, owner: &str, symbol: &str) -> LedgerResult<Option<Position>> {
        let cached_id = {
            let by_key = self.by_key.read().expect("position cache poisoned");
            by_key.get(&(owner.to_string(), symbol.to_string())).copied()
        };
        if let Some(id) = cached_id {
            if let Some(position) = self.position(&id)? {
                if !position.is_closed() {
                    return Ok(Some(position));
                }
            }
        }
        let fetched = self.inner.position_for(owner, symbol)?;
        if let Some(ref position) = fetched {
            self.remember(position);
        }
        Ok(fetched)
    }

    fn open_positions(&self) -> LedgerResult<Vec<Position>> {
        let positions = self.inner.open_positions()?;
        for position in &positions {
            self.remember(position);
        }
        Ok(positions)
    }

    fn insert_execution(&self, record: &ExecutionRecord) -> LedgerResult<()> {
        self.inner.insert_execution(record)
    }

    fn update_execution(&self, record: &ExecutionRecord) -> LedgerResult<()> {
        self.inner.update_execution(record)
    }

    fn commit_fill(&self, position: &Position, record: &ExecutionRecord) -> LedgerResult<()> {
        self.inner.commit_fill(position, record)?;
        self.remember(position);
        Ok(())
    }

    fn executions_for(&self, position_id: &Uuid) -> LedgerResult<Vec<ExecutionRecord>> {
        self.inner.executions_for(position_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExitOutcome;
    use chrono::Utc;
    use ladder_core::{ExitReason, MarketSnapshot, OrderPurpose, Side};
    use rust_decimal::Decimal;

    fn snapshot() -> MarketSnapshot {
        MarketSnapshot {
            symbol: "BTCUSDT".to_string(),
            price: Decimal::from(100),
            bid: Decimal::from(99),
            ask: Decimal::from(101),
            spread: Decimal::from(2),
            volume: Decimal::from(10),
            atr: Decimal::from(2),
            timestamp: Utc::now(),
        }
    }

    fn sample_position() -> Position {
        let mut position = Position::new("alice", "BTCUSDT", Decimal::from(2));
        position
            .apply_entry(
                Decimal::from(100),
                Decimal::from(10),
                Decimal::ZERO,
                Decimal::ZERO,
                Utc::now(),
            )
            .unwrap();
        position
    }

    #[test]
    fn sqlite_roundtrips_positions() {
        let store = SqliteStore::new_in_memory().unwrap();
        let position = sample_position();
        store.create_position(&position).unwrap();

        let loaded = store.position(&position.id).unwrap().unwrap();
        assert_eq!(loaded.owner, "alice");
        assert_eq!(loaded.total_quantity, Decimal::from(10));

        let open = store.open_positions().unwrap();
        assert_eq!(open.len(), 1);

        let found = store.position_for("alice", "BTCUSDT").unwrap();
        assert!(found.is_some());
        assert!(store.position_for("bob", "BTCUSDT").unwrap().is_none());
    }

    #[test]
    fn commit_fill_is_atomic_and_appends_log() {
        let store = SqliteStore::new_in_memory().unwrap();
        let mut position = sample_position();
        store.create_position(&position).unwrap();

        let mut record = ExecutionRecord::pending(
            position.id,
            Side::Sell,
            OrderPurpose::PartialExit,
            Decimal::from(103),
            Decimal::from(5),
            &snapshot(),
            0,
        );
        store.insert_execution(&record).unwrap();

        let outcome = position
            .apply_exit(
                Decimal::from(103),
                Decimal::from(5),
                Decimal::ZERO,
                Decimal::ZERO,
                ExitReason::TakeProfit,
                Utc::now(),
            )
            .unwrap();
        assert_eq!(outcome, ExitOutcome::Reduced);
        record.record_fill(
            Decimal::from(103),
            Decimal::from(5),
            Decimal::ZERO,
            50,
            ExecutionStatus::Filled,
        );
        store.commit_fill(&position, &record).unwrap();

        let loaded = store.position(&position.id).unwrap().unwrap();
        assert_eq!(loaded.total_quantity, Decimal::from(5));
        let log = store.executions_for(&position.id).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, ExecutionStatus::Filled);
    }

    #[test]
    fn terminal_execution_rows_are_immutable() {
        let store = SqliteStore::new_in_memory().unwrap();
        let position = sample_position();
        store.create_position(&position).unwrap();

        let mut record = ExecutionRecord::pending(
            position.id,
            Side::Buy,
            OrderPurpose::NewEntry,
            Decimal::from(101),
            Decimal::from(1),
            &snapshot(),
            0,
        );
        store.insert_execution(&record).unwrap();
        record.finalize(ExecutionStatus::Cancelled, Some("cancelled".into()));
        store.update_execution(&record).unwrap();

        record.finalize(ExecutionStatus::Filled, None);
        let err = store.update_execution(&record).unwrap_err();
        assert!(matches!(err, LedgerError::RecordFinalized));
    }

    #[test]
    fn cache_falls_back_to_durable_store() {
        let sqlite = Arc::new(SqliteStore::new_in_memory().unwrap());
        let position = sample_position();
        // Written behind the cache's back: only durable storage knows it.
        sqlite.create_position(&position).unwrap();

        let cached = CachedStore::new(sqlite.clone());
        let loaded = cached.position(&position.id).unwrap().unwrap();
        assert_eq!(loaded.id, position.id);

        // Second read is served from the map; mutate durable to prove it.
        let found = cached.position_for("alice", "BTCUSDT").unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn reopening_the_database_preserves_the_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let position = sample_position();
        {
            let store = SqliteStore::new(&path).unwrap();
            store.create_position(&position).unwrap();
        }
        let reopened = SqliteStore::new(&path).unwrap();
        let loaded = reopened.position(&position.id).unwrap().unwrap();
        assert_eq!(loaded.avg_entry_price, position.avg_entry_price);
        assert_eq!(reopened.open_positions().unwrap().len(), 1);
    }

    #[test]
    fn deleting_a_position_keeps_execution_rows() {
        let store = SqliteStore::new_in_memory().unwrap();
        let position = sample_position();
        store.create_position(&position).unwrap();
        let record = ExecutionRecord::pending(
            position.id,
            Side::Buy,
            OrderPurpose::NewEntry,
            Decimal::from(101),
            Decimal::from(1),
            &snapshot(),
            0,
        );
        store.insert_execution(&record).unwrap();

        store.delete_position(&position.id).unwrap();
        assert!(store.position(&position.id).unwrap().is_none());
        assert_eq!(store.executions_for(&position.id).unwrap().len(), 1);
    }
}
