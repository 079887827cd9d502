//! Durable state store over a single SQLite file.
//!
//! Every table the agent persists lives here. Schema bootstrap is idempotent
//! and additive: columns are added through `add_column_if_missing`, so a
//! newer binary can open an older database. All writes go through the one
//! process holding the single-writer lock; within a cycle the authoritative
//! transaction (ledger events + accounting + cursor) commits before the
//! best-effort metrics transaction.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::domain::ids::canonical_decimal;
use crate::domain::{
    CapitalChange, CapitalState, CycleRecord, Fill, LedgerEvent, LedgerEventKind, Order,
    OrderStatus, Position, Side, Symbol,
};
use crate::error::{LirabotError, Result};

/// Outcome of an idempotency-key reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyCheck {
    /// Key was free and is now reserved
    Reserved,
    /// Key exists with the same payload hash; return the cached decision
    Duplicate,
    /// Key exists with a different payload hash
    Conflict { stored_hash: String },
}

/// SQLite storage adapter
#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

pub fn dec_to_db(value: Decimal) -> String {
    canonical_decimal(value)
}

pub fn dec_from_db(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw)
        .map_err(|e| LirabotError::Internal(format!("stored decimal '{}' invalid: {}", raw, e)))
}

pub fn ts_from_db(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| LirabotError::Internal(format!("stored timestamp {} out of range", ms)))
}

impl StateStore {
    /// Open (creating if needed) the durable store and run migrations.
    pub async fn open(state_db_path: &str) -> Result<Self> {
        let options = if state_db_path == ":memory:" {
            SqliteConnectOptions::new().filename(":memory:")
        } else {
            SqliteConnectOptions::new()
                .filename(state_db_path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
        }
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_secs(5));

        // Single writer by design; one connection keeps in-memory databases
        // coherent as well.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(path = state_db_path, "state store opened");
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    // ==================== Schema ====================

    /// Idempotent schema bootstrap.
    pub async fn migrate(&self) -> Result<()> {
        let statements = [
            r#"CREATE TABLE IF NOT EXISTS orders (
                client_order_id TEXT PRIMARY KEY,
                exchange_order_id TEXT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                price TEXT NOT NULL,
                qty TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                reconcile_attempts INTEGER NOT NULL DEFAULT 0,
                intent_hash TEXT NOT NULL DEFAULT ''
            )"#,
            r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_orders_exchange_id
               ON orders(exchange_order_id) WHERE exchange_order_id IS NOT NULL"#,
            r#"CREATE TABLE IF NOT EXISTS fills (
                fill_id TEXT PRIMARY KEY,
                order_id TEXT,
                client_order_id TEXT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                price TEXT NOT NULL,
                qty TEXT NOT NULL,
                fee_amount TEXT NOT NULL,
                fee_currency TEXT NOT NULL,
                traded_at_ms INTEGER NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS ledger_events (
                event_id TEXT PRIMARY KEY,
                ts_ms INTEGER NOT NULL,
                type TEXT NOT NULL,
                symbol TEXT,
                side TEXT,
                qty TEXT NOT NULL,
                price TEXT NOT NULL,
                fee_amount TEXT NOT NULL,
                fee_currency TEXT,
                exchange_trade_id TEXT UNIQUE,
                client_order_id TEXT,
                meta TEXT
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_ledger_events_order
               ON ledger_events(ts_ms, event_id)"#,
            r#"CREATE TABLE IF NOT EXISTS applied_fills (
                fill_id TEXT PRIMARY KEY
            )"#,
            r#"CREATE TABLE IF NOT EXISTS positions (
                symbol TEXT PRIMARY KEY,
                qty TEXT NOT NULL,
                avg_cost TEXT NOT NULL,
                realized TEXT NOT NULL,
                unrealized TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS intents (
                intent_id TEXT PRIMARY KEY,
                idempotency_key TEXT UNIQUE NOT NULL,
                cycle_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                ts_ms INTEGER NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS actions (
                action_id INTEGER PRIMARY KEY AUTOINCREMENT,
                action_type TEXT NOT NULL,
                payload_hash TEXT NOT NULL,
                time_bucket INTEGER NOT NULL,
                ts_ms INTEGER NOT NULL,
                UNIQUE(action_type, payload_hash, time_bucket)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS idempotency_keys (
                key TEXT PRIMARY KEY,
                payload_hash TEXT NOT NULL,
                ts_ms INTEGER NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS cycle_trace (
                cycle_id TEXT PRIMARY KEY,
                ts_ms INTEGER NOT NULL,
                universe TEXT NOT NULL,
                final_mode TEXT NOT NULL,
                intents TEXT NOT NULL,
                order_decisions TEXT NOT NULL,
                active_param_version INTEGER NOT NULL DEFAULT 0
            )"#,
            r#"CREATE TABLE IF NOT EXISTS cycle_ledger_metrics (
                cycle_id TEXT PRIMARY KEY REFERENCES cycle_trace(cycle_id),
                metrics TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS cycle_risk_decisions (
                cycle_id TEXT PRIMARY KEY REFERENCES cycle_trace(cycle_id),
                mode TEXT NOT NULL,
                reasons TEXT NOT NULL,
                cooldown_until_ms INTEGER,
                inputs_hash TEXT NOT NULL,
                decided_at_ms INTEGER NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS order_intents (
                client_order_id TEXT PRIMARY KEY,
                cycle_id TEXT NOT NULL,
                intent TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS order_events (
                event_id TEXT PRIMARY KEY,
                client_order_id TEXT NOT NULL,
                from_status TEXT NOT NULL,
                to_status TEXT NOT NULL,
                ts_ms INTEGER NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS capital_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                trading_capital TEXT NOT NULL,
                treasury TEXT NOT NULL,
                last_realized_pnl_total TEXT NOT NULL,
                last_event_count INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS capital_changes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts_ms INTEGER NOT NULL,
                realized_delta TEXT NOT NULL,
                trading_delta TEXT NOT NULL,
                treasury_delta TEXT NOT NULL,
                event_count INTEGER NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS cursors (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )"#,
        ];

        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }

        // Additive columns for databases created by older builds.
        self.add_column_if_missing("orders", "intent_hash", "TEXT NOT NULL DEFAULT ''")
            .await?;
        self.add_column_if_missing("orders", "reconcile_attempts", "INTEGER NOT NULL DEFAULT 0")
            .await?;

        debug!("schema migration complete");
        Ok(())
    }

    /// Add a column unless it already exists. Idempotent by construction.
    pub async fn add_column_if_missing(
        &self,
        table: &str,
        column: &str,
        definition: &str,
    ) -> Result<()> {
        let rows = sqlx::query(&format!("PRAGMA table_info({})", table))
            .fetch_all(&self.pool)
            .await?;
        let exists = rows
            .iter()
            .any(|row| row.get::<String, _>("name") == column);
        if !exists {
            sqlx::query(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                table, column, definition
            ))
            .execute(&self.pool)
            .await?;
            info!(table, column, "added missing column");
        }
        Ok(())
    }

    // ==================== Orders ====================

    pub async fn upsert_order(&self, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders
                (client_order_id, exchange_order_id, symbol, side, price, qty, status,
                 created_at_ms, updated_at_ms, reconcile_attempts, intent_hash)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT (client_order_id) DO UPDATE SET
                exchange_order_id = excluded.exchange_order_id,
                status = excluded.status,
                updated_at_ms = excluded.updated_at_ms,
                reconcile_attempts = excluded.reconcile_attempts
            "#,
        )
        .bind(&order.client_order_id)
        .bind(&order.exchange_order_id)
        .bind(order.symbol.storage_key())
        .bind(order.side.as_str())
        .bind(dec_to_db(order.price))
        .bind(dec_to_db(order.qty))
        .bind(order.status.as_str())
        .bind(order.created_at.timestamp_millis())
        .bind(order.updated_at.timestamp_millis())
        .bind(order.reconcile_attempts as i64)
        .bind(&order.intent_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn order_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Order> {
        let status: String = row.get("status");
        let side: String = row.get("side");
        Ok(Order {
            client_order_id: row.get("client_order_id"),
            exchange_order_id: row.get("exchange_order_id"),
            symbol: Symbol::from_storage_key(&row.get::<String, _>("symbol"))?,
            side: side
                .parse::<Side>()
                .map_err(|e| LirabotError::Internal(e.to_string()))?,
            price: dec_from_db(&row.get::<String, _>("price"))?,
            qty: dec_from_db(&row.get::<String, _>("qty"))?,
            status: status
                .parse::<OrderStatus>()
                .map_err(|e| LirabotError::Internal(e.to_string()))?,
            created_at: ts_from_db(row.get("created_at_ms"))?,
            updated_at: ts_from_db(row.get("updated_at_ms"))?,
            reconcile_attempts: row.get::<i64, _>("reconcile_attempts") as u32,
            intent_hash: row.get("intent_hash"),
        })
    }

    pub async fn get_order(&self, client_order_id: &str) -> Result<Option<Order>> {
        let row = sqlx::query("SELECT * FROM orders WHERE client_order_id = ?1")
            .bind(client_order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::order_from_row).transpose()
    }

    /// Orders in non-terminal states, oldest first.
    pub async fn active_orders(&self) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM orders
            WHERE status IN ('SUBMITTED', 'ACKED', 'OPEN', 'PARTIALLY_FILLED', 'UNKNOWN')
            ORDER BY created_at_ms ASC, client_order_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::order_from_row).collect()
    }

    pub async fn count_open_orders(&self, symbol: &Symbol) -> Result<usize> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM orders
            WHERE symbol = ?1
              AND status IN ('SUBMITTED', 'ACKED', 'OPEN', 'PARTIALLY_FILLED', 'UNKNOWN')
            "#,
        )
        .bind(symbol.storage_key())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") as usize)
    }

    /// Apply a status transition if legal. Illegal transitions are rejected
    /// silently: logged, counted, and the stored state left untouched.
    pub async fn transition_order(
        &self,
        client_order_id: &str,
        to: OrderStatus,
        exchange_order_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(order) = self.get_order(client_order_id).await? else {
            warn!(client_order_id, to = %to, "transition for unknown order");
            return Ok(false);
        };

        if !order.status.can_transition(to) {
            warn!(
                client_order_id,
                from = %order.status,
                to = %to,
                "illegal order state transition rejected"
            );
            self.increment_meta_counter("illegal_transitions").await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE orders
            SET status = ?2,
                exchange_order_id = COALESCE(?3, exchange_order_id),
                updated_at_ms = ?4
            WHERE client_order_id = ?1
            "#,
        )
        .bind(client_order_id)
        .bind(to.as_str())
        .bind(exchange_order_id)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        // Order-event audit row; deterministic id dedupes replays.
        let event_id = format!(
            "oe:{}:{}:{}",
            client_order_id,
            order.status.as_str(),
            to.as_str()
        );
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO order_events (event_id, client_order_id, from_status, to_status, ts_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&event_id)
        .bind(client_order_id)
        .bind(order.status.as_str())
        .bind(to.as_str())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(true)
    }

    pub async fn bump_reconcile_attempts(&self, client_order_id: &str) -> Result<u32> {
        sqlx::query(
            "UPDATE orders SET reconcile_attempts = reconcile_attempts + 1 WHERE client_order_id = ?1",
        )
        .bind(client_order_id)
        .execute(&self.pool)
        .await?;
        let row = sqlx::query("SELECT reconcile_attempts FROM orders WHERE client_order_id = ?1")
            .bind(client_order_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("reconcile_attempts") as u32)
    }

    // ==================== Fills ====================

    /// Record a fill; returns false if it was already known.
    pub async fn record_fill(&self, fill: &Fill) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO fills
                (fill_id, order_id, client_order_id, symbol, side, price, qty,
                 fee_amount, fee_currency, traded_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&fill.fill_id)
        .bind(&fill.order_id)
        .bind(&fill.client_order_id)
        .bind(fill.symbol.storage_key())
        .bind(fill.side.as_str())
        .bind(dec_to_db(fill.price))
        .bind(dec_to_db(fill.qty))
        .bind(dec_to_db(fill.fee_amount))
        .bind(&fill.fee_currency)
        .bind(fill.traded_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn is_fill_applied(&self, fill_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM applied_fills WHERE fill_id = ?1")
            .bind(fill_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    // ==================== Ledger events ====================

    /// Append an event inside the caller's transaction. Returns false when
    /// the event id was already present (idempotent re-ingest).
    pub async fn append_event_tx(
        tx: &mut Transaction<'_, Sqlite>,
        event: &LedgerEvent,
    ) -> Result<bool> {
        event
            .validate()
            .map_err(|m| LirabotError::Integrity(crate::error::IntegrityError::Schema(m)))?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO ledger_events
                (event_id, ts_ms, type, symbol, side, qty, price, fee_amount,
                 fee_currency, exchange_trade_id, client_order_id, meta)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&event.event_id)
        .bind(event.ts.timestamp_millis())
        .bind(event.kind.as_str())
        .bind(event.symbol.as_ref().map(|s| s.storage_key()))
        .bind(event.side.map(|s| s.as_str()))
        .bind(dec_to_db(event.qty))
        .bind(dec_to_db(event.price))
        .bind(dec_to_db(event.fee_amount))
        .bind(&event.fee_currency)
        .bind(&event.exchange_trade_id)
        .bind(&event.client_order_id)
        .bind(&event.meta)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    fn event_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<LedgerEvent> {
        let kind: String = row.get("type");
        let symbol: Option<String> = row.get("symbol");
        let side: Option<String> = row.get("side");
        Ok(LedgerEvent {
            event_id: row.get("event_id"),
            ts: ts_from_db(row.get("ts_ms"))?,
            kind: kind
                .parse::<LedgerEventKind>()
                .map_err(|e| LirabotError::Internal(e.to_string()))?,
            symbol: symbol
                .as_deref()
                .map(Symbol::from_storage_key)
                .transpose()?,
            side: side
                .as_deref()
                .map(|s| s.parse::<Side>())
                .transpose()
                .map_err(|e| LirabotError::Internal(e.to_string()))?,
            qty: dec_from_db(&row.get::<String, _>("qty"))?,
            price: dec_from_db(&row.get::<String, _>("price"))?,
            fee_amount: dec_from_db(&row.get::<String, _>("fee_amount"))?,
            fee_currency: row.get("fee_currency"),
            exchange_trade_id: row.get("exchange_trade_id"),
            client_order_id: row.get("client_order_id"),
            meta: row.get("meta"),
        })
    }

    /// All events in replay order.
    pub async fn all_events(&self) -> Result<Vec<LedgerEvent>> {
        let rows = sqlx::query("SELECT * FROM ledger_events ORDER BY ts_ms ASC, event_id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::event_from_row).collect()
    }

    /// Events after the first `skip` in replay order (incremental replay).
    pub async fn events_after(&self, skip: i64) -> Result<Vec<LedgerEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM ledger_events ORDER BY ts_ms ASC, event_id ASC LIMIT -1 OFFSET ?1",
        )
        .bind(skip)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::event_from_row).collect()
    }

    pub async fn count_events(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM ledger_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    // ==================== Positions snapshot ====================

    pub async fn replace_positions_tx(
        tx: &mut Transaction<'_, Sqlite>,
        positions: &[(Symbol, Position)],
    ) -> Result<()> {
        sqlx::query("DELETE FROM positions")
            .execute(&mut **tx)
            .await?;
        for (symbol, pos) in positions {
            sqlx::query(
                r#"
                INSERT INTO positions (symbol, qty, avg_cost, realized, unrealized)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(symbol.storage_key())
            .bind(dec_to_db(pos.qty))
            .bind(dec_to_db(pos.avg_cost))
            .bind(dec_to_db(pos.realized_pnl_try))
            .bind(dec_to_db(pos.unrealized_pnl_try))
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    pub async fn positions(&self) -> Result<Vec<(Symbol, Position)>> {
        let rows = sqlx::query("SELECT * FROM positions ORDER BY symbol ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok((
                    Symbol::from_storage_key(&row.get::<String, _>("symbol"))?,
                    Position {
                        qty: dec_from_db(&row.get::<String, _>("qty"))?,
                        avg_cost: dec_from_db(&row.get::<String, _>("avg_cost"))?,
                        realized_pnl_try: dec_from_db(&row.get::<String, _>("realized"))?,
                        unrealized_pnl_try: dec_from_db(&row.get::<String, _>("unrealized"))?,
                    },
                ))
            })
            .collect()
    }

    // ==================== Actions & idempotency ====================

    /// Reserve an action slot; false means an identical action already ran
    /// inside this time bucket.
    pub async fn try_reserve_action(
        &self,
        action_type: &str,
        payload_hash: &str,
        time_bucket: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO actions (action_type, payload_hash, time_bucket, ts_ms)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(action_type)
        .bind(payload_hash)
        .bind(time_bucket)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn check_or_reserve_idempotency(
        &self,
        key: &str,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<IdempotencyCheck> {
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO idempotency_keys (key, payload_hash, ts_ms) VALUES (?1, ?2, ?3)",
        )
        .bind(key)
        .bind(payload_hash)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            return Ok(IdempotencyCheck::Reserved);
        }

        let row = sqlx::query("SELECT payload_hash FROM idempotency_keys WHERE key = ?1")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        let stored: String = row.get("payload_hash");
        if stored == payload_hash {
            Ok(IdempotencyCheck::Duplicate)
        } else {
            Ok(IdempotencyCheck::Conflict {
                stored_hash: stored,
            })
        }
    }

    // ==================== Cycle persistence ====================

    /// Persist the whole cycle record in one transaction.
    pub async fn persist_cycle(&self, record: &CycleRecord) -> Result<()> {
        let mut tx = self.begin().await?;

        let universe: Vec<String> = record
            .selected_universe
            .iter()
            .map(|s| s.storage_key())
            .collect();

        sqlx::query(
            r#"
            INSERT INTO cycle_trace
                (cycle_id, ts_ms, universe, final_mode, intents, order_decisions,
                 active_param_version)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&record.cycle_id)
        .bind(record.ts.timestamp_millis())
        .bind(serde_json::to_string(&universe)?)
        .bind(record.risk_decision.mode.as_str())
        .bind(serde_json::to_string(&record.intents)?)
        .bind(serde_json::to_string(&record.order_decisions)?)
        .bind(record.active_param_version)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO cycle_risk_decisions
                (cycle_id, mode, reasons, cooldown_until_ms, inputs_hash, decided_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&record.cycle_id)
        .bind(record.risk_decision.mode.as_str())
        .bind(serde_json::to_string(&record.risk_decision.reason_codes())?)
        .bind(record.risk_decision.cooldown_until.map(|t| t.timestamp_millis()))
        .bind(&record.risk_decision.inputs_hash)
        .bind(record.risk_decision.decided_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO cycle_ledger_metrics (cycle_id, metrics) VALUES (?1, ?2)",
        )
        .bind(&record.cycle_id)
        .bind(serde_json::to_string(&record.ledger_metrics)?)
        .execute(&mut *tx)
        .await?;

        for (intent, decision) in record.intents.iter().zip(record.order_decisions.iter()) {
            if let crate::domain::OrderDecision::Accepted {
                client_order_id, ..
            } = decision
            {
                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO order_intents (client_order_id, cycle_id, intent)
                    VALUES (?1, ?2, ?3)
                    "#,
                )
                .bind(client_order_id)
                .bind(&record.cycle_id)
                .bind(serde_json::to_string(intent)?)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        debug!(cycle_id = %record.cycle_id, "cycle persisted");
        Ok(())
    }

    pub async fn record_intent(
        &self,
        intent_id: &str,
        idempotency_key: &str,
        cycle_id: &str,
        payload: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO intents (intent_id, idempotency_key, cycle_id, payload, ts_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(intent_id)
        .bind(idempotency_key)
        .bind(cycle_id)
        .bind(payload)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ==================== Capital ====================

    pub async fn capital_state(&self) -> Result<Option<CapitalState>> {
        let row = sqlx::query("SELECT * FROM capital_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(CapitalState {
                trading_capital_try: dec_from_db(&row.get::<String, _>("trading_capital"))?,
                treasury_try: dec_from_db(&row.get::<String, _>("treasury"))?,
                last_realized_pnl_total_try: dec_from_db(
                    &row.get::<String, _>("last_realized_pnl_total"),
                )?,
                last_event_count: row.get("last_event_count"),
                updated_at: ts_from_db(row.get("updated_at_ms"))?,
            })
        })
        .transpose()
    }

    /// Write the capital state and its change row atomically.
    pub async fn save_capital_checkpoint(
        &self,
        state: &CapitalState,
        change: Option<&CapitalChange>,
    ) -> Result<()> {
        let mut tx = self.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO capital_state
                (id, trading_capital, treasury, last_realized_pnl_total,
                 last_event_count, updated_at_ms)
            VALUES (1, ?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (id) DO UPDATE SET
                trading_capital = excluded.trading_capital,
                treasury = excluded.treasury,
                last_realized_pnl_total = excluded.last_realized_pnl_total,
                last_event_count = excluded.last_event_count,
                updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(dec_to_db(state.trading_capital_try))
        .bind(dec_to_db(state.treasury_try))
        .bind(dec_to_db(state.last_realized_pnl_total_try))
        .bind(state.last_event_count)
        .bind(state.updated_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        if let Some(change) = change {
            sqlx::query(
                r#"
                INSERT INTO capital_changes
                    (ts_ms, realized_delta, trading_delta, treasury_delta, event_count)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(change.ts.timestamp_millis())
            .bind(dec_to_db(change.realized_delta_try))
            .bind(dec_to_db(change.trading_delta_try))
            .bind(dec_to_db(change.treasury_delta_try))
            .bind(change.event_count)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    // ==================== Cursors & meta ====================

    pub async fn cursor(&self, name: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM cursors WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    pub async fn set_cursor(&self, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cursors (name, value) VALUES (?1, ?2)
            ON CONFLICT (name) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_cursor_tx(
        tx: &mut Transaction<'_, Sqlite>,
        name: &str,
        value: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cursors (name, value) VALUES (?1, ?2)
            ON CONFLICT (name) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(name)
        .bind(value)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn meta(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM meta WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO meta (key, value) VALUES (?1, ?2)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Increment a persistent counter stored in `meta`; returns the new
    /// value.
    pub async fn increment_meta_counter(&self, key: &str) -> Result<i64> {
        let current = self
            .meta(key)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        self.set_meta(key, &next.to_string()).await?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn store() -> StateStore {
        StateStore::open(":memory:").await.unwrap()
    }

    fn order(coid: &str, status: OrderStatus) -> Order {
        let now = Utc::now();
        Order {
            client_order_id: coid.to_string(),
            exchange_order_id: None,
            symbol: Symbol::try_base("BTC"),
            side: Side::Sell,
            price: dec!(1010000),
            qty: dec!(0.0025),
            status,
            created_at: now,
            updated_at: now,
            reconcile_attempts: 0,
            intent_hash: "h".to_string(),
        }
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let store = store().await;
        store.migrate().await.unwrap();
        store.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn order_round_trips() {
        let store = store().await;
        let o = order("coid-1", OrderStatus::Planned);
        store.upsert_order(&o).await.unwrap();

        let loaded = store.get_order("coid-1").await.unwrap().unwrap();
        assert_eq!(loaded.symbol, o.symbol);
        assert_eq!(loaded.price, o.price);
        assert_eq!(loaded.qty, o.qty);
        assert_eq!(loaded.status, OrderStatus::Planned);
    }

    #[tokio::test]
    async fn legal_transition_applies_and_audits() {
        let store = store().await;
        store
            .upsert_order(&order("coid-1", OrderStatus::Planned))
            .await
            .unwrap();

        let applied = store
            .transition_order("coid-1", OrderStatus::Submitted, None, Utc::now())
            .await
            .unwrap();
        assert!(applied);
        let loaded = store.get_order("coid-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, OrderStatus::Submitted);
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected_and_counted() {
        let store = store().await;
        store
            .upsert_order(&order("coid-1", OrderStatus::Filled))
            .await
            .unwrap();

        let applied = store
            .transition_order("coid-1", OrderStatus::Open, None, Utc::now())
            .await
            .unwrap();
        assert!(!applied);
        let loaded = store.get_order("coid-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, OrderStatus::Filled);
        assert_eq!(
            store.meta("illegal_transitions").await.unwrap().as_deref(),
            Some("1")
        );
    }

    #[tokio::test]
    async fn fill_insert_is_idempotent() {
        let store = store().await;
        let fill = Fill {
            fill_id: "t-1".into(),
            order_id: None,
            client_order_id: Some("coid".into()),
            symbol: Symbol::try_base("BTC"),
            side: Side::Buy,
            price: dec!(1000000),
            qty: dec!(0.01),
            fee_amount: dec!(18),
            fee_currency: "TRY".into(),
            traded_at: Utc::now(),
        };
        assert!(store.record_fill(&fill).await.unwrap());
        assert!(!store.record_fill(&fill).await.unwrap());
    }

    #[tokio::test]
    async fn action_dedupe_within_bucket() {
        let store = store().await;
        let now = Utc::now();
        assert!(store
            .try_reserve_action("submit", "hash-a", 100, now)
            .await
            .unwrap());
        assert!(!store
            .try_reserve_action("submit", "hash-a", 100, now)
            .await
            .unwrap());
        // Different bucket or payload is a fresh action.
        assert!(store
            .try_reserve_action("submit", "hash-a", 101, now)
            .await
            .unwrap());
        assert!(store
            .try_reserve_action("submit", "hash-b", 100, now)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn idempotency_conflict_on_different_payload() {
        let store = store().await;
        let now = Utc::now();
        assert_eq!(
            store
                .check_or_reserve_idempotency("k1", "h1", now)
                .await
                .unwrap(),
            IdempotencyCheck::Reserved
        );
        assert_eq!(
            store
                .check_or_reserve_idempotency("k1", "h1", now)
                .await
                .unwrap(),
            IdempotencyCheck::Duplicate
        );
        match store
            .check_or_reserve_idempotency("k1", "h2", now)
            .await
            .unwrap()
        {
            IdempotencyCheck::Conflict { stored_hash } => assert_eq!(stored_hash, "h1"),
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn cursors_and_meta_round_trip() {
        let store = store().await;
        assert!(store.cursor("fills_cursor:BTC/TRY").await.unwrap().is_none());
        store.set_cursor("fills_cursor:BTC/TRY", "1700000").await.unwrap();
        assert_eq!(
            store.cursor("fills_cursor:BTC/TRY").await.unwrap().as_deref(),
            Some("1700000")
        );

        assert_eq!(store.increment_meta_counter("c").await.unwrap(), 1);
        assert_eq!(store.increment_meta_counter("c").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn capital_checkpoint_round_trips() {
        let store = store().await;
        assert!(store.capital_state().await.unwrap().is_none());

        let state = CapitalState {
            trading_capital_try: dec!(10600),
            treasury_try: dec!(400),
            last_realized_pnl_total_try: dec!(1000),
            last_event_count: 7,
            updated_at: Utc::now(),
        };
        store.save_capital_checkpoint(&state, None).await.unwrap();

        let loaded = store.capital_state().await.unwrap().unwrap();
        assert_eq!(loaded.trading_capital_try, dec!(10600));
        assert_eq!(loaded.treasury_try, dec!(400));
        assert_eq!(loaded.last_event_count, 7);
    }

    #[tokio::test]
    async fn add_column_if_missing_is_idempotent() {
        let store = store().await;
        store
            .add_column_if_missing("orders", "notes", "TEXT")
            .await
            .unwrap();
        store
            .add_column_if_missing("orders", "notes", "TEXT")
            .await
            .unwrap();
    }
}
