// =============================================================================
// Store — durable SQLite persistence for every engine state transition
// =============================================================================
//
// The store is the source of truth; the event bus is advisory. Every state
// transition is a single transaction, and ordering is enforced by call
// sequence: a Decision row commits before its Order rows, and an Order status
// update commits before the callback that depends on it runs.
//
// `orders.client_order_id` carries a UNIQUE constraint as the last line of
// defense against duplicate placement; the violation surfaces as
// [`InsertOutcome::Duplicate`] and callers treat it as idempotent success.
//
// WAL mode for concurrent reads during writes; a single connection behind a
// parking_lot mutex keeps writer ordering trivial.
// =============================================================================

pub mod models;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::types::{
    Instrument, OrderSide, OrderStatus, OrderTag, OrderType, PositionStatus, Side, TradingMode,
};
use models::{
    AuditRecord, DecisionRecord, DecisionStatus, OrderRecord, PositionRecord, RiskEventRecord,
    SignalRecord, TradeRecord,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS instruments (
    symbol       TEXT PRIMARY KEY,
    token        INTEGER NOT NULL,
    tick_size    REAL NOT NULL,
    lot_size     INTEGER NOT NULL,
    freeze_qty   INTEGER NOT NULL,
    lower_band   REAL NOT NULL,
    upper_band   REAL NOT NULL,
    refreshed_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS signals (
    id         TEXT PRIMARY KEY,
    ts         INTEGER NOT NULL,
    symbol     TEXT NOT NULL,
    side       TEXT NOT NULL CHECK (side IN ('LONG','SHORT')),
    strategy   TEXT NOT NULL,
    score      REAL NOT NULL,
    features   TEXT NOT NULL,
    config_sha TEXT NOT NULL,
    rationale  TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS decisions (
    id             TEXT PRIMARY KEY,
    signal_id      TEXT NOT NULL,
    client_plan_id TEXT NOT NULL,
    mode           TEXT NOT NULL CHECK (mode IN ('PAPER','LIVE')),
    approved       INTEGER NOT NULL,
    risk_pct       REAL NOT NULL,
    risk_amount    REAL NOT NULL,
    qty            INTEGER NOT NULL,
    heat_before    REAL NOT NULL,
    heat_after     REAL NOT NULL,
    status         TEXT NOT NULL CHECK (status IN ('PLANNED','SKIPPED','EXECUTED','REJECTED')),
    config_sha     TEXT NOT NULL,
    ts             INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_decisions_plan ON decisions(client_plan_id, ts DESC);

CREATE TABLE IF NOT EXISTS orders (
    id              TEXT PRIMARY KEY,
    decision_id     TEXT,
    client_order_id TEXT NOT NULL UNIQUE,
    tag             TEXT NOT NULL CHECK (tag IN ('ENTRY','STOP','TP','EXIT')),
    parent_group    TEXT NOT NULL,
    symbol          TEXT NOT NULL,
    side            TEXT NOT NULL CHECK (side IN ('BUY','SELL')),
    qty             INTEGER NOT NULL,
    filled_qty      INTEGER NOT NULL DEFAULT 0,
    price           REAL,
    avg_fill_price  REAL,
    order_type      TEXT NOT NULL CHECK (order_type IN ('MARKET','LIMIT','SL','SL-M')),
    status          TEXT NOT NULL CHECK (status IN ('NEW','PLACED','PARTIAL','FILLED','CANCELED','REJECTED')),
    broker_id       TEXT,
    ts_created      INTEGER NOT NULL,
    ts_acked        INTEGER,
    ts_filled       INTEGER
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_orders_group  ON orders(parent_group);
CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);

CREATE TABLE IF NOT EXISTS positions (
    id            TEXT PRIMARY KEY,
    symbol        TEXT NOT NULL,
    side          TEXT NOT NULL CHECK (side IN ('LONG','SHORT')),
    qty           INTEGER NOT NULL,
    avg_entry     REAL NOT NULL,
    oco_group     TEXT NOT NULL,
    stop_order_id TEXT,
    tp_order_id   TEXT,
    status        TEXT NOT NULL CHECK (status IN ('OPENING','OPEN','CLOSING','CLOSED')),
    ts_opened     INTEGER NOT NULL,
    ts_closed     INTEGER
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status);
CREATE INDEX IF NOT EXISTS idx_positions_group  ON positions(oco_group);

CREATE TABLE IF NOT EXISTS trades (
    id           TEXT PRIMARY KEY,
    position_id  TEXT NOT NULL,
    qty          INTEGER NOT NULL,
    entry_price  REAL NOT NULL,
    exit_price   REAL NOT NULL,
    exit_reason  TEXT NOT NULL,
    gross_pnl    REAL NOT NULL,
    net_pnl      REAL NOT NULL,
    slippage_bps REAL NOT NULL,
    latency_ms   INTEGER NOT NULL,
    ts           INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_trades_ts ON trades(ts DESC);

CREATE TABLE IF NOT EXISTS risk_events (
    id          TEXT PRIMARY KEY,
    ts          INTEGER NOT NULL,
    event_type  TEXT NOT NULL CHECK (event_type IN (
        'FREEZE_BAND','SPREAD_BLOWOUT','HEAT_CAP','DAILY_LOSS_STOP','FREEZE_QTY','PRICE_BAND',
        'MARKET_CLOSED','TRADING_PAUSED','TRADE_RISK_CAP','ZERO_QTY',
        'SCAN_SUPERVISOR','THROTTLE_PRESSURE','OCO_CANCEL_FAILED','AUTH_FAILURE','ORDER_REJECTED')),
    decision_id TEXT,
    details     TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_risk_events_ts ON risk_events(ts DESC);

CREATE TABLE IF NOT EXISTS audit_logs (
    id         TEXT PRIMARY KEY,
    ts         INTEGER NOT NULL,
    action     TEXT NOT NULL CHECK (action IN (
        'ENGINE_START','ENGINE_STOP','MODE_CHANGE','PAUSE','RESUME','FLATTEN','KILL_SWITCH',
        'DECISION_REJECTED','RECOVERY','LEADER_ACQUIRED','LEADER_LOST','SUPERVISOR_RESTART')),
    session_id TEXT NOT NULL,
    actor      TEXT NOT NULL,
    details    TEXT NOT NULL,
    config_sha TEXT NOT NULL,
    git_head   TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_audit_ts ON audit_logs(ts DESC);
"#;

/// Outcome of an order insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The UNIQUE constraint on `client_order_id` fired — callers treat this
    /// as idempotent success.
    Duplicate,
}

/// Durable persistence layer. Cheap to share via `Arc`.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite db at {}", path.display()))?;
        conn.execute_batch(SCHEMA_SQL).context("failed to apply schema")?;
        info!(path = %path.display(), "store opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory db")?;
        conn.execute_batch(SCHEMA_SQL).context("failed to apply schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    // -------------------------------------------------------------------------
    // Instruments
    // -------------------------------------------------------------------------

    /// Replace the session instrument snapshot (pre-open refresh).
    pub fn upsert_instruments(&self, instruments: &[Instrument], now: i64) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for inst in instruments {
            tx.execute(
                "INSERT INTO instruments
                     (symbol, token, tick_size, lot_size, freeze_qty, lower_band, upper_band, refreshed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(symbol) DO UPDATE SET
                     token = excluded.token,
                     tick_size = excluded.tick_size,
                     lot_size = excluded.lot_size,
                     freeze_qty = excluded.freeze_qty,
                     lower_band = excluded.lower_band,
                     upper_band = excluded.upper_band,
                     refreshed_at = excluded.refreshed_at",
                params![
                    inst.symbol,
                    inst.token,
                    inst.tick_size,
                    inst.lot_size,
                    inst.freeze_qty,
                    inst.lower_band,
                    inst.upper_band,
                    now
                ],
            )?;
        }
        tx.commit()?;
        debug!(count = instruments.len(), "instrument snapshot refreshed");
        Ok(())
    }

    pub fn instruments(&self) -> Result<Vec<Instrument>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, token, tick_size, lot_size, freeze_qty, lower_band, upper_band
             FROM instruments ORDER BY symbol",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(Instrument {
                symbol: r.get(0)?,
                token: r.get(1)?,
                tick_size: r.get(2)?,
                lot_size: r.get(3)?,
                freeze_qty: r.get(4)?,
                lower_band: r.get(5)?,
                upper_band: r.get(6)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    // -------------------------------------------------------------------------
    // Signals
    // -------------------------------------------------------------------------

    pub fn insert_signal(&self, signal: &SignalRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO signals (id, ts, symbol, side, strategy, score, features, config_sha, rationale)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                signal.id,
                signal.ts,
                signal.symbol,
                signal.side.as_str(),
                signal.strategy,
                signal.score,
                serde_json::to_string(&signal.features)?,
                signal.config_sha,
                signal.rationale
            ],
        )?;
        Ok(())
    }

    /// Feature snapshot of a persisted signal (plan reconstruction during
    /// OCO recovery reads stop/tp prices from here).
    pub fn signal_features(&self, id: &str) -> Result<Option<BTreeMap<String, f64>>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row("SELECT features FROM signals WHERE id = ?1", params![id], |r| r.get(0))
            .optional()?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    // -------------------------------------------------------------------------
    // Decisions
    // -------------------------------------------------------------------------

    pub fn insert_decision(&self, d: &DecisionRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO decisions
                 (id, signal_id, client_plan_id, mode, approved, risk_pct, risk_amount, qty,
                  heat_before, heat_after, status, config_sha, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                d.id,
                d.signal_id,
                d.client_plan_id,
                d.mode.to_string(),
                d.approved as i64,
                d.risk_pct,
                d.risk_amount,
                d.qty,
                d.portfolio_heat_before,
                d.portfolio_heat_after,
                d.status.as_str(),
                d.config_sha,
                d.ts
            ],
        )?;
        Ok(())
    }

    /// Most recent decision for a plan fingerprint (duplicate-plan detection).
    pub fn decision_by_plan(&self, client_plan_id: &str) -> Result<Option<DecisionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, signal_id, client_plan_id, mode, approved, risk_pct, risk_amount, qty,
                    heat_before, heat_after, status, config_sha, ts
             FROM decisions WHERE client_plan_id = ?1 ORDER BY ts DESC LIMIT 1",
        )?;
        let row = stmt
            .query_row(params![client_plan_id], row_to_decision)
            .optional()?;
        Ok(row)
    }

    pub fn decision_by_id(&self, id: &str) -> Result<Option<DecisionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, signal_id, client_plan_id, mode, approved, risk_pct, risk_amount, qty,
                    heat_before, heat_after, status, config_sha, ts
             FROM decisions WHERE id = ?1",
        )?;
        Ok(stmt.query_row(params![id], row_to_decision).optional()?)
    }

    pub fn update_decision_status(&self, id: &str, status: DecisionStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE decisions SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Ok(())
    }

    /// Decision counts by status since `ts` (metrics/state snapshots).
    pub fn decisions_since(&self, ts: i64) -> Result<Vec<DecisionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, signal_id, client_plan_id, mode, approved, risk_pct, risk_amount, qty,
                    heat_before, heat_after, status, config_sha, ts
             FROM decisions WHERE ts >= ?1 ORDER BY ts DESC",
        )?;
        let rows = stmt.query_map(params![ts], row_to_decision)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// Insert a new order row; a duplicate `client_order_id` surfaces as
    /// [`InsertOutcome::Duplicate`] rather than an error.
    pub fn insert_order(&self, o: &OrderRecord) -> Result<InsertOutcome> {
        let conn = self.conn.lock();
        let res = conn.execute(
            "INSERT INTO orders
                 (id, decision_id, client_order_id, tag, parent_group, symbol, side, qty,
                  filled_qty, price, avg_fill_price, order_type, status, broker_id,
                  ts_created, ts_acked, ts_filled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                o.id,
                o.decision_id,
                o.client_order_id,
                o.tag.as_str(),
                o.parent_group,
                o.symbol,
                o.side.as_str(),
                o.qty,
                o.filled_qty,
                o.price,
                o.avg_fill_price,
                o.order_type.as_str(),
                o.status.as_str(),
                o.broker_id,
                o.ts_created,
                o.ts_acked,
                o.ts_filled
            ],
        );

        match res {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(rusqlite::Error::SqliteFailure(e, msg))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                debug!(
                    client_order_id = %o.client_order_id,
                    detail = msg.as_deref().unwrap_or(""),
                    "duplicate client_order_id rejected by store"
                );
                Ok(InsertOutcome::Duplicate)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// True if an order with this id exists in any of the given statuses.
    pub fn order_exists(&self, client_order_id: &str, statuses: &[OrderStatus]) -> Result<bool> {
        let order = self.order_by_client_id(client_order_id)?;
        Ok(order.map(|o| statuses.contains(&o.status)).unwrap_or(false))
    }

    /// True if the order is live at the broker (PLACED/PARTIAL/FILLED).
    pub fn order_exists_live(&self, client_order_id: &str) -> Result<bool> {
        self.order_exists(
            client_order_id,
            &[OrderStatus::Placed, OrderStatus::Partial, OrderStatus::Filled],
        )
    }

    pub fn order_by_client_id(&self, client_order_id: &str) -> Result<Option<OrderRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ORDER_COLS} FROM orders WHERE client_order_id = ?1"
        ))?;
        Ok(stmt.query_row(params![client_order_id], row_to_order).optional()?)
    }

    /// Record the broker ack: status PLACED plus broker id and ack timestamp.
    pub fn mark_order_acked(
        &self,
        client_order_id: &str,
        broker_id: &str,
        ts_acked: i64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE orders SET status = 'PLACED', broker_id = ?2, ts_acked = ?3
             WHERE client_order_id = ?1 AND status = 'NEW'",
            params![client_order_id, broker_id, ts_acked],
        )?;
        Ok(())
    }

    pub fn mark_order_rejected(&self, client_order_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE orders SET status = 'REJECTED' WHERE client_order_id = ?1",
            params![client_order_id],
        )?;
        Ok(())
    }

    /// Apply a broker status transition in one transaction, returning the
    /// previous status and the updated row.
    ///
    /// Repeated events for the same terminal status are no-ops and return
    /// `None` — the idempotency contract of the order watcher.
    pub fn apply_order_event(
        &self,
        client_order_id: &str,
        status: OrderStatus,
        filled_qty: i64,
        avg_price: Option<f64>,
        ts: i64,
    ) -> Result<Option<(OrderStatus, OrderRecord)>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let prev: Option<String> = tx
            .query_row(
                "SELECT status FROM orders WHERE client_order_id = ?1",
                params![client_order_id],
                |r| r.get(0),
            )
            .optional()?;

        let Some(prev) = prev else {
            tx.commit()?;
            return Ok(None);
        };
        let prev = OrderStatus::parse(&prev)
            .ok_or_else(|| anyhow::anyhow!("corrupt order status '{prev}'"))?;

        // Terminal states never transition again.
        if prev.is_terminal() {
            tx.commit()?;
            return Ok(None);
        }

        let ts_filled = if status == OrderStatus::Filled { Some(ts) } else { None };
        tx.execute(
            "UPDATE orders
             SET status = ?2,
                 filled_qty = MAX(filled_qty, ?3),
                 avg_fill_price = COALESCE(?4, avg_fill_price),
                 ts_filled = COALESCE(?5, ts_filled)
             WHERE client_order_id = ?1",
            params![client_order_id, status.as_str(), filled_qty, avg_price, ts_filled],
        )?;

        let updated = tx.query_row(
            &format!("SELECT {ORDER_COLS} FROM orders WHERE client_order_id = ?1"),
            params![client_order_id],
            row_to_order,
        )?;

        tx.commit()?;
        Ok(Some((prev, updated)))
    }

    pub fn orders_by_group(&self, parent_group: &str) -> Result<Vec<OrderRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ORDER_COLS} FROM orders WHERE parent_group = ?1 ORDER BY ts_created"
        ))?;
        let rows = stmt.query_map(params![parent_group], row_to_order)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// All non-terminal orders.
    pub fn open_orders(&self) -> Result<Vec<OrderRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ORDER_COLS} FROM orders
             WHERE status IN ('NEW','PLACED','PARTIAL') ORDER BY ts_created"
        ))?;
        let rows = stmt.query_map([], row_to_order)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Non-terminal STOP/TP children across all groups (flatten cancel pass).
    pub fn open_child_orders(&self) -> Result<Vec<OrderRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ORDER_COLS} FROM orders
             WHERE tag IN ('STOP','TP') AND status IN ('NEW','PLACED','PARTIAL')
             ORDER BY ts_created"
        ))?;
        let rows = stmt.query_map([], row_to_order)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    pub fn insert_position(&self, p: &PositionRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO positions
                 (id, symbol, side, qty, avg_entry, oco_group, stop_order_id, tp_order_id,
                  status, ts_opened, ts_closed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                p.id,
                p.symbol,
                p.side.as_str(),
                p.qty,
                p.avg_entry,
                p.oco_group,
                p.stop_order_id,
                p.tp_order_id,
                p.status.as_str(),
                p.ts_opened,
                p.ts_closed
            ],
        )?;
        Ok(())
    }

    pub fn set_position_children(
        &self,
        id: &str,
        stop_order_id: &str,
        tp_order_id: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE positions SET stop_order_id = ?2, tp_order_id = ?3, status = 'OPEN'
             WHERE id = ?1",
            params![id, stop_order_id, tp_order_id],
        )?;
        Ok(())
    }

    pub fn set_position_status(&self, id: &str, status: PositionStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE positions SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Ok(())
    }

    pub fn close_position(&self, id: &str, ts_closed: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE positions SET status = 'CLOSED', qty = 0, ts_closed = ?2 WHERE id = ?1",
            params![id, ts_closed],
        )?;
        Ok(())
    }

    pub fn position_by_id(&self, id: &str) -> Result<Option<PositionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {POSITION_COLS} FROM positions WHERE id = ?1"
        ))?;
        Ok(stmt.query_row(params![id], row_to_position).optional()?)
    }

    pub fn position_by_group(&self, oco_group: &str) -> Result<Option<PositionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {POSITION_COLS} FROM positions WHERE oco_group = ?1"
        ))?;
        Ok(stmt.query_row(params![oco_group], row_to_position).optional()?)
    }

    pub fn open_positions(&self) -> Result<Vec<PositionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {POSITION_COLS} FROM positions
             WHERE status IN ('OPENING','OPEN','CLOSING') ORDER BY ts_opened"
        ))?;
        let rows = stmt.query_map([], row_to_position)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Aggregate open risk: `sum(qty * |avg_entry - stop_price|)` over open
    /// positions that have a stop child.
    pub fn portfolio_heat(&self) -> Result<f64> {
        let conn = self.conn.lock();
        let heat: f64 = conn.query_row(
            "SELECT COALESCE(SUM(p.qty * ABS(p.avg_entry - o.price)), 0.0)
             FROM positions p
             JOIN orders o ON o.client_order_id = p.stop_order_id
             WHERE p.status IN ('OPENING','OPEN','CLOSING')",
            [],
            |r| r.get(0),
        )?;
        Ok(heat)
    }

    // -------------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------------

    pub fn insert_trade(&self, t: &TradeRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trades
                 (id, position_id, qty, entry_price, exit_price, exit_reason, gross_pnl,
                  net_pnl, slippage_bps, latency_ms, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                t.id,
                t.position_id,
                t.qty,
                t.entry_price,
                t.exit_price,
                t.exit_reason,
                t.gross_pnl,
                t.net_pnl,
                t.slippage_bps,
                t.latency_ms,
                t.ts
            ],
        )?;
        Ok(())
    }

    /// Realised net PnL for trades at or after `since` (daily-loss gate).
    pub fn realized_net_pnl_since(&self, since: i64) -> Result<f64> {
        let conn = self.conn.lock();
        let pnl: f64 = conn.query_row(
            "SELECT COALESCE(SUM(net_pnl), 0.0) FROM trades WHERE ts >= ?1",
            params![since],
            |r| r.get(0),
        )?;
        Ok(pnl)
    }

    // -------------------------------------------------------------------------
    // Risk events & audit
    // -------------------------------------------------------------------------

    pub fn insert_risk_event(&self, e: &RiskEventRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO risk_events (id, ts, event_type, decision_id, details)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![e.id, e.ts, e.event_type.as_str(), e.decision_id, e.details],
        )?;
        Ok(())
    }

    pub fn recent_risk_events(&self, limit: usize) -> Result<Vec<RiskEventRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, ts, event_type, decision_id, details
             FROM risk_events ORDER BY ts DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |r| {
            let event_type: String = r.get(2)?;
            Ok(RiskEventRecord {
                id: r.get(0)?,
                ts: r.get(1)?,
                event_type: models::RiskEventType::parse(&event_type)
                    .unwrap_or(models::RiskEventType::OrderRejected),
                decision_id: r.get(3)?,
                details: r.get(4)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    pub fn insert_audit(&self, a: &AuditRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO audit_logs (id, ts, action, session_id, actor, details, config_sha, git_head)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                a.id,
                a.ts,
                a.action.as_str(),
                a.session_id,
                a.actor,
                serde_json::to_string(&a.details)?,
                a.config_sha,
                a.git_head
            ],
        )?;
        Ok(())
    }

    pub fn audit_count(&self, action: models::AuditAction) -> Result<i64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM audit_logs WHERE action = ?1",
            params![action.as_str()],
            |r| r.get(0),
        )?;
        Ok(n)
    }
}

// =============================================================================
// Row mapping
// =============================================================================

const ORDER_COLS: &str = "id, decision_id, client_order_id, tag, parent_group, symbol, side, qty, \
                          filled_qty, price, avg_fill_price, order_type, status, broker_id, \
                          ts_created, ts_acked, ts_filled";

const POSITION_COLS: &str = "id, symbol, side, qty, avg_entry, oco_group, stop_order_id, \
                             tp_order_id, status, ts_opened, ts_closed";

fn row_to_order(r: &rusqlite::Row<'_>) -> rusqlite::Result<OrderRecord> {
    let tag: String = r.get(3)?;
    let side: String = r.get(6)?;
    let order_type: String = r.get(11)?;
    let status: String = r.get(12)?;
    Ok(OrderRecord {
        id: r.get(0)?,
        decision_id: r.get(1)?,
        client_order_id: r.get(2)?,
        tag: OrderTag::parse(&tag).unwrap_or(OrderTag::Entry),
        parent_group: r.get(4)?,
        symbol: r.get(5)?,
        side: OrderSide::parse(&side).unwrap_or(OrderSide::Buy),
        qty: r.get(7)?,
        filled_qty: r.get(8)?,
        price: r.get(9)?,
        avg_fill_price: r.get(10)?,
        order_type: OrderType::parse(&order_type).unwrap_or(OrderType::Market),
        status: OrderStatus::parse(&status).unwrap_or(OrderStatus::New),
        broker_id: r.get(13)?,
        ts_created: r.get(14)?,
        ts_acked: r.get(15)?,
        ts_filled: r.get(16)?,
    })
}

fn row_to_position(r: &rusqlite::Row<'_>) -> rusqlite::Result<PositionRecord> {
    let side: String = r.get(2)?;
    let status: String = r.get(8)?;
    Ok(PositionRecord {
        id: r.get(0)?,
        symbol: r.get(1)?,
        side: Side::parse(&side).unwrap_or(Side::Long),
        qty: r.get(3)?,
        avg_entry: r.get(4)?,
        oco_group: r.get(5)?,
        stop_order_id: r.get(6)?,
        tp_order_id: r.get(7)?,
        status: PositionStatus::parse(&status).unwrap_or(PositionStatus::Open),
        ts_opened: r.get(9)?,
        ts_closed: r.get(10)?,
    })
}

fn row_to_decision(r: &rusqlite::Row<'_>) -> rusqlite::Result<DecisionRecord> {
    let mode: String = r.get(3)?;
    let status: String = r.get(10)?;
    Ok(DecisionRecord {
        id: r.get(0)?,
        signal_id: r.get(1)?,
        client_plan_id: r.get(2)?,
        mode: mode.parse().unwrap_or(TradingMode::Paper),
        approved: r.get::<_, i64>(4)? != 0,
        risk_pct: r.get(5)?,
        risk_amount: r.get(6)?,
        qty: r.get(7)?,
        portfolio_heat_before: r.get(8)?,
        portfolio_heat_after: r.get(9)?,
        status: DecisionStatus::parse(&status).unwrap_or(DecisionStatus::Planned),
        config_sha: r.get(11)?,
        ts: r.get(12)?,
    })
}

// Convenience re-export for callers building feature maps.
pub type Features = BTreeMap<String, f64>;

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::models::*;
    use super::*;

    fn order(coid: &str, tag: OrderTag, status: OrderStatus) -> OrderRecord {
        OrderRecord {
            id: uuid::Uuid::new_v4().to_string(),
            decision_id: None,
            client_order_id: coid.to_string(),
            tag,
            parent_group: "grp-1".to_string(),
            symbol: "NIFTY".to_string(),
            side: OrderSide::Buy,
            qty: 50,
            filled_qty: 0,
            price: Some(21480.0),
            avg_fill_price: None,
            order_type: OrderType::Limit,
            status,
            broker_id: None,
            ts_created: 1,
            ts_acked: None,
            ts_filled: None,
        }
    }

    #[test]
    fn duplicate_client_order_id_surfaces_integrity() {
        let store = Store::open_in_memory().unwrap();
        let a = order("abc:ENTRY", OrderTag::Entry, OrderStatus::New);
        assert_eq!(store.insert_order(&a).unwrap(), InsertOutcome::Inserted);

        let mut b = order("abc:ENTRY", OrderTag::Entry, OrderStatus::New);
        b.id = uuid::Uuid::new_v4().to_string();
        assert_eq!(store.insert_order(&b).unwrap(), InsertOutcome::Duplicate);
    }

    #[test]
    fn order_event_transitions_and_idempotency() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_order(&order("p1:ENTRY", OrderTag::Entry, OrderStatus::New))
            .unwrap();
        store.mark_order_acked("p1:ENTRY", "B-1", 2).unwrap();

        let (prev, updated) = store
            .apply_order_event("p1:ENTRY", OrderStatus::Filled, 50, Some(21481.0), 3)
            .unwrap()
            .unwrap();
        assert_eq!(prev, OrderStatus::Placed);
        assert_eq!(updated.status, OrderStatus::Filled);
        assert_eq!(updated.filled_qty, 50);
        assert_eq!(updated.ts_filled, Some(3));

        // Replayed terminal event is a no-op.
        let replay = store
            .apply_order_event("p1:ENTRY", OrderStatus::Filled, 50, Some(21481.0), 4)
            .unwrap();
        assert!(replay.is_none());
    }

    #[test]
    fn unknown_order_event_is_none() {
        let store = Store::open_in_memory().unwrap();
        let res = store
            .apply_order_event("nope", OrderStatus::Filled, 1, None, 1)
            .unwrap();
        assert!(res.is_none());
    }

    #[test]
    fn portfolio_heat_joins_stop_price() {
        let store = Store::open_in_memory().unwrap();
        let mut stop = order("p1:STOP", OrderTag::Stop, OrderStatus::Placed);
        stop.price = Some(21385.0);
        stop.side = OrderSide::Sell;
        store.insert_order(&stop).unwrap();

        store
            .insert_position(&PositionRecord {
                id: "pos-1".to_string(),
                symbol: "NIFTY".to_string(),
                side: Side::Long,
                qty: 50,
                avg_entry: 21480.0,
                oco_group: "grp-1".to_string(),
                stop_order_id: Some("p1:STOP".to_string()),
                tp_order_id: Some("p1:TP".to_string()),
                status: PositionStatus::Open,
                ts_opened: 1,
                ts_closed: None,
            })
            .unwrap();

        let heat = store.portfolio_heat().unwrap();
        assert!((heat - 50.0 * 95.0).abs() < 1e-6);

        store.close_position("pos-1", 2).unwrap();
        assert_eq!(store.portfolio_heat().unwrap(), 0.0);
    }

    #[test]
    fn decision_plan_lookup() {
        let store = Store::open_in_memory().unwrap();
        let d = DecisionRecord {
            id: "d-1".to_string(),
            signal_id: "s-1".to_string(),
            client_plan_id: "abcdef".to_string(),
            mode: TradingMode::Paper,
            approved: true,
            risk_pct: 0.5,
            risk_amount: 4750.0,
            qty: 50,
            portfolio_heat_before: 0.0,
            portfolio_heat_after: 4750.0,
            status: DecisionStatus::Executed,
            config_sha: "sha".to_string(),
            ts: 1,
        };
        store.insert_decision(&d).unwrap();

        let found = store.decision_by_plan("abcdef").unwrap().unwrap();
        assert_eq!(found.id, "d-1");
        assert!(found.approved);
        assert!(store.decision_by_plan("zzz").unwrap().is_none());
    }

    #[test]
    fn audit_action_is_closed_enum_at_storage_layer() {
        let store = Store::open_in_memory().unwrap();
        // Valid action inserts fine.
        store
            .insert_audit(&AuditRecord {
                id: "a-1".to_string(),
                ts: 1,
                action: AuditAction::ModeChange,
                session_id: "sess".to_string(),
                actor: "api".to_string(),
                details: serde_json::json!({"to": "LIVE"}),
                config_sha: "sha".to_string(),
                git_head: "head".to_string(),
            })
            .unwrap();
        assert_eq!(store.audit_count(AuditAction::ModeChange).unwrap(), 1);

        // An out-of-enum action is rejected by the CHECK constraint.
        let conn = store.conn.lock();
        let err = conn.execute(
            "INSERT INTO audit_logs (id, ts, action, session_id, actor, details, config_sha, git_head)
             VALUES ('a-2', 2, 'NOT_AN_ACTION', 's', 'x', '{}', 'sha', 'head')",
            [],
        );
        assert!(err.is_err());
    }

    #[test]
    fn realized_pnl_window() {
        let store = Store::open_in_memory().unwrap();
        for (i, (ts, pnl)) in [(10, 100.0), (20, -40.0), (30, 25.0)].iter().enumerate() {
            store
                .insert_trade(&TradeRecord {
                    id: format!("t-{i}"),
                    position_id: "p".to_string(),
                    qty: 1,
                    entry_price: 1.0,
                    exit_price: 2.0,
                    exit_reason: "TP".to_string(),
                    gross_pnl: *pnl,
                    net_pnl: *pnl,
                    slippage_bps: 0.0,
                    latency_ms: 5,
                    ts: *ts,
                })
                .unwrap();
        }
        assert!((store.realized_net_pnl_since(0).unwrap() - 85.0).abs() < 1e-9);
        assert!((store.realized_net_pnl_since(15).unwrap() - (-15.0)).abs() < 1e-9);
    }
}
