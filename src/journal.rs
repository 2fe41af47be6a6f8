//! Cycle journal — C8.
//!
//! Append-only sqlite persistence for cycle records and order records:
//! `Arc<Mutex<Connection>>`, WAL mode, `CREATE TABLE IF NOT EXISTS`. Writes
//! race a soft deadline (logged but not fatal) and a hard deadline (falls
//! back to an in-memory overflow queue rather than losing the record).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::executor::OrderSink;
use crate::models::{
    truncate_field, Action, CycleRecord, OrderRecord, OrderStatus, PositionSide,
};

/// Hook for redacting chain-of-thought text before it is persisted. Default
/// is a no-op passthrough; a deployment that must not retain raw model
/// reasoning can supply its own.
pub trait Redactor: Send + Sync {
    fn redact(&self, cot_trace: &str) -> String {
        cot_trace.to_string()
    }
}

pub struct NoopRedactor;
impl Redactor for NoopRedactor {}

pub struct CycleJournal {
    conn: Arc<Mutex<Connection>>,
    soft_deadline: Duration,
    hard_deadline: Duration,
    redactor: Arc<dyn Redactor>,
    overflow: Mutex<VecDeque<PendingWrite>>,
}

enum PendingWrite {
    Cycle(CycleRecord),
    Order(OrderRecord),
}

impl CycleJournal {
    pub fn open(
        db_path: &str,
        soft_deadline: Duration,
        hard_deadline: Duration,
        redactor: Arc<dyn Redactor>,
    ) -> Result<Self> {
        let conn = Connection::open(db_path).context("open cycle journal db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS cycle_records (
                trader_id TEXT NOT NULL,
                cycle_number INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                system_prompt TEXT NOT NULL,
                user_prompt TEXT NOT NULL,
                raw_response TEXT NOT NULL,
                cot_trace TEXT NOT NULL,
                decisions_json TEXT NOT NULL,
                candidate_coins TEXT NOT NULL,
                execution_log TEXT NOT NULL,
                success INTEGER NOT NULL,
                failure_reason TEXT,
                PRIMARY KEY (trader_id, cycle_number)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_cycle_records_trader_started
             ON cycle_records(trader_id, started_at DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS order_records (
                trader_id TEXT NOT NULL,
                exchange_order_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                action TEXT NOT NULL,
                requested_qty REAL NOT NULL,
                requested_price REAL,
                status TEXT NOT NULL,
                avg_fill_price REAL,
                filled_qty REAL NOT NULL,
                filled_at TEXT,
                fee REAL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (trader_id, exchange_order_id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_order_records_status
             ON order_records(status)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            soft_deadline,
            hard_deadline,
            redactor,
            overflow: Mutex::new(VecDeque::new()),
        })
    }

    /// Writes exactly one `CycleRecord` per cycle that begins; the record is
    /// append-only once written. Oversized fields are truncated, not dropped,
    /// before the write races the deadlines.
    pub async fn write_cycle(&self, mut record: CycleRecord) -> Result<()> {
        record.cot_trace = truncate_field(&self.redactor.redact(&record.cot_trace));
        record.system_prompt = truncate_field(&record.system_prompt);
        record.user_prompt = truncate_field(&record.user_prompt);
        record.raw_response = truncate_field(&record.raw_response);
        record.decisions_json = truncate_field(&record.decisions_json);

        self.write_with_deadlines(PendingWrite::Cycle(record)).await
    }

    fn insert_cycle(conn: &Connection, record: &CycleRecord) -> Result<()> {
        let candidate_coins = serde_json::to_string(&record.candidate_coins)?;
        let execution_log = serde_json::to_string(&record.execution_log)?;
        conn.execute(
            "INSERT OR REPLACE INTO cycle_records
             (trader_id, cycle_number, started_at, system_prompt, user_prompt, raw_response,
              cot_trace, decisions_json, candidate_coins, execution_log, success, failure_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.trader_id.to_string(),
                record.cycle_number as i64,
                record.started_at.to_rfc3339(),
                record.system_prompt,
                record.user_prompt,
                record.raw_response,
                record.cot_trace,
                record.decisions_json,
                candidate_coins,
                execution_log,
                record.success as i64,
                record.failure_reason,
            ],
        )?;
        Ok(())
    }

    fn insert_order(conn: &Connection, order: &OrderRecord) -> Result<()> {
        conn.execute(
            "INSERT INTO order_records
             (trader_id, exchange_order_id, symbol, side, action, requested_qty, requested_price,
              status, avg_fill_price, filled_qty, filled_at, fee, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(trader_id, exchange_order_id) DO UPDATE SET
                status = excluded.status,
                avg_fill_price = excluded.avg_fill_price,
                filled_qty = excluded.filled_qty,
                filled_at = excluded.filled_at,
                fee = excluded.fee,
                updated_at = excluded.updated_at",
            params![
                order.trader_id.to_string(),
                order.exchange_order_id,
                order.symbol,
                side_str(order.side),
                action_str(order.action),
                order.requested_qty,
                order.requested_price,
                status_str(order.status),
                order.avg_fill_price,
                order.filled_qty,
                order.filled_at.map(|t| t.to_rfc3339()),
                order.fee,
                order.created_at.to_rfc3339(),
                order.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Races the write against the soft deadline (logged, not fatal) and the
    /// hard deadline (falls back to the overflow queue, drained by
    /// `drain_overflow`).
    async fn write_with_deadlines(&self, pending: PendingWrite) -> Result<()> {
        let conn = self.conn.clone();
        let write = async {
            let conn = conn.lock().await;
            match &pending {
                PendingWrite::Cycle(r) => Self::insert_cycle(&conn, r),
                PendingWrite::Order(o) => Self::insert_order(&conn, o),
            }
        };

        match tokio::time::timeout(self.soft_deadline, write).await {
            Ok(result) => return result,
            Err(_) => warn!("journal write exceeded soft deadline, still waiting"),
        }

        let conn = self.conn.clone();
        let remaining = self.hard_deadline.saturating_sub(self.soft_deadline);
        let write = async {
            let conn = conn.lock().await;
            match &pending {
                PendingWrite::Cycle(r) => Self::insert_cycle(&conn, r),
                PendingWrite::Order(o) => Self::insert_order(&conn, o),
            }
        };

        match tokio::time::timeout(remaining, write).await {
            Ok(result) => result,
            Err(_) => {
                error!("journal write exceeded hard deadline, queued to overflow");
                self.overflow.lock().await.push_back(pending);
                Ok(())
            }
        }
    }

    /// Drains the overflow queue, retrying each write once. Called on every
    /// tick of the reconciliation worker so a write that missed the hard
    /// deadline doesn't sit in memory until restart.
    pub async fn drain_overflow(&self) -> Result<usize> {
        let mut queue = self.overflow.lock().await;
        let pending: Vec<PendingWrite> = queue.drain(..).collect();
        drop(queue);

        let conn = self.conn.lock().await;
        let mut drained = 0;
        let mut failed = Vec::new();
        for item in pending {
            let result = match &item {
                PendingWrite::Cycle(r) => Self::insert_cycle(&conn, r),
                PendingWrite::Order(o) => Self::insert_order(&conn, o),
            };
            match result {
                Ok(()) => drained += 1,
                Err(e) => {
                    warn!(error = %e, "overflow drain retry failed, re-queuing");
                    failed.push(item);
                }
            }
        }
        drop(conn);

        if !failed.is_empty() {
            self.overflow.lock().await.extend(failed);
        }
        Ok(drained)
    }

    pub async fn unknown_orders(&self) -> Result<Vec<OrderRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT trader_id, exchange_order_id, symbol, side, action, requested_qty,
                    requested_price, status, avg_fill_price, filled_qty, filled_at, fee,
                    created_at, updated_at
             FROM order_records WHERE status = 'UNKNOWN'",
        )?;
        let rows = stmt.query_map([], row_to_order)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

#[async_trait]
impl OrderSink for CycleJournal {
    async fn upsert_order(&self, order: OrderRecord) -> Result<()> {
        self.write_with_deadlines(PendingWrite::Order(order)).await
    }
}

fn row_to_order(row: &rusqlite::Row) -> rusqlite::Result<OrderRecord> {
    let trader_id: String = row.get(0)?;
    let side: String = row.get(3)?;
    let action: String = row.get(4)?;
    let status: String = row.get(7)?;
    let filled_at: Option<String> = row.get(10)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;

    Ok(OrderRecord {
        trader_id: trader_id.parse().unwrap_or_default(),
        exchange_order_id: row.get(1)?,
        symbol: row.get(2)?,
        side: parse_side(&side),
        action: parse_action(&action),
        requested_qty: row.get(5)?,
        requested_price: row.get(6)?,
        status: parse_status(&status),
        avg_fill_price: row.get(8)?,
        filled_qty: row.get(9)?,
        filled_at: filled_at.and_then(|t| chrono::DateTime::parse_from_rfc3339(&t).ok()).map(|t| t.with_timezone(&chrono::Utc)),
        fee: row.get(11)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|t| t.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now()),
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)
            .map(|t| t.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now()),
    })
}

fn side_str(side: PositionSide) -> &'static str {
    match side {
        PositionSide::Long => "long",
        PositionSide::Short => "short",
    }
}

fn parse_side(s: &str) -> PositionSide {
    match s {
        "short" => PositionSide::Short,
        _ => PositionSide::Long,
    }
}

fn action_str(action: Action) -> &'static str {
    match action {
        Action::OpenLong => "open_long",
        Action::OpenShort => "open_short",
        Action::CloseLong => "close_long",
        Action::CloseShort => "close_short",
        Action::Hold => "hold",
        Action::Wait => "wait",
    }
}

fn parse_action(s: &str) -> Action {
    Action::parse(s).unwrap_or(Action::Wait)
}

fn status_str(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::New => "NEW",
        OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
        OrderStatus::Filled => "FILLED",
        OrderStatus::Rejected => "REJECTED",
        OrderStatus::Canceled => "CANCELED",
        OrderStatus::Unknown => "UNKNOWN",
    }
}

fn parse_status(s: &str) -> OrderStatus {
    match s {
        "NEW" => OrderStatus::New,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "REJECTED" => OrderStatus::Rejected,
        "CANCELED" => OrderStatus::Canceled,
        _ => OrderStatus::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn order(trader_id: Uuid, id: &str, status: OrderStatus) -> OrderRecord {
        OrderRecord {
            exchange_order_id: id.into(),
            trader_id,
            symbol: "BTCUSDT".into(),
            side: PositionSide::Long,
            action: Action::OpenLong,
            requested_qty: 500.0,
            requested_price: None,
            status,
            avg_fill_price: None,
            filled_qty: 0.0,
            filled_at: None,
            fee: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn cycle(trader_id: Uuid, n: u64) -> CycleRecord {
        CycleRecord {
            cycle_number: n,
            trader_id,
            started_at: Utc::now(),
            system_prompt: "sys".into(),
            user_prompt: "user".into(),
            raw_response: "raw".into(),
            cot_trace: "cot".into(),
            decisions_json: "[]".into(),
            candidate_coins: vec!["BTCUSDT".into()],
            execution_log: vec![],
            success: true,
            failure_reason: None,
        }
    }

    #[tokio::test]
    async fn write_and_read_back_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.db");
        let journal = CycleJournal::open(
            path.to_str().unwrap(),
            Duration::from_secs(1),
            Duration::from_secs(5),
            Arc::new(NoopRedactor),
        )
        .unwrap();

        let trader_id = Uuid::new_v4();
        journal.write_cycle(cycle(trader_id, 1)).await.unwrap();
        journal.write_cycle(cycle(trader_id, 2)).await.unwrap();
    }

    #[tokio::test]
    async fn upsert_order_is_idempotent_by_order_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.db");
        let journal = CycleJournal::open(
            path.to_str().unwrap(),
            Duration::from_secs(1),
            Duration::from_secs(5),
            Arc::new(NoopRedactor),
        )
        .unwrap();

        let trader_id = Uuid::new_v4();
        journal
            .upsert_order(order(trader_id, "abc", OrderStatus::New))
            .await
            .unwrap();
        journal
            .upsert_order(order(trader_id, "abc", OrderStatus::Filled))
            .await
            .unwrap();

        let unknown = journal.unknown_orders().await.unwrap();
        assert!(unknown.is_empty());
    }

    #[tokio::test]
    async fn unknown_orders_are_listed_for_reconciliation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.db");
        let journal = CycleJournal::open(
            path.to_str().unwrap(),
            Duration::from_secs(1),
            Duration::from_secs(5),
            Arc::new(NoopRedactor),
        )
        .unwrap();

        let trader_id = Uuid::new_v4();
        journal
            .upsert_order(order(trader_id, "unk-1", OrderStatus::Unknown))
            .await
            .unwrap();

        let unknown = journal.unknown_orders().await.unwrap();
        assert_eq!(unknown.len(), 1);
        assert_eq!(unknown[0].exchange_order_id, "unk-1");
    }

    #[test]
    fn truncate_field_adds_marker_past_cap() {
        let huge = "a".repeat(300_000);
        let truncated = truncate_field(&huge);
        assert!(truncated.contains("truncated"));
        assert!(truncated.len() < huge.len());
    }
}
