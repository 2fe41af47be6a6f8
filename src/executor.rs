//! Executor — C7.
//!
//! Orders decisions (close before open), submits to the exchange adapter
//! write-then-submit, polls briefly for fill confirmation, and records
//! every order keyed by `(trader_id, exchange_order_id)` for idempotence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::SubmitErrorKind;
use crate::models::{Action, Decision, OrderRecord, OrderStatus, Position, PositionSide};

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: PositionSide,
    pub qty: f64,
    pub leverage: u32,
    pub order_type: OrderType,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Set for close-side decisions: the fill must shrink or remove an
    /// existing position rather than open or grow one.
    pub reduce_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone)]
pub struct ExchangeOrderStatus {
    pub status: OrderStatus,
    pub avg_price: Option<f64>,
    pub filled_qty: f64,
    pub fee: Option<f64>,
    pub filled_at: Option<chrono::DateTime<Utc>>,
}

/// Contract for the shared, process-wide exchange adapter. Out of scope
/// beyond this trait — exchange signing, rate limiting, and wire formats
/// are external collaborators.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn place_order(&self, req: OrderRequest) -> Result<String, SubmitErrorKind>;
    async fn get_order_status(&self, order_id: &str) -> Result<ExchangeOrderStatus>;
    async fn list_positions(&self) -> Result<Vec<crate::models::Position>>;
    async fn equity(&self) -> Result<f64>;
}

/// Paper-trading reference implementation: simulated latency and
/// size-dependent slippage, immediate fill on market orders, an in-memory
/// equity/position ledger. Lets the crate run end to end without live
/// exchange credentials; a real venue adapter implements the same trait.
pub struct PaperExchangeAdapter {
    equity: Mutex<f64>,
    positions: Mutex<HashMap<String, Position>>,
    orders: Mutex<HashMap<String, ExchangeOrderStatus>>,
    base_slippage_bps: f64,
    slippage_bps_per_1k: f64,
    fee_rate: f64,
}

impl PaperExchangeAdapter {
    pub fn new(starting_equity: f64) -> Self {
        Self {
            equity: Mutex::new(starting_equity),
            positions: Mutex::new(HashMap::new()),
            orders: Mutex::new(HashMap::new()),
            base_slippage_bps: 10.0,
            slippage_bps_per_1k: 15.0,
            fee_rate: 0.0005,
        }
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchangeAdapter {
    async fn place_order(&self, req: OrderRequest) -> Result<String, SubmitErrorKind> {
        if !(req.qty.is_finite() && req.qty > 0.0) {
            return Err(SubmitErrorKind::Permanent);
        }

        let jitter_ms = rand::thread_rng().gen_range(0..150);
        tokio::time::sleep(Duration::from_millis(50 + jitter_ms)).await;

        let size_factor = req.qty / 1000.0;
        let slippage_bps = self.base_slippage_bps + self.slippage_bps_per_1k * size_factor;
        let fill_price = 1.0 + slippage_bps / 10_000.0;
        let fee = req.qty * self.fee_rate;

        let order_id = format!("paper-{}", Uuid::new_v4());
        self.orders.lock().insert(
            order_id.clone(),
            ExchangeOrderStatus {
                status: OrderStatus::Filled,
                avg_price: Some(fill_price),
                filled_qty: req.qty,
                fee: Some(fee),
                filled_at: Some(Utc::now()),
            },
        );

        let mut positions = self.positions.lock();
        if req.reduce_only {
            if let Some(p) = positions.get_mut(&req.symbol) {
                p.size -= req.qty;
                if p.size <= 0.0 {
                    positions.remove(&req.symbol);
                }
            }
        } else {
            positions
                .entry(req.symbol.clone())
                .and_modify(|p| p.size += req.qty)
                .or_insert(Position {
                    symbol: req.symbol,
                    side: req.side,
                    size: req.qty,
                    entry_price: fill_price,
                    unrealized_pnl: 0.0,
                    leverage: req.leverage,
                });
        }
        *self.equity.lock() -= fee;

        Ok(order_id)
    }

    async fn get_order_status(&self, order_id: &str) -> Result<ExchangeOrderStatus> {
        self.orders
            .lock()
            .get(order_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown paper order {order_id}"))
    }

    async fn list_positions(&self) -> Result<Vec<Position>> {
        Ok(self.positions.lock().values().cloned().collect())
    }

    async fn equity(&self) -> Result<f64> {
        Ok(*self.equity.lock())
    }
}

/// Stably sorts decisions so close-actions submit before open-actions
/// before hold/wait, freeing risk budget before committing new risk.
pub fn sort_for_execution(mut decisions: Vec<Decision>) -> Vec<Decision> {
    decisions.sort_by_key(priority);
    decisions
}

fn priority(d: &Decision) -> u8 {
    match d.action {
        Action::CloseLong | Action::CloseShort => 1,
        Action::OpenLong | Action::OpenShort => 2,
        Action::Hold | Action::Wait => 3,
    }
}

/// A sink the executor writes `OrderRecord`s to, keyed by
/// `(trader_id, exchange_order_id)`. Implemented by `journal::CycleJournal`.
#[async_trait]
pub trait OrderSink: Send + Sync {
    async fn upsert_order(&self, order: OrderRecord) -> Result<()>;
}

pub struct ExecutionOutcome {
    pub log: Vec<String>,
}

/// Submits every actionable decision (hold/wait are skipped) with bounded
/// concurrency, polls briefly for fill confirmation, and upserts an
/// `OrderRecord` for each. Never blocks past the poll budget — orders
/// still `UNKNOWN` after polling are left for background reconciliation.
pub async fn execute_decisions(
    trader_id: Uuid,
    decisions: Vec<Decision>,
    adapter: Arc<dyn ExchangeAdapter>,
    sink: Arc<dyn OrderSink>,
    fan_out: usize,
    submit_timeout: Duration,
    poll_timeout: Duration,
) -> ExecutionOutcome {
    let ordered = sort_for_execution(decisions);
    let sem = Arc::new(Semaphore::new(fan_out.max(1)));
    let mut handles = Vec::new();

    for decision in ordered {
        if matches!(decision.action, Action::Hold | Action::Wait) {
            continue;
        }
        let adapter = adapter.clone();
        let sink = sink.clone();
        let sem = sem.clone();
        handles.push(tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.expect("semaphore closed");
            submit_one(trader_id, decision, adapter, sink, submit_timeout, poll_timeout).await
        }));
    }

    let mut log = Vec::with_capacity(handles.len());
    for h in handles {
        match h.await {
            Ok(line) => log.push(line),
            Err(e) => log.push(format!("submission task panicked: {e}")),
        }
    }

    ExecutionOutcome { log }
}

async fn submit_one(
    trader_id: Uuid,
    decision: Decision,
    adapter: Arc<dyn ExchangeAdapter>,
    sink: Arc<dyn OrderSink>,
    submit_timeout: Duration,
    poll_timeout: Duration,
) -> String {
    let side = match decision.action {
        Action::OpenLong | Action::CloseShort => PositionSide::Long,
        Action::OpenShort | Action::CloseLong => PositionSide::Short,
        Action::Hold | Action::Wait => unreachable!("filtered out before submission"),
    };

    let reduce_only = matches!(decision.action, Action::CloseLong | Action::CloseShort);
    let qty = decision.position_size_usd.unwrap_or(0.0);
    let req = OrderRequest {
        symbol: decision.symbol.clone(),
        side,
        qty,
        leverage: decision.leverage.unwrap_or(1),
        order_type: OrderType::Market,
        stop_loss: decision.stop_loss,
        take_profit: decision.take_profit,
        reduce_only,
    };

    let now = Utc::now();

    let placement = tokio::time::timeout(submit_timeout, adapter.place_order(req)).await;

    let (order_id, status) = match placement {
        Ok(Ok(id)) => (id, OrderStatus::New),
        Ok(Err(SubmitErrorKind::Permanent)) => {
            let id = format!("rejected-{}", Uuid::new_v4());
            warn!(symbol = %decision.symbol, "order submission rejected");
            (id, OrderStatus::Rejected)
        }
        Ok(Err(SubmitErrorKind::Transient)) | Err(_) => {
            let id = format!("unknown-{}", Uuid::new_v4());
            warn!(symbol = %decision.symbol, "order submission unknown (timeout/transient)");
            (id, OrderStatus::Unknown)
        }
    };

    let mut record = OrderRecord {
        exchange_order_id: order_id.clone(),
        trader_id,
        symbol: decision.symbol.clone(),
        side,
        action: decision.action,
        requested_qty: qty,
        requested_price: None,
        status,
        avg_fill_price: None,
        filled_qty: 0.0,
        filled_at: None,
        fee: None,
        created_at: now,
        updated_at: now,
    };

    if let Err(e) = sink.upsert_order(record.clone()).await {
        warn!(error = %e, "failed to journal order record");
    }

    if record.status == OrderStatus::New {
        record = poll_for_fill(adapter.as_ref(), record, poll_timeout).await;
        if let Err(e) = sink.upsert_order(record.clone()).await {
            warn!(error = %e, "failed to journal fill update");
        }
    }

    info!(
        symbol = %record.symbol, order_id = %record.exchange_order_id, status = ?record.status,
        "order processed"
    );

    format!(
        "{} {:?} -> {:?} (order_id={})",
        record.symbol, decision.action, record.status, record.exchange_order_id
    )
}

/// Polls up to 5 times with 500ms spacing. Stops early on a terminal
/// status. Each status check is bounded by `poll_timeout`.
async fn poll_for_fill(
    adapter: &dyn ExchangeAdapter,
    mut record: OrderRecord,
    poll_timeout: Duration,
) -> OrderRecord {
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let outcome = tokio::time::timeout(
            poll_timeout,
            adapter.get_order_status(&record.exchange_order_id),
        )
        .await;
        match outcome {
            Ok(Ok(status)) => {
                record.status = status.status;
                record.avg_fill_price = status.avg_price.or(record.avg_fill_price);
                record.filled_qty = status.filled_qty;
                record.fee = status.fee.or(record.fee);
                record.filled_at = status.filled_at.or(record.filled_at);
                record.updated_at = Utc::now();
                if record.status.is_terminal() {
                    return record;
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, order_id = %record.exchange_order_id, "poll failed");
            }
            Err(_) => {
                warn!(order_id = %record.exchange_order_id, "poll timed out");
            }
        }
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn decision(symbol: &str, action: Action, confidence: Option<f64>) -> Decision {
        Decision {
            symbol: symbol.into(),
            action,
            leverage: Some(5),
            position_size_usd: Some(500.0),
            stop_loss: Some(1.0),
            take_profit: Some(2.0),
            confidence,
            risk_usd: None,
            reasoning: "t".into(),
        }
    }

    #[test]
    fn s_ordering_closes_before_opens_before_hold_wait() {
        let decisions = vec![
            decision("A", Action::Hold, None),
            decision("B", Action::OpenLong, Some(70.0)),
            decision("C", Action::CloseShort, None),
            decision("D", Action::Wait, None),
            decision("E", Action::OpenShort, Some(80.0)),
        ];
        let sorted = sort_for_execution(decisions);
        let actions: Vec<Action> = sorted.iter().map(|d| d.action).collect();
        assert_eq!(
            actions,
            vec![
                Action::CloseShort,
                Action::OpenLong,
                Action::OpenShort,
                Action::Hold,
                Action::Wait,
            ]
        );
    }

    struct FakeAdapter {
        place_result: Result<String, SubmitErrorKind>,
        poll_sequence: StdMutex<Vec<OrderStatus>>,
    }

    #[async_trait]
    impl ExchangeAdapter for FakeAdapter {
        async fn place_order(&self, _req: OrderRequest) -> Result<String, SubmitErrorKind> {
            self.place_result.clone()
        }

        async fn get_order_status(&self, _order_id: &str) -> Result<ExchangeOrderStatus> {
            let mut seq = self.poll_sequence.lock().unwrap();
            let status = if seq.is_empty() {
                OrderStatus::Filled
            } else {
                seq.remove(0)
            };
            Ok(ExchangeOrderStatus {
                status,
                avg_price: Some(65000.0),
                filled_qty: 1.0,
                fee: Some(0.5),
                filled_at: Some(Utc::now()),
            })
        }

        async fn list_positions(&self) -> Result<Vec<crate::models::Position>> {
            Ok(vec![])
        }

        async fn equity(&self) -> Result<f64> {
            Ok(10_000.0)
        }
    }

    #[derive(Default)]
    struct FakeSink {
        orders: StdMutex<Vec<OrderRecord>>,
    }

    #[async_trait]
    impl OrderSink for FakeSink {
        async fn upsert_order(&self, order: OrderRecord) -> Result<()> {
            let mut orders = self.orders.lock().unwrap();
            if let Some(existing) = orders
                .iter_mut()
                .find(|o| o.exchange_order_id == order.exchange_order_id)
            {
                *existing = order;
            } else {
                orders.push(order);
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn s1_happy_path_fills_after_poll() {
        let adapter: Arc<dyn ExchangeAdapter> = Arc::new(FakeAdapter {
            place_result: Ok("order-1".into()),
            poll_sequence: StdMutex::new(vec![OrderStatus::New, OrderStatus::Filled]),
        });
        let sink = Arc::new(FakeSink::default());
        let decisions = vec![decision("BTCUSDT", Action::OpenLong, Some(70.0))];

        execute_decisions(
            Uuid::new_v4(),
            decisions,
            adapter,
            sink.clone(),
            4,
            Duration::from_secs(10),
            Duration::from_millis(500),
        )
        .await;

        let orders = sink.orders.lock().unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, OrderStatus::Filled);
    }

    #[tokio::test(start_paused = true)]
    async fn s6_timeout_submission_is_unknown() {
        let adapter: Arc<dyn ExchangeAdapter> = Arc::new(FakeAdapter {
            place_result: Err(SubmitErrorKind::Transient),
            poll_sequence: StdMutex::new(vec![]),
        });
        let sink = Arc::new(FakeSink::default());
        let decisions = vec![decision("BTCUSDT", Action::OpenLong, Some(70.0))];

        execute_decisions(
            Uuid::new_v4(),
            decisions,
            adapter,
            sink.clone(),
            4,
            Duration::from_secs(10),
            Duration::from_millis(500),
        )
        .await;

        let orders = sink.orders.lock().unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, OrderStatus::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn paper_adapter_close_shrinks_not_inflates_position() {
        let adapter = PaperExchangeAdapter::new(10_000.0);

        adapter
            .place_order(OrderRequest {
                symbol: "BTCUSDT".into(),
                side: PositionSide::Long,
                qty: 10.0,
                leverage: 5,
                order_type: OrderType::Market,
                stop_loss: None,
                take_profit: None,
                reduce_only: false,
            })
            .await
            .unwrap();

        let positions = adapter.list_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].size, 10.0);

        adapter
            .place_order(OrderRequest {
                symbol: "BTCUSDT".into(),
                side: PositionSide::Short,
                qty: 4.0,
                leverage: 5,
                order_type: OrderType::Market,
                stop_loss: None,
                take_profit: None,
                reduce_only: true,
            })
            .await
            .unwrap();

        let positions = adapter.list_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].size, 6.0);

        adapter
            .place_order(OrderRequest {
                symbol: "BTCUSDT".into(),
                side: PositionSide::Short,
                qty: 6.0,
                leverage: 5,
                order_type: OrderType::Market,
                stop_loss: None,
                take_profit: None,
                reduce_only: true,
            })
            .await
            .unwrap();

        let positions = adapter.list_positions().await.unwrap();
        assert!(positions.is_empty());
    }

    #[tokio::test]
    async fn idempotent_upsert_coalesces_by_order_id() {
        let sink = FakeSink::default();
        let trader_id = Uuid::new_v4();
        let mut order = OrderRecord {
            exchange_order_id: "dup-1".into(),
            trader_id,
            symbol: "BTCUSDT".into(),
            side: PositionSide::Long,
            action: Action::OpenLong,
            requested_qty: 500.0,
            requested_price: None,
            status: OrderStatus::New,
            avg_fill_price: None,
            filled_qty: 0.0,
            filled_at: None,
            fee: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        sink.upsert_order(order.clone()).await.unwrap();
        order.status = OrderStatus::Filled;
        order.filled_qty = 500.0;
        sink.upsert_order(order).await.unwrap();

        let orders = sink.orders.lock().unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, OrderStatus::Filled);
    }
}
