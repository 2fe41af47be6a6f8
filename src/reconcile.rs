//! Background reconciliation of `UNKNOWN` orders: orders left `UNKNOWN`
//! after the executor's poll budget are not retried inline — a separate
//! worker periodically re-checks them against the exchange's trade history
//! so a cycle never blocks on a stuck order.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::executor::{ExchangeAdapter, OrderSink};
use crate::journal::CycleJournal;
use crate::models::OrderRecord;

pub struct ReconciliationWorker {
    journal: Arc<CycleJournal>,
    adapter: Arc<dyn ExchangeAdapter>,
    interval: Duration,
}

impl ReconciliationWorker {
    pub fn new(journal: Arc<CycleJournal>, adapter: Arc<dyn ExchangeAdapter>, interval: Duration) -> Self {
        Self {
            journal,
            adapter,
            interval,
        }
    }

    /// Runs until `shutdown` resolves. Spawned once per process, not per
    /// trader, since reconciliation reads the shared exchange account.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        warn!(error = %e, "reconciliation pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("reconciliation worker shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn reconcile_once(&self) -> anyhow::Result<()> {
        match self.journal.drain_overflow().await {
            Ok(0) => {}
            Ok(n) => info!(count = n, "drained journal overflow queue"),
            Err(e) => warn!(error = %e, "journal overflow drain failed"),
        }

        let unknown = self.journal.unknown_orders().await?;
        if unknown.is_empty() {
            return Ok(());
        }
        info!(count = unknown.len(), "reconciling unknown orders");

        for order in unknown {
            self.reconcile_one(order).await;
        }
        Ok(())
    }

    async fn reconcile_one(&self, mut order: OrderRecord) {
        match self.adapter.get_order_status(&order.exchange_order_id).await {
            Ok(status) => {
                if status.status == order.status {
                    return;
                }
                order.status = status.status;
                order.avg_fill_price = status.avg_price.or(order.avg_fill_price);
                order.filled_qty = status.filled_qty;
                order.fee = status.fee.or(order.fee);
                order.filled_at = status.filled_at.or(order.filled_at);
                order.updated_at = chrono::Utc::now();
                if let Err(e) = self.journal.upsert_order(order.clone()).await {
                    warn!(error = %e, order_id = %order.exchange_order_id, "failed to persist reconciled order");
                } else {
                    info!(order_id = %order.exchange_order_id, status = ?order.status, "order reconciled");
                }
            }
            Err(e) => {
                warn!(error = %e, order_id = %order.exchange_order_id, "reconciliation lookup failed, will retry next pass");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SubmitErrorKind;
    use crate::executor::{ExchangeOrderStatus, OrderRequest};
    use crate::models::{Action, OrderStatus, Position, PositionSide};
    use async_trait::async_trait;
    use uuid::Uuid;

    struct FakeAdapter {
        next_status: OrderStatus,
    }

    #[async_trait]
    impl ExchangeAdapter for FakeAdapter {
        async fn place_order(&self, _req: OrderRequest) -> anyhow::Result<String, SubmitErrorKind> {
            Ok("n/a".into())
        }

        async fn get_order_status(&self, _order_id: &str) -> anyhow::Result<ExchangeOrderStatus> {
            Ok(ExchangeOrderStatus {
                status: self.next_status,
                avg_price: Some(100.0),
                filled_qty: 1.0,
                fee: Some(0.1),
                filled_at: Some(chrono::Utc::now()),
            })
        }

        async fn list_positions(&self) -> anyhow::Result<Vec<Position>> {
            Ok(vec![])
        }

        async fn equity(&self) -> anyhow::Result<f64> {
            Ok(1000.0)
        }
    }

    #[tokio::test]
    async fn reconciles_unknown_order_to_filled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reconcile.db");
        let journal = Arc::new(
            crate::journal::CycleJournal::open(
                path.to_str().unwrap(),
                Duration::from_secs(1),
                Duration::from_secs(5),
                Arc::new(crate::journal::NoopRedactor),
            )
            .unwrap(),
        );

        let trader_id = Uuid::new_v4();
        let order = OrderRecord {
            exchange_order_id: "unk-1".into(),
            trader_id,
            symbol: "BTCUSDT".into(),
            side: PositionSide::Long,
            action: Action::OpenLong,
            requested_qty: 1.0,
            requested_price: None,
            status: OrderStatus::Unknown,
            avg_fill_price: None,
            filled_qty: 0.0,
            filled_at: None,
            fee: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        journal.upsert_order(order).await.unwrap();

        let adapter: Arc<dyn ExchangeAdapter> = Arc::new(FakeAdapter {
            next_status: OrderStatus::Filled,
        });
        let worker = ReconciliationWorker::new(journal.clone(), adapter, Duration::from_secs(30));
        worker.reconcile_once().await.unwrap();

        let still_unknown = journal.unknown_orders().await.unwrap();
        assert!(still_unknown.is_empty());
    }
}
