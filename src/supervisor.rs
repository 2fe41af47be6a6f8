//! Trader supervisor — C9.
//!
//! Owns the registry of running traders and their per-trader cancellation
//! handles. One `tokio::spawn`ed loop per registered trader, with a
//! `watch`-based cancellation signal used to drain each loop within a
//! bounded shutdown window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cycle::{run_cycle, CycleDeps};
use crate::error::CoreError;
use crate::models::TraderStatus;

struct RunningTrader {
    cancel: tokio::sync::watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
    status: Arc<Mutex<TraderStatus>>,
}

/// Registry of running traders. Cheap to clone: the registry itself is
/// behind a mutex, so many callers (an API layer, a CLI) can share one
/// supervisor.
#[derive(Clone)]
pub struct TraderSupervisor {
    running: Arc<Mutex<HashMap<Uuid, RunningTrader>>>,
    shutdown_window: Duration,
    min_cycle_interval: Duration,
    max_cycle_interval: Duration,
}

impl TraderSupervisor {
    pub fn new(shutdown_window: Duration, min_cycle_interval: Duration, max_cycle_interval: Duration) -> Self {
        Self {
            running: Arc::new(Mutex::new(HashMap::new())),
            shutdown_window,
            min_cycle_interval,
            max_cycle_interval,
        }
    }

    /// Idempotent: starting an already-running trader is a no-op.
    pub fn start(&self, trader_id: Uuid, deps: CycleDeps) -> Arc<Mutex<TraderStatus>> {
        let mut running = self.running.lock();
        if let Some(existing) = running.get(&trader_id) {
            return existing.status.clone();
        }

        let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
        let status = Arc::new(Mutex::new(TraderStatus::default()));
        let status_for_task = status.clone();
        let min = self.min_cycle_interval;
        let max = self.max_cycle_interval;

        let handle = tokio::spawn(trader_loop(deps, cancel_rx, status_for_task, min, max));

        running.insert(
            trader_id,
            RunningTrader {
                cancel: cancel_tx,
                handle,
                status: status.clone(),
            },
        );
        status
    }

    /// Signals cancellation and waits up to `shutdown_window` for the task
    /// to drain its in-progress cycle. A task that doesn't finish in time is
    /// aborted outright: the `watch` signal only breaks the loop at its
    /// await points, so a task wedged past the window is forcibly stopped
    /// rather than left to finish a cycle (and its journal write) on its own
    /// after `stop()` has already returned.
    pub async fn stop(&self, trader_id: Uuid) {
        let entry = { self.running.lock().remove(&trader_id) };
        let Some(mut entry) = entry else {
            return;
        };

        let _ = entry.cancel.send(true);
        tokio::select! {
            res = &mut entry.handle => {
                match res {
                    Ok(()) => info!(%trader_id, "trader stopped cleanly"),
                    Err(e) => warn!(%trader_id, error = %e, "trader task panicked"),
                }
            }
            _ = tokio::time::sleep(self.shutdown_window) => {
                entry.handle.abort();
                warn!(%trader_id, "trader stop timed out, task aborted");
            }
        }
    }

    pub async fn stop_all(&self) {
        let ids: Vec<Uuid> = self.running.lock().keys().copied().collect();
        let stops = ids.into_iter().map(|id| self.stop(id));
        futures_join_all(stops).await;
    }

    pub fn status(&self, trader_id: Uuid) -> Option<TraderStatus> {
        self.running.lock().get(&trader_id).map(|t| t.status.lock().clone())
    }

    pub fn is_running(&self, trader_id: Uuid) -> bool {
        self.running.lock().contains_key(&trader_id)
    }
}

async fn futures_join_all<I, F>(iter: I)
where
    I: IntoIterator<Item = F>,
    F: std::future::Future<Output = ()>,
{
    for fut in iter {
        fut.await;
    }
}

async fn trader_loop(
    deps: CycleDeps,
    mut cancel: tokio::sync::watch::Receiver<bool>,
    status: Arc<Mutex<TraderStatus>>,
    min_interval: Duration,
    max_interval: Duration,
) {
    {
        let mut s = status.lock();
        s.is_running = true;
    }

    let mut cycle_number: u64 = 1;

    loop {
        if *cancel.borrow() {
            break;
        }

        let start = Instant::now();
        let result = run_cycle(&deps, cycle_number, &mut cancel).await;

        match result {
            Ok(outcome) if outcome.cancelled => {
                break;
            }
            Ok(outcome) => {
                let mut s = status.lock();
                s.last_cycle_number = cycle_number;
                s.last_cycle_success = Some(outcome.success);
                if let Some(reason) = outcome.pause_reason {
                    s.is_running = false;
                    s.paused_reason = Some(reason);
                    drop(s);
                    warn!(trader = %deps.trader.name, "trader paused after cycle");
                    break;
                }
            }
            Err(CoreError::FatalError(reason)) => {
                let mut s = status.lock();
                s.is_running = false;
                s.paused_reason = Some(reason.clone());
                drop(s);
                warn!(trader = %deps.trader.name, reason, "trader stopped: fatal error");
                break;
            }
            Err(other) => {
                warn!(trader = %deps.trader.name, error = %other, "unexpected error escaping run_cycle, continuing");
            }
        }

        cycle_number += 1;

        let elapsed = start.elapsed();
        let target = deps.trader.cycle_interval.clamp(min_interval, max_interval);
        let remaining = target.saturating_sub(elapsed);

        if remaining > Duration::ZERO {
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        break;
                    }
                }
            }
        }
    }

    let mut s = status.lock();
    s.is_running = false;
}
