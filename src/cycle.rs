//! Cycle orchestrator: wires C1 through C8 for a single trader's cycle.
//!
//! Per-decision errors stay local (dropped via `ValidationDrop`/`RiskReshape`
//! records). Per-cycle errors (no universe, no data, model/parse failure)
//! short-circuit straight to the journal and the cycle ends early — they
//! never propagate past `run_cycle`. Only a journal write failure escalates
//! to `CoreError::FatalError`, since a cycle that can't be recorded can't be
//! trusted to have happened at all.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{CoreError, ModelErrorKind, ValidationDrop};
use crate::executor::{execute_decisions, ExchangeAdapter, OrderSink};
use crate::journal::CycleJournal;
use crate::market_data::{build_snapshot, MarketDataProvider};
use crate::model_client::{call_with_retry, ModelClient};
use crate::models::{AccountSnapshot, Decision, StrategyConfig, Trader};
use crate::parser::parse_response;
use crate::prompt::{compose_system_prompt, compose_user_prompt};
use crate::universe::{resolve_candidates, UniverseProvider};
use crate::validator::validate_all;

pub struct CycleDeps {
    pub trader: Trader,
    pub strategy: StrategyConfig,
    pub universe_provider: Arc<dyn UniverseProvider>,
    pub market_provider: Arc<dyn MarketDataProvider>,
    pub model_client: Arc<dyn ModelClient>,
    pub exchange: Arc<dyn ExchangeAdapter>,
    pub journal: Arc<CycleJournal>,
    pub config: EngineConfig,
}

#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub success: bool,
    pub failure_reason: Option<String>,
    /// Set when the model returned an auth error; the trader should be
    /// paused and surfaced to the operator rather than retried blindly.
    pub pause_reason: Option<String>,
    /// Set when the cycle was aborted mid-flight by a cancellation signal.
    /// No `CycleRecord` is written for a cancelled cycle.
    pub cancelled: bool,
}

/// Races `fut` against `cancel` ticking to `true`. Returns `None` if
/// cancellation wins, either because it was already signalled or because it
/// fires while `fut` is still pending.
async fn race_cancel<F: std::future::Future>(
    fut: F,
    cancel: &mut tokio::sync::watch::Receiver<bool>,
) -> Option<F::Output> {
    if *cancel.borrow() {
        return None;
    }
    tokio::select! {
        out = fut => Some(out),
        _ = cancel.changed() => None,
    }
}

/// Runs exactly one cycle and writes exactly one `CycleRecord`, success or
/// failure. `cancel` is raced against every in-flight model call, market
/// fetch, and exchange submission; a cancellation mid-cycle aborts with no
/// `CycleRecord` written at all.
pub async fn run_cycle(
    deps: &CycleDeps,
    cycle_number: u64,
    cancel: &mut tokio::sync::watch::Receiver<bool>,
) -> Result<CycleOutcome, CoreError> {
    let started_at = Utc::now();
    let mut execution_log = Vec::new();

    let Some(account_result) = race_cancel(fetch_account(deps), cancel).await else {
        return Ok(cancelled_outcome());
    };
    let account = match account_result {
        Ok(a) => a,
        Err(reason) => {
            return finish_failed(deps, cycle_number, started_at, "", "", "", vec![], &reason).await;
        }
    };

    let Some(candidates_result) = race_cancel(
        resolve_candidates(
            &deps.strategy.coin_source,
            deps.universe_provider.as_ref(),
            &account.positions.values().cloned().collect::<Vec<_>>(),
        ),
        cancel,
    )
    .await
    else {
        return Ok(cancelled_outcome());
    };
    let candidates = match candidates_result {
        Ok(c) => c,
        Err(e) => {
            let reason = format!("source_unavailable: {e}");
            return finish_failed(deps, cycle_number, started_at, "", "", "", vec![], &reason).await;
        }
    };

    let limited: Vec<String> = candidates.into_iter().take(deps.strategy.coin_limit.max(1)).collect();

    let Some(snapshot_result) = race_cancel(
        build_snapshot(
            deps.market_provider.clone(),
            &limited,
            &deps.strategy.indicators,
            deps.config.market_fetch_fan_out,
            deps.config.market_fetch_timeout,
        ),
        cancel,
    )
    .await
    else {
        return Ok(cancelled_outcome());
    };
    let snapshot = match snapshot_result {
        Ok(s) => s,
        Err(e) => {
            let reason = format!("data_incomplete: {e}");
            return finish_failed(deps, cycle_number, started_at, "", "", "", limited, &reason).await;
        }
    };

    let system_prompt = compose_system_prompt(&deps.strategy);
    let user_prompt = compose_user_prompt(&deps.strategy, &snapshot, &account, started_at);

    let Some(model_result) = race_cancel(
        call_with_retry(
            deps.model_client.as_ref(),
            &system_prompt,
            &user_prompt,
            deps.config.model_call_timeout,
        ),
        cancel,
    )
    .await
    else {
        return Ok(cancelled_outcome());
    };
    let model_out = match model_result {
        Ok(out) => out,
        Err(kind) => {
            let reason = format!("model_error: {kind}");
            let mut outcome = finish_failed(
                deps,
                cycle_number,
                started_at,
                &system_prompt,
                &user_prompt,
                "",
                limited,
                &reason,
            )
            .await?;
            if kind == ModelErrorKind::Auth {
                outcome.pause_reason = Some("model authentication failed".into());
            }
            return Ok(outcome);
        }
    };

    let parsed = match parse_response(&model_out.text) {
        Ok(p) => p,
        Err(e) => {
            let reason = format!("parse_error: {e}");
            return finish_failed(
                deps,
                cycle_number,
                started_at,
                &system_prompt,
                &user_prompt,
                &model_out.text,
                limited,
                &reason,
            )
            .await;
        }
    };

    let decisions_json =
        serde_json::to_string(&parsed.decisions).unwrap_or_else(|_| "[]".to_string());

    let mut decisions: Vec<Decision> = Vec::with_capacity(parsed.decisions.len());
    let mut alphabet_drops: Vec<ValidationDrop> = Vec::new();
    for raw in parsed.decisions {
        let symbol = raw.symbol.clone();
        let action = raw.action.clone();
        match raw.into_decision() {
            Ok(d) => decisions.push(d),
            Err(e) => {
                warn!(symbol = %symbol, action = %action, error = %e, "decision dropped: action not in allowed alphabet");
                alphabet_drops.push(ValidationDrop {
                    symbol,
                    rule: "action_alphabet".to_string(),
                    detail: format!("unrecognized action {action:?}: {e}"),
                });
            }
        }
    }
    for d in &alphabet_drops {
        execution_log.push(format!("dropped {} ({}): {}", d.symbol, d.rule, d.detail));
    }

    let entry_hints = build_entry_hints(&snapshot);

    let (validated, drops) = validate_all(decisions, &deps.strategy.risk, &account, &entry_hints);
    for d in &drops {
        execution_log.push(format!("dropped {} ({}): {}", d.symbol, d.rule, d.detail));
    }

    let enforcement = crate::risk_enforcer::enforce(validated, &deps.strategy.risk, &account);
    for r in &enforcement.reshapes {
        execution_log.push(format!("reshaped {:?}: {}", r.symbol, r.detail));
    }

    let Some(outcome) = race_cancel(
        execute_decisions(
            deps.trader.id,
            enforcement.decisions,
            deps.exchange.clone(),
            deps.journal.clone() as Arc<dyn OrderSink>,
            deps.config.submission_fan_out,
            deps.config.exchange_submit_timeout,
            deps.config.status_poll_timeout,
        ),
        cancel,
    )
    .await
    else {
        return Ok(cancelled_outcome());
    };
    execution_log.extend(outcome.log);

    let record = crate::models::CycleRecord {
        cycle_number,
        trader_id: deps.trader.id,
        started_at,
        system_prompt,
        user_prompt,
        raw_response: model_out.text,
        cot_trace: parsed.cot_trace,
        decisions_json,
        candidate_coins: limited,
        execution_log,
        success: true,
        failure_reason: None,
    };

    deps.journal
        .write_cycle(record)
        .await
        .map_err(|e| CoreError::FatalError(format!("journal write failed: {e}")))?;

    info!(cycle_number, trader = %deps.trader.name, "cycle completed");

    Ok(CycleOutcome {
        success: true,
        failure_reason: None,
        pause_reason: None,
        cancelled: false,
    })
}

fn cancelled_outcome() -> CycleOutcome {
    CycleOutcome {
        cancelled: true,
        ..Default::default()
    }
}

async fn fetch_account(deps: &CycleDeps) -> Result<AccountSnapshot, String> {
    let equity = deps
        .exchange
        .equity()
        .await
        .map_err(|e| format!("equity fetch failed: {e}"))?;
    let positions = deps
        .exchange
        .list_positions()
        .await
        .map_err(|e| format!("positions fetch failed: {e}"))?;

    Ok(AccountSnapshot {
        equity,
        available_margin: equity,
        default_leverage: deps.strategy.risk.altcoin_max_leverage,
        positions: positions.into_iter().map(|p| (p.symbol.clone(), p)).collect(),
    })
}

fn build_entry_hints(snapshot: &crate::models::MarketSnapshot) -> HashMap<String, f64> {
    let mut out = HashMap::new();
    for block in &snapshot.symbols {
        if let Some(tf) = block.timeframes.first() {
            if let Some(last) = tf.bars.last() {
                out.insert(block.symbol.clone(), last.close);
            }
        }
    }
    out
}

#[allow(clippy::too_many_arguments)]
async fn finish_failed(
    deps: &CycleDeps,
    cycle_number: u64,
    started_at: chrono::DateTime<Utc>,
    system_prompt: &str,
    user_prompt: &str,
    raw_response: &str,
    candidates: Vec<String>,
    reason: &str,
) -> Result<CycleOutcome, CoreError> {
    warn!(cycle_number, trader = %deps.trader.name, reason, "cycle failed");

    let record = crate::models::CycleRecord {
        cycle_number,
        trader_id: deps.trader.id,
        started_at,
        system_prompt: system_prompt.to_string(),
        user_prompt: user_prompt.to_string(),
        raw_response: raw_response.to_string(),
        cot_trace: String::new(),
        decisions_json: "[]".to_string(),
        candidate_coins: candidates,
        execution_log: vec![],
        success: false,
        failure_reason: Some(reason.to_string()),
    };

    deps.journal
        .write_cycle(record)
        .await
        .map_err(|e| CoreError::FatalError(format!("journal write failed: {e}")))?;

    Ok(CycleOutcome {
        success: false,
        failure_reason: Some(reason.to_string()),
        pause_reason: None,
        cancelled: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SubmitErrorKind;
    use crate::executor::{ExchangeOrderStatus, OrderRequest};
    use crate::market_data::MarketDataProvider;
    use crate::model_client::{ModelCallOutput, ModelUsage};
    use crate::models::{
        CoinSource, IndicatorConfig, KlineConfig, Position, PromptSections, RiskConfig,
    };
    use crate::universe::UniverseProvider;
    use async_trait::async_trait;
    use std::time::Duration;

    struct StubUniverse;
    #[async_trait]
    impl UniverseProvider for StubUniverse {
        async fn fetch_ranked_symbols(&self, _url: &str, _limit: Option<usize>) -> anyhow::Result<Vec<String>> {
            Ok(vec!["BTCUSDT".into()])
        }
    }

    struct StubMarket;
    #[async_trait]
    impl MarketDataProvider for StubMarket {
        async fn get_bars(
            &self,
            _symbol: &str,
            _timeframe: &str,
            count: usize,
            _timeout: Duration,
        ) -> anyhow::Result<Vec<crate::models::Bar>> {
            Ok((0..count.min(30))
                .map(|i| crate::models::Bar {
                    open_time: Utc::now(),
                    open: 100.0 + i as f64,
                    high: 101.0 + i as f64,
                    low: 99.0 + i as f64,
                    close: 100.0 + i as f64,
                    volume: 10.0,
                })
                .collect())
        }
        async fn open_interest(&self, _symbol: &str, _timeout: Duration) -> anyhow::Result<Option<f64>> {
            Ok(None)
        }
        async fn funding_rate(&self, _symbol: &str, _timeout: Duration) -> anyhow::Result<Option<f64>> {
            Ok(None)
        }
    }

    struct StubModel {
        text: String,
    }
    #[async_trait]
    impl ModelClient for StubModel {
        async fn call_with_messages(
            &self,
            _system: &str,
            _user: &str,
            _timeout: Duration,
        ) -> anyhow::Result<ModelCallOutput, crate::error::ModelErrorKind> {
            Ok(ModelCallOutput {
                text: self.text.clone(),
                usage: ModelUsage::default(),
                latency: Duration::from_millis(1),
            })
        }
    }

    struct StubExchange;
    #[async_trait]
    impl ExchangeAdapter for StubExchange {
        async fn place_order(&self, _req: OrderRequest) -> anyhow::Result<String, SubmitErrorKind> {
            Ok("ok-1".into())
        }
        async fn get_order_status(&self, _order_id: &str) -> anyhow::Result<ExchangeOrderStatus> {
            Ok(ExchangeOrderStatus {
                status: crate::models::OrderStatus::Filled,
                avg_price: Some(100.0),
                filled_qty: 1.0,
                fee: Some(0.1),
                filled_at: Some(Utc::now()),
            })
        }
        async fn list_positions(&self) -> anyhow::Result<Vec<Position>> {
            Ok(vec![])
        }
        async fn equity(&self) -> anyhow::Result<f64> {
            Ok(10_000.0)
        }
    }

    fn strategy() -> StrategyConfig {
        StrategyConfig {
            version: 1,
            coin_source: CoinSource::Static {
                symbols: vec!["BTCUSDT".into()],
            },
            coin_limit: 5,
            indicators: IndicatorConfig {
                ema_periods: vec![20],
                rsi_periods: vec![14],
                atr_periods: vec![14],
                macd_enabled: false,
                volume_stats_enabled: false,
                open_interest_enabled: false,
                funding_rate_enabled: false,
                kline: KlineConfig {
                    primary_timeframe: "5m".into(),
                    timeframes: vec!["5m".into()],
                    primary_count: 30,
                    secondary_count: 30,
                },
            },
            risk: RiskConfig {
                max_open_positions: 3,
                btc_eth_max_leverage: 10,
                altcoin_max_leverage: 5,
                btc_eth_max_position_ratio: 0.5,
                altcoin_max_position_ratio: 0.3,
                max_margin_usage: 0.8,
                min_position_size: 100.0,
                min_rr: 1.0,
                min_confidence: 50.0,
            },
            prompt: PromptSections {
                role: "r".into(),
                trading_frequency: "t".into(),
                entry_standards: "e".into(),
                decision_process: "d".into(),
            },
            custom_prompt: None,
        }
    }

    fn trader() -> Trader {
        Trader {
            id: uuid::Uuid::new_v4(),
            name: "test-trader".into(),
            owner: "owner".into(),
            exchange_account_ref: "acct".into(),
            model_ref: "model".into(),
            strategy_ref: "strategy".into(),
            cycle_interval: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn s5_full_cycle_with_hold_response_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cycle.db");
        let journal = Arc::new(
            CycleJournal::open(
                path.to_str().unwrap(),
                Duration::from_secs(1),
                Duration::from_secs(5),
                Arc::new(crate::journal::NoopRedactor),
            )
            .unwrap(),
        );

        let deps = CycleDeps {
            trader: trader(),
            strategy: strategy(),
            universe_provider: Arc::new(StubUniverse),
            market_provider: Arc::new(StubMarket),
            model_client: Arc::new(StubModel {
                text: r#"<decision>```json
[{"symbol":"BTCUSDT","action":"hold","reasoning":"nothing to do"}]
```</decision>"#
                    .to_string(),
            }),
            exchange: Arc::new(StubExchange),
            journal: journal.clone(),
            config: EngineConfig::default(),
        };

        let (_cancel_tx, mut cancel_rx) = tokio::sync::watch::channel(false);
        let outcome = run_cycle(&deps, 1, &mut cancel_rx).await.unwrap();
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn s7_unparseable_response_records_failure_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cycle.db");
        let journal = Arc::new(
            CycleJournal::open(
                path.to_str().unwrap(),
                Duration::from_secs(1),
                Duration::from_secs(5),
                Arc::new(crate::journal::NoopRedactor),
            )
            .unwrap(),
        );

        let deps = CycleDeps {
            trader: trader(),
            strategy: strategy(),
            universe_provider: Arc::new(StubUniverse),
            market_provider: Arc::new(StubMarket),
            model_client: Arc::new(StubModel {
                text: "no json anywhere in this response".to_string(),
            }),
            exchange: Arc::new(StubExchange),
            journal,
            config: EngineConfig::default(),
        };

        let (_cancel_tx, mut cancel_rx) = tokio::sync::watch::channel(false);
        let outcome = run_cycle(&deps, 1, &mut cancel_rx).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.failure_reason.unwrap().contains("parse_error"));
    }

    #[tokio::test]
    async fn s8_cancel_signalled_before_start_aborts_with_no_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cycle.db");
        let journal = Arc::new(
            CycleJournal::open(
                path.to_str().unwrap(),
                Duration::from_secs(1),
                Duration::from_secs(5),
                Arc::new(crate::journal::NoopRedactor),
            )
            .unwrap(),
        );

        let deps = CycleDeps {
            trader: trader(),
            strategy: strategy(),
            universe_provider: Arc::new(StubUniverse),
            market_provider: Arc::new(StubMarket),
            model_client: Arc::new(StubModel {
                text: r#"[{"symbol":"BTCUSDT","action":"hold","reasoning":"n/a"}]"#.to_string(),
            }),
            exchange: Arc::new(StubExchange),
            journal: journal.clone(),
            config: EngineConfig::default(),
        };

        let (cancel_tx, mut cancel_rx) = tokio::sync::watch::channel(false);
        cancel_tx.send(true).unwrap();

        let outcome = run_cycle(&deps, 1, &mut cancel_rx).await.unwrap();
        assert!(outcome.cancelled);
        assert!(!outcome.success);
        assert!(outcome.failure_reason.is_none());
    }
}
