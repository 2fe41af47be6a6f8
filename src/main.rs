//! Process entry point: loads configuration, opens the cycle journal,
//! starts one supervised loop per configured trader, and runs the
//! background order-reconciliation worker until shutdown.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use trader_core::config::{load_strategy_toml, EngineConfig};
use trader_core::executor::PaperExchangeAdapter;
use trader_core::journal::{CycleJournal, NoopRedactor};
use trader_core::market_data::MarketDataProvider;
use trader_core::model_client::{HttpModelClient, ModelClient};
use trader_core::models::Trader;
use trader_core::reconcile::ReconciliationWorker;
use trader_core::supervisor::TraderSupervisor;
use trader_core::universe::{HttpUniverseProvider, RankField, UniverseProvider};

#[derive(Parser, Debug)]
#[command(name = "trader-core", about = "Autonomous decision-cycle trading engine")]
struct Cli {
    /// Path to a TOML file listing traders to run. See `TradersManifest`.
    #[arg(long, env = "TRADERS_CONFIG", default_value = "traders.toml")]
    traders_config: String,
}

/// On-disk manifest of traders to supervise. One entry per trader; each
/// points at its own strategy TOML file (`config::load_strategy_toml`).
#[derive(Debug, Deserialize)]
struct TradersManifest {
    #[serde(default)]
    trader: Vec<TraderEntry>,
}

#[derive(Debug, Deserialize)]
struct TraderEntry {
    name: String,
    owner: String,
    exchange_account_ref: String,
    model_ref: String,
    strategy_path: String,
    #[serde(default = "default_cycle_interval_secs")]
    cycle_interval_secs: u64,
}

fn default_cycle_interval_secs() -> u64 {
    60
}

/// Resolves a model backend from a trader's `model_ref` via
/// `<MODEL_REF>_API_KEY` / `<MODEL_REF>_ENDPOINT` / `<MODEL_REF>_MODEL` env
/// vars, one set of credentials per model integration.
fn model_client_for(http: reqwest::Client, model_ref: &str) -> Result<Arc<dyn ModelClient>> {
    let prefix = model_ref.to_uppercase();
    let api_key = std::env::var(format!("{prefix}_API_KEY"))
        .with_context(|| format!("{prefix}_API_KEY not set for model_ref {model_ref}"))?;
    let endpoint = std::env::var(format!("{prefix}_ENDPOINT"))
        .unwrap_or_else(|_| "https://openrouter.ai/api/v1/chat/completions".to_string());
    let model = std::env::var(format!("{prefix}_MODEL")).unwrap_or_else(|_| model_ref.to_string());
    Ok(Arc::new(HttpModelClient::new(http, endpoint, api_key, model)))
}

fn universe_provider(http: reqwest::Client) -> Arc<dyn UniverseProvider> {
    Arc::new(HttpUniverseProvider::new(http, RankField::Rank))
}

fn market_provider(http: reqwest::Client) -> Arc<dyn MarketDataProvider> {
    Arc::new(trader_core::market_data::HttpMarketDataProvider::new(http))
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    info!("trader-core starting");

    let cli = Cli::parse();
    let engine_config = EngineConfig::from_env().context("loading engine config")?;

    let journal = Arc::new(
        CycleJournal::open(
            &engine_config.database_path,
            engine_config.journal_soft_deadline,
            engine_config.journal_hard_deadline,
            Arc::new(NoopRedactor),
        )
        .context("opening cycle journal")?,
    );
    info!(path = %engine_config.database_path, "cycle journal opened");

    let manifest = load_manifest(&cli.traders_config)?;
    if manifest.trader.is_empty() {
        warn!(path = %cli.traders_config, "no traders configured, idling on reconciliation only");
    }

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("building shared HTTP client")?;

    let exchange: Arc<dyn trader_core::executor::ExchangeAdapter> =
        Arc::new(PaperExchangeAdapter::new(10_000.0));

    let (reconcile_shutdown_tx, reconcile_shutdown_rx) = tokio::sync::watch::channel(false);
    let reconcile_handle = tokio::spawn(
        ReconciliationWorker::new(journal.clone(), exchange.clone(), engine_config.reconciliation_interval)
            .run(reconcile_shutdown_rx),
    );

    let supervisor = TraderSupervisor::new(
        engine_config.shutdown_window,
        engine_config.min_cycle_interval,
        engine_config.max_cycle_interval,
    );

    for entry in &manifest.trader {
        let strategy = load_strategy_toml(&entry.strategy_path)
            .with_context(|| format!("loading strategy for trader {}", entry.name))?;

        let trader = Trader {
            id: Uuid::new_v4(),
            name: entry.name.clone(),
            owner: entry.owner.clone(),
            exchange_account_ref: entry.exchange_account_ref.clone(),
            model_ref: entry.model_ref.clone(),
            strategy_ref: entry.strategy_path.clone(),
            cycle_interval: Duration::from_secs(entry.cycle_interval_secs),
        };

        let model_client = model_client_for(http.clone(), &entry.model_ref)?;

        let deps = trader_core::cycle::CycleDeps {
            trader: trader.clone(),
            strategy,
            universe_provider: universe_provider(http.clone()),
            market_provider: market_provider(http.clone()),
            model_client,
            exchange: exchange.clone(),
            journal: journal.clone(),
            config: engine_config.clone(),
        };

        supervisor.start(trader.id, deps);
        info!(trader = %trader.name, trader_id = %trader.id, "trader started");
    }

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received, draining traders");

    supervisor.stop_all().await;
    let _ = reconcile_shutdown_tx.send(true);
    reconcile_handle.await.context("reconciliation worker join")?;

    info!("trader-core stopped");
    Ok(())
}

fn load_manifest(path: &str) -> Result<TradersManifest> {
    if !Path::new(path).exists() {
        return Ok(TradersManifest { trader: vec![] });
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    toml::from_str(&text).with_context(|| format!("parsing {path}"))
}

fn load_env() {
    let _ = dotenv::dotenv();
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trader_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
