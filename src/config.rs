//! Process-wide configuration, loaded from environment and an optional TOML
//! file: env vars with sane defaults, no panics on missing optional values.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Supervisor-wide pacing and concurrency knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub database_path: String,
    pub min_cycle_interval: Duration,
    pub max_cycle_interval: Duration,
    pub shutdown_window: Duration,
    pub market_fetch_fan_out: usize,
    pub submission_fan_out: usize,
    pub universe_fetch_timeout: Duration,
    pub market_fetch_timeout: Duration,
    pub model_call_timeout: Duration,
    pub exchange_submit_timeout: Duration,
    pub status_poll_timeout: Duration,
    pub journal_soft_deadline: Duration,
    pub journal_hard_deadline: Duration,
    pub reconciliation_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: "./trader_core.db".to_string(),
            min_cycle_interval: Duration::from_secs(15),
            max_cycle_interval: Duration::from_secs(600),
            shutdown_window: Duration::from_secs(30),
            market_fetch_fan_out: 8,
            submission_fan_out: 4,
            universe_fetch_timeout: Duration::from_secs(10),
            market_fetch_timeout: Duration::from_secs(10),
            model_call_timeout: Duration::from_secs(120),
            exchange_submit_timeout: Duration::from_secs(10),
            status_poll_timeout: Duration::from_secs(3),
            journal_soft_deadline: Duration::from_secs(1),
            journal_hard_deadline: Duration::from_secs(5),
            reconciliation_interval: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("DATABASE_PATH") {
            cfg.database_path = v;
        }
        if let Ok(v) = env_secs("MIN_CYCLE_INTERVAL_SECS") {
            cfg.min_cycle_interval = v;
        }
        if let Ok(v) = env_secs("MAX_CYCLE_INTERVAL_SECS") {
            cfg.max_cycle_interval = v;
        }
        if let Ok(v) = env_secs("SHUTDOWN_WINDOW_SECS") {
            cfg.shutdown_window = v;
        }
        if let Ok(v) = std::env::var("MARKET_FETCH_FAN_OUT") {
            if let Ok(n) = v.parse() {
                cfg.market_fetch_fan_out = n;
            }
        }
        if let Ok(v) = std::env::var("SUBMISSION_FAN_OUT") {
            if let Ok(n) = v.parse() {
                cfg.submission_fan_out = n;
            }
        }

        Ok(cfg)
    }
}

fn env_secs(key: &str) -> Result<Duration, std::env::VarError> {
    std::env::var(key).map(|v| {
        v.parse::<u64>()
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(0))
    })
}

/// Loads a `StrategyConfig` from a TOML file on disk. Kept separate from
/// `EngineConfig` because strategies are per-trader, not process-wide.
pub fn load_strategy_toml(path: &str) -> Result<crate::models::StrategyConfig> {
    let text = std::fs::read_to_string(path)?;
    let cfg: crate::models::StrategyConfig = toml::from_str(&text)?;
    cfg.validate()
        .map_err(|e| anyhow::anyhow!("invalid strategy config {}: {}", path, e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_within_expected_bounds() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.min_cycle_interval, Duration::from_secs(15));
        assert_eq!(cfg.max_cycle_interval, Duration::from_secs(600));
    }
}
