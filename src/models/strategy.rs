use serde::{Deserialize, Serialize};

/// Candidate-universe descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoinSource {
    Static { symbols: Vec<String> },
    CoinPool { limit: usize, url: String },
    OiTop { url: String },
    Mixed { sources: Vec<CoinSource> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KlineConfig {
    pub primary_timeframe: String,
    pub timeframes: Vec<String>,
    pub primary_count: usize,
    /// Bar count used for non-primary timeframes.
    pub secondary_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorConfig {
    pub ema_periods: Vec<u32>,
    pub rsi_periods: Vec<u32>,
    pub atr_periods: Vec<u32>,
    pub macd_enabled: bool,
    pub volume_stats_enabled: bool,
    pub open_interest_enabled: bool,
    pub funding_rate_enabled: bool,
    pub kline: KlineConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskConfig {
    pub max_open_positions: usize,
    pub btc_eth_max_leverage: u32,
    pub altcoin_max_leverage: u32,
    pub btc_eth_max_position_ratio: f64,
    pub altcoin_max_position_ratio: f64,
    pub max_margin_usage: f64,
    pub min_position_size: f64,
    pub min_rr: f64,
    pub min_confidence: f64,
}

impl RiskConfig {
    pub fn max_leverage_for(&self, symbol: &str) -> u32 {
        if matches!(symbol, "BTCUSDT" | "ETHUSDT") {
            self.btc_eth_max_leverage
        } else {
            self.altcoin_max_leverage
        }
    }

    pub fn max_ratio_for(&self, symbol: &str) -> f64 {
        if matches!(symbol, "BTCUSDT" | "ETHUSDT") {
            self.btc_eth_max_position_ratio
        } else {
            self.altcoin_max_position_ratio
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptSections {
    pub role: String,
    pub trading_frequency: String,
    pub entry_standards: String,
    pub decision_process: String,
}

/// Immutable per-cycle snapshot of a trader's strategy. Copied into the
/// cycle at its start; mutations while a cycle is in flight are not
/// observed until the next cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub version: u32,
    pub coin_source: CoinSource,
    pub coin_limit: usize,
    pub indicators: IndicatorConfig,
    pub risk: RiskConfig,
    pub prompt: PromptSections,
    pub custom_prompt: Option<String>,
}

impl StrategyConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.risk.max_open_positions == 0 {
            return Err("max_open_positions must be > 0".into());
        }
        if self.risk.max_margin_usage <= 0.0 || self.risk.max_margin_usage > 1.0 {
            return Err("max_margin_usage must be in (0, 1]".into());
        }
        if self.indicators.kline.timeframes.is_empty() {
            return Err("at least one timeframe must be selected".into());
        }
        if !self
            .indicators
            .kline
            .timeframes
            .contains(&self.indicators.kline.primary_timeframe)
        {
            return Err("primary_timeframe must be a member of timeframes".into());
        }
        Ok(())
    }
}
