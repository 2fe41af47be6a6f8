use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single OHLCV bar.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bar {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Deterministic indicator series for one symbol/timeframe block. Every
/// series that is `Some` is aligned 1:1 with `bars` (same length,
/// oldest -> latest).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorSeries {
    pub ema: HashMap<u32, Vec<f64>>,
    pub macd: Option<(Vec<f64>, Vec<f64>, Vec<f64>)>, // (macd, signal, histogram)
    pub rsi: HashMap<u32, Vec<f64>>,
    pub atr: HashMap<u32, Vec<f64>>,
    pub volume_mean: Option<f64>,
    pub volume_stddev: Option<f64>,
    pub open_interest: Option<f64>,
    pub funding_rate: Option<f64>,
    pub rank: Option<u32>,
}

/// One timeframe's worth of bars + indicators for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeBlock {
    pub timeframe: String,
    pub bars: Vec<Bar>,
    pub indicators: IndicatorSeries,
    /// true if fewer bars than requested were available.
    pub insufficient: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolBlock {
    pub symbol: String,
    pub timeframes: Vec<TimeframeBlock>,
}

/// Immutable per-cycle view of market data, assembled once by C1 and never
/// mutated afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbols: Vec<SymbolBlock>,
    pub assembled_at: DateTime<Utc>,
}

impl MarketSnapshot {
    pub fn block_for(&self, symbol: &str) -> Option<&SymbolBlock> {
        self.symbols.iter().find(|b| b.symbol == symbol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: u32,
}

/// Immutable per-cycle view of account state, read-only within a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub equity: f64,
    pub available_margin: f64,
    pub default_leverage: u32,
    pub positions: HashMap<String, Position>,
}

impl AccountSnapshot {
    pub fn position_for(&self, symbol: &str, side: PositionSide) -> Option<&Position> {
        self.positions
            .get(symbol)
            .filter(|p| p.side == side)
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.len()
    }
}
