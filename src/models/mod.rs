//! Core data model: the types every component passes between each other.

mod cycle;
mod decision;
mod market;
mod order;
mod strategy;
mod trader;

pub use cycle::CycleRecord;
pub use decision::{Action, Decision};
pub use market::{AccountSnapshot, Bar, IndicatorSeries, MarketSnapshot, Position, PositionSide, SymbolBlock};
pub use order::{OrderRecord, OrderStatus};
pub use strategy::{
    CoinSource, IndicatorConfig, KlineConfig, PromptSections, RiskConfig, StrategyConfig,
};
pub use trader::{Trader, TraderStatus};
