use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::decision::Action;
use super::market::PositionSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Rejected,
    Canceled,
    Unknown,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Rejected | Self::Canceled)
    }
}

/// One order placed by the executor, keyed by `(trader_id, exchange_order_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub exchange_order_id: String,
    pub trader_id: uuid::Uuid,
    pub symbol: String,
    pub side: PositionSide,
    pub action: Action,
    pub requested_qty: f64,
    pub requested_price: Option<f64>,
    pub status: OrderStatus,
    pub avg_fill_price: Option<f64>,
    pub filled_qty: f64,
    pub filled_at: Option<DateTime<Utc>>,
    pub fee: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
