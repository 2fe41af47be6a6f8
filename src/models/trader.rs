use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// In-process, user-visible status for a trader. No UI exists in this
/// crate; this is the field a future REST surface would read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraderStatus {
    pub is_running: bool,
    pub last_cycle_number: u64,
    pub last_cycle_success: Option<bool>,
    pub paused_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trader {
    pub id: Uuid,
    pub name: String,
    pub owner: String,
    pub exchange_account_ref: String,
    pub model_ref: String,
    pub strategy_ref: String,
    #[serde(with = "duration_secs")]
    pub cycle_interval: Duration,
}

mod duration_secs {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
