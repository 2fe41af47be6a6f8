use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Append-only record of one full decision cycle. Exactly one is written per
/// cycle that begins, success or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle_number: u64,
    pub trader_id: uuid::Uuid,
    pub started_at: DateTime<Utc>,
    pub system_prompt: String,
    pub user_prompt: String,
    pub raw_response: String,
    pub cot_trace: String,
    pub decisions_json: String,
    pub candidate_coins: Vec<String>,
    pub execution_log: Vec<String>,
    pub success: bool,
    pub failure_reason: Option<String>,
}

/// Per-field byte cap applied before a field is persisted: large fields are
/// truncated with a marker rather than dropped.
pub const JOURNAL_FIELD_BYTE_CAP: usize = 256 * 1024;

pub fn truncate_field(s: &str) -> String {
    if s.len() <= JOURNAL_FIELD_BYTE_CAP {
        return s.to_string();
    }
    let mut end = JOURNAL_FIELD_BYTE_CAP;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[truncated, {} bytes total]", &s[..end], s.len())
}
