use serde::{Deserialize, Serialize};

/// The action alphabet a decision may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    Hold,
    Wait,
}

impl Action {
    pub fn is_open(&self) -> bool {
        matches!(self, Action::OpenLong | Action::OpenShort)
    }

    pub fn is_close(&self) -> bool {
        matches!(self, Action::CloseLong | Action::CloseShort)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open_long" => Some(Self::OpenLong),
            "open_short" => Some(Self::OpenShort),
            "close_long" => Some(Self::CloseLong),
            "close_short" => Some(Self::CloseShort),
            "hold" => Some(Self::Hold),
            "wait" => Some(Self::Wait),
            _ => None,
        }
    }
}

/// A single model-proposed action on a symbol, as recovered by the parser
/// from the model's decision JSON envelope. Numeric fields are optional at
/// this stage — the validator (C5) is what enforces which fields an action
/// requires, per the design note that a permissive parse enables better
/// error reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub symbol: String,
    pub action: Action,
    #[serde(default)]
    pub leverage: Option<u32>,
    #[serde(default)]
    pub position_size_usd: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub risk_usd: Option<f64>,
    #[serde(default)]
    pub reasoning: String,
}

impl Decision {
    /// Implied risk/reward ratio for an open-action, or `None` if the
    /// required fields aren't present.
    pub fn risk_reward(&self, entry_hint: f64) -> Option<f64> {
        let sl = self.stop_loss?;
        let tp = self.take_profit?;
        match self.action {
            Action::OpenLong => {
                let risk = entry_hint - sl;
                let reward = tp - entry_hint;
                (risk > 0.0).then(|| reward / risk)
            }
            Action::OpenShort => {
                let risk = sl - entry_hint;
                let reward = entry_hint - tp;
                (risk > 0.0).then(|| reward / risk)
            }
            _ => None,
        }
    }
}
