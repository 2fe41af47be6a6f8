//! Error taxonomy for the decision cycle engine.
//!
//! Every distinct failure mode gets its own variant so callers can match on
//! it; call sites that don't need to branch keep using `anyhow::Result` the
//! way the rest of the crate does.

use thiserror::Error;

/// The per-cycle / per-decision error kinds a trader loop can produce.
#[derive(Debug, Error, Clone)]
pub enum CoreError {
    #[error("invalid strategy config: {0}")]
    ConfigError(String),

    #[error("no candidate-universe source available")]
    SourceUnavailable,

    #[error("indispensable market data missing for every candidate")]
    DataIncomplete,

    #[error("model call failed: {0}")]
    ModelError(#[from] ModelErrorKind),

    #[error("response parse failed: {0}")]
    ParseError(#[from] ParseErrorKind),

    #[error("decision violated rule {rule}")]
    ValidationError { rule: String },

    #[error("order submission failed: {0}")]
    SubmitError(#[from] SubmitErrorKind),

    #[error("fatal error, trader must stop: {0}")]
    FatalError(String),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ModelErrorKind {
    #[error("transport error")]
    Transport,
    #[error("timed out")]
    Timeout,
    #[error("rate limited")]
    RateLimited,
    #[error("authentication error")]
    Auth,
    #[error("malformed response")]
    Malformed,
}

impl ModelErrorKind {
    /// Transport, Timeout, and RateLimited are retried with backoff; Auth
    /// and Malformed never are.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport | Self::Timeout | Self::RateLimited)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    #[error("no json found")]
    NoJson,
    #[error("invalid json")]
    InvalidJson,
    #[error("json failed schema validation")]
    Schema,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SubmitErrorKind {
    #[error("transient submission failure")]
    Transient,
    #[error("permanent submission failure")]
    Permanent,
}

/// Informational reshape record from the risk enforcer. Not an error channel
/// — the enforcer never fails, it only reshapes and records.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RiskReshape {
    pub rule: String,
    pub symbol: Option<String>,
    pub detail: String,
}

/// A dropped decision, tagged with the rule that rejected it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ValidationDrop {
    pub symbol: String,
    pub rule: String,
    pub detail: String,
}
