//! Candidate universe resolution — C1 (coin-source half).

use std::collections::HashSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::models::{CoinSource, Position};

/// A universe source: AI500-style rank feed, OI-rank feed, or anything else
/// that can produce an ordered symbol list. Out of scope beyond this
/// contract — concrete HTTP wire formats belong to the provider, not the
/// core.
#[async_trait]
pub trait UniverseProvider: Send + Sync {
    async fn fetch_ranked_symbols(&self, url: &str, limit: Option<usize>) -> Result<Vec<String>>;
}

/// Reference HTTP implementation. Both AI500 (`rank`) and OI-top
/// (`oi_rank`) feeds are GET-JSON-array-of-objects, differing only in the
/// rank field name, so one client serves both.
pub struct HttpUniverseProvider {
    http: reqwest::Client,
    rank_field: RankField,
}

#[derive(Debug, Clone, Copy)]
pub enum RankField {
    Rank,
    OiRank,
}

#[derive(Debug, Deserialize)]
struct RankedEntry {
    symbol: String,
    #[serde(default)]
    rank: Option<i64>,
    #[serde(default)]
    oi_rank: Option<i64>,
}

impl HttpUniverseProvider {
    pub fn new(http: reqwest::Client, rank_field: RankField) -> Self {
        Self { http, rank_field }
    }
}

#[async_trait]
impl UniverseProvider for HttpUniverseProvider {
    async fn fetch_ranked_symbols(&self, url: &str, limit: Option<usize>) -> Result<Vec<String>> {
        let resp = self
            .http
            .get(url)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .context("universe fetch")?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("universe provider {} returned {}", url, status);
        }
        let mut entries: Vec<RankedEntry> = resp.json().await.context("universe json parse")?;
        entries.sort_by_key(|e| match self.rank_field {
            RankField::Rank => e.rank.unwrap_or(i64::MAX),
            RankField::OiRank => e.oi_rank.unwrap_or(i64::MAX),
        });
        let mut symbols: Vec<String> = entries.into_iter().map(|e| e.symbol).collect();
        if let Some(limit) = limit {
            symbols.truncate(limit);
        }
        Ok(symbols)
    }
}

/// Resolves a `CoinSource` tree into an ordered, de-duplicated candidate
/// list, then appends any open-position symbols missing from it so closes
/// remain reachable.
pub async fn resolve_candidates(
    source: &CoinSource,
    provider: &dyn UniverseProvider,
    open_positions: &[Position],
) -> Result<Vec<String>> {
    let mut ordered = resolve_source(source, provider).await?;

    let mut seen: HashSet<String> = ordered.iter().cloned().collect();
    for pos in open_positions {
        if seen.insert(pos.symbol.clone()) {
            ordered.push(pos.symbol.clone());
        }
    }

    Ok(ordered)
}

/// Depth-first resolution that never fails unless every enabled leaf source
/// errors. Returns de-duplicated-preserving-first-occurrence order.
fn resolve_source<'a>(
    source: &'a CoinSource,
    provider: &'a dyn UniverseProvider,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<String>>> + Send + 'a>> {
    Box::pin(async move {
        match source {
            CoinSource::Static { symbols } => Ok(dedup(symbols.clone())),
            CoinSource::CoinPool { limit, url } => provider
                .fetch_ranked_symbols(url, Some(*limit))
                .await
                .map(dedup),
            CoinSource::OiTop { url } => provider.fetch_ranked_symbols(url, None).await.map(dedup),
            CoinSource::Mixed { sources } => {
                let mut out = Vec::new();
                let mut seen = HashSet::new();
                let mut any_ok = false;
                let mut last_err = None;
                for s in sources {
                    match resolve_source(s, provider).await {
                        Ok(symbols) => {
                            any_ok = true;
                            for sym in symbols {
                                if seen.insert(sym.clone()) {
                                    out.push(sym);
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "universe source degraded, continuing");
                            last_err = Some(e);
                        }
                    }
                }
                if !any_ok {
                    return Err(last_err.unwrap_or_else(|| {
                        anyhow::anyhow!(crate::error::CoreError::SourceUnavailable)
                    }));
                }
                debug!(count = out.len(), "mixed universe resolved");
                Ok(out)
            }
        }
    })
}

fn dedup(symbols: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    symbols
        .into_iter()
        .filter(|s| seen.insert(s.clone()))
        .collect()
}
