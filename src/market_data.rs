//! Market snapshot assembly — C1 (indicator half).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_lite_join::join_all_bounded;
use serde::Deserialize;
use statrs::statistics::Statistics;
use tracing::warn;

use crate::models::{Bar, IndicatorConfig, IndicatorSeries, MarketSnapshot, SymbolBlock, TimeframeBlock};

/// Raw bar data for one symbol/timeframe. Out of scope beyond this
/// contract — the real K-line provider is an external collaborator.
/// `timeout` bounds a single request; implementations must not fall back
/// to a client-wide default.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn get_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<Bar>>;
    async fn open_interest(&self, symbol: &str, timeout: Duration) -> Result<Option<f64>>;
    async fn funding_rate(&self, symbol: &str, timeout: Duration) -> Result<Option<f64>>;
}

/// Reference HTTP implementation against Binance USD-M futures' public
/// REST endpoints: GET, check status, deserialize. No API key required for
/// market data.
pub struct HttpMarketDataProvider {
    http: reqwest::Client,
    base_url: String,
}

impl HttpMarketDataProvider {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: "https://fapi.binance.com".to_string(),
        }
    }
}

#[derive(Deserialize)]
struct PremiumIndexEntry {
    #[serde(rename = "lastFundingRate")]
    last_funding_rate: String,
}

#[derive(Deserialize)]
struct OpenInterestEntry {
    #[serde(rename = "openInterest")]
    open_interest: String,
}

#[async_trait]
impl MarketDataProvider for HttpMarketDataProvider {
    async fn get_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<Bar>> {
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, timeframe, count
        );
        let rows: Vec<(i64, String, String, String, String, String, serde_json::Value, serde_json::Value, serde_json::Value, serde_json::Value, serde_json::Value, serde_json::Value)> =
            self.http.get(&url).timeout(timeout).send().await.context("klines fetch")?.json().await.context("klines json")?;

        rows.into_iter()
            .map(|r| {
                Ok(Bar {
                    open_time: Utc
                        .timestamp_millis_opt(r.0)
                        .single()
                        .context("invalid kline open_time")?,
                    open: r.1.parse().context("kline open")?,
                    high: r.2.parse().context("kline high")?,
                    low: r.3.parse().context("kline low")?,
                    close: r.4.parse().context("kline close")?,
                    volume: r.5.parse().context("kline volume")?,
                })
            })
            .collect()
    }

    async fn open_interest(&self, symbol: &str, timeout: Duration) -> Result<Option<f64>> {
        let url = format!("{}/fapi/v1/openInterest?symbol={}", self.base_url, symbol);
        let resp = self.http.get(&url).timeout(timeout).send().await.context("open interest fetch")?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        let entry: OpenInterestEntry = resp.json().await.context("open interest json")?;
        Ok(entry.open_interest.parse().ok())
    }

    async fn funding_rate(&self, symbol: &str, timeout: Duration) -> Result<Option<f64>> {
        let url = format!("{}/fapi/v1/premiumIndex?symbol={}", self.base_url, symbol);
        let resp = self.http.get(&url).timeout(timeout).send().await.context("funding rate fetch")?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        let entry: PremiumIndexEntry = resp.json().await.context("funding rate json")?;
        Ok(entry.last_funding_rate.parse().ok())
    }
}

/// Assembles the immutable `MarketSnapshot` for a cycle: concurrent
/// per-symbol fetches (bounded fan-out), then deterministic, pure indicator
/// computation over the returned bars.
pub async fn build_snapshot(
    provider: Arc<dyn MarketDataProvider>,
    symbols: &[String],
    indicators: &IndicatorConfig,
    fan_out: usize,
    fetch_timeout: Duration,
) -> Result<MarketSnapshot> {
    let tasks = symbols.iter().cloned().map(|symbol| {
        let provider = provider.clone();
        let indicators = indicators.clone();
        async move { fetch_symbol_block(provider, symbol, indicators, fetch_timeout).await }
    });

    let results = join_all_bounded(tasks, fan_out).await;

    let mut blocks = Vec::with_capacity(results.len());
    for r in results {
        match r {
            Ok(block) => blocks.push(block),
            Err(e) => warn!(error = %e, "per-symbol market fetch failed, symbol dropped"),
        }
    }

    if blocks.is_empty() && !symbols.is_empty() {
        anyhow::bail!(crate::error::CoreError::DataIncomplete);
    }

    Ok(MarketSnapshot {
        symbols: blocks,
        assembled_at: Utc::now(),
    })
}

async fn fetch_symbol_block(
    provider: Arc<dyn MarketDataProvider>,
    symbol: String,
    indicators: IndicatorConfig,
    fetch_timeout: Duration,
) -> Result<SymbolBlock> {
    let kline = &indicators.kline;
    let mut timeframes = Vec::with_capacity(kline.timeframes.len());

    for tf in &kline.timeframes {
        let requested = if *tf == kline.primary_timeframe {
            kline.primary_count
        } else {
            kline.secondary_count
        };

        let bars = provider
            .get_bars(&symbol, tf, requested, fetch_timeout)
            .await
            .with_context(|| format!("fetch bars for {symbol}/{tf}"))?;
        let insufficient = bars.len() < requested;

        let mut series = compute_indicators(&bars, &indicators);
        if indicators.open_interest_enabled {
            series.open_interest = provider
                .open_interest(&symbol, fetch_timeout)
                .await
                .unwrap_or(None);
        }
        if indicators.funding_rate_enabled {
            series.funding_rate = provider
                .funding_rate(&symbol, fetch_timeout)
                .await
                .unwrap_or(None);
        }

        timeframes.push(TimeframeBlock {
            timeframe: tf.clone(),
            bars,
            indicators: series,
            insufficient,
        });
    }

    Ok(SymbolBlock { symbol, timeframes })
}

/// Pure, deterministic indicator computation. Every series is the same
/// length as `bars` (padded with NaN-free partial windows at the front via
/// simple-average warmup) so the series aligns 1:1 with the bar index.
pub fn compute_indicators(bars: &[Bar], cfg: &IndicatorConfig) -> IndicatorSeries {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();

    let mut series = IndicatorSeries::default();

    for &period in &cfg.ema_periods {
        series.ema.insert(period, ema(&closes, period as usize));
    }

    if cfg.macd_enabled {
        series.macd = Some(macd(&closes));
    }

    for &period in &cfg.rsi_periods {
        series.rsi.insert(period, rsi(&closes, period as usize));
    }

    for &period in &cfg.atr_periods {
        series.atr.insert(period, atr(bars, period as usize));
    }

    if cfg.volume_stats_enabled && !volumes.is_empty() {
        series.volume_mean = Some(volumes.clone().mean());
        series.volume_stddev = Some(if volumes.len() > 1 {
            volumes.std_dev()
        } else {
            0.0
        });
    }

    series
}

/// Exponential moving average, seeded with a simple-average warmup over the
/// first `period` samples so the output vector is the same length as input.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    if values.is_empty() || period == 0 {
        return vec![0.0; values.len()];
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut prev = values[0];
    out.push(prev);
    for &v in &values[1..] {
        prev = alpha * v + (1.0 - alpha) * prev;
        out.push(prev);
    }
    out
}

/// MACD with the standard fixed 12/26/9 parameterization.
pub fn macd(values: &[f64]) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let fast = ema(values, 12);
    let slow = ema(values, 26);
    let macd_line: Vec<f64> = fast.iter().zip(slow.iter()).map(|(f, s)| f - s).collect();
    let signal = ema(&macd_line, 9);
    let hist: Vec<f64> = macd_line
        .iter()
        .zip(signal.iter())
        .map(|(m, s)| m - s)
        .collect();
    (macd_line, signal, hist)
}

pub fn rsi(values: &[f64], period: usize) -> Vec<f64> {
    if values.len() < 2 || period == 0 {
        return vec![50.0; values.len()];
    }
    let mut out = vec![50.0; values.len()];
    let mut gains = 0.0;
    let mut losses = 0.0;

    for i in 1..values.len() {
        let change = values[i] - values[i - 1];
        let (gain, loss) = if change > 0.0 { (change, 0.0) } else { (0.0, -change) };

        if i <= period {
            gains += gain;
            losses += loss;
            if i == period {
                let avg_gain = gains / period as f64;
                let avg_loss = losses / period as f64;
                out[i] = rsi_from_avgs(avg_gain, avg_loss);
            }
            continue;
        }

        let prev_avg_gain = gains / period as f64;
        let prev_avg_loss = losses / period as f64;
        let avg_gain = (prev_avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        let avg_loss = (prev_avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        gains = avg_gain * period as f64;
        losses = avg_loss * period as f64;
        out[i] = rsi_from_avgs(avg_gain, avg_loss);
    }

    out
}

fn rsi_from_avgs(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

pub fn atr(bars: &[Bar], period: usize) -> Vec<f64> {
    if bars.is_empty() || period == 0 {
        return vec![0.0; bars.len()];
    }
    let mut true_ranges = Vec::with_capacity(bars.len());
    for (i, b) in bars.iter().enumerate() {
        let tr = if i == 0 {
            b.high - b.low
        } else {
            let prev_close = bars[i - 1].close;
            (b.high - b.low)
                .max((b.high - prev_close).abs())
                .max((b.low - prev_close).abs())
        };
        true_ranges.push(tr);
    }
    ema(&true_ranges, period)
}

/// Tiny bounded-concurrency join helper for async I/O fan-out: at most
/// `limit` futures are in flight at once.
mod futures_lite_join {
    use std::future::Future;

    use tokio::sync::Semaphore;

    pub async fn join_all_bounded<T, F>(
        tasks: impl IntoIterator<Item = F>,
        limit: usize,
    ) -> Vec<anyhow::Result<T>>
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let sem = std::sync::Arc::new(Semaphore::new(limit.max(1)));
        let mut handles = Vec::new();
        for task in tasks {
            let sem = sem.clone();
            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore closed");
                task.await
            }));
        }
        let mut out = Vec::with_capacity(handles.len());
        for h in handles {
            match h.await {
                Ok(r) => out.push(r),
                Err(e) => out.push(Err(anyhow::anyhow!("task panicked: {e}"))),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar(close: f64) -> Bar {
        Bar {
            open_time: Utc.timestamp_opt(0, 0).unwrap(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
        }
    }

    #[test]
    fn ema_is_same_length_as_input() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let out = ema(&values, 3);
        assert_eq!(out.len(), values.len());
    }

    #[test]
    fn rsi_is_bounded_0_100() {
        let values: Vec<f64> = (0..50).map(|i| 100.0 + (i as f64).sin() * 10.0).collect();
        let out = rsi(&values, 14);
        for v in out {
            assert!((0.0..=100.0).contains(&v));
        }
    }

    #[test]
    fn atr_same_length_as_bars() {
        let bars: Vec<Bar> = (0..10).map(|i| bar(100.0 + i as f64)).collect();
        let out = atr(&bars, 5);
        assert_eq!(out.len(), bars.len());
    }

    #[test]
    fn macd_uses_fixed_12_26_9() {
        let values: Vec<f64> = (0..60).map(|i| 100.0 + i as f64 * 0.1).collect();
        let (macd_line, signal, hist) = macd(&values);
        assert_eq!(macd_line.len(), values.len());
        assert_eq!(signal.len(), values.len());
        assert_eq!(hist.len(), values.len());
    }
}
