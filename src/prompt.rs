//! Prompt composition — C2.
//!
//! Pure function over `(strategy, snapshot, account)`: identical inputs
//! must yield byte-identical output so the journal can be replayed for
//! audit. No randomness, no wall-clock reads beyond the caller-supplied
//! `now`.

use chrono::{DateTime, Utc};
use std::fmt::Write as _;

use crate::models::{AccountSnapshot, IndicatorSeries, MarketSnapshot, StrategyConfig};

/// The mandatory output contract appended to every system prompt, verbatim,
/// even when `custom_prompt` replaces everything else.
const OUTPUT_CONTRACT: &str = r#"
## Output contract
You must respond with your reasoning followed by a decision envelope in
exactly this form:

<decision>
```json
[ { "symbol": "BTCUSDT", "action": "open_long", "leverage": 5,
    "position_size_usd": 500.0, "stop_loss": 62000.0, "take_profit": 68000.0,
    "confidence": 72, "risk_usd": 25.0, "reasoning": "..." } ]
```
</decision>

Allowed actions: open_long, open_short, close_long, close_short, hold, wait.
Open actions require leverage, position_size_usd, stop_loss, take_profit,
and confidence (0-100). Close actions require only a matching open
position. hold/wait require no numeric fields beyond reasoning.
"#;

pub fn compose_system_prompt(strategy: &StrategyConfig) -> String {
    let mut out = String::new();
    match &strategy.custom_prompt {
        Some(custom) => {
            out.push_str(custom);
        }
        None => {
            let _ = writeln!(out, "## Role\n{}\n", strategy.prompt.role);
            let _ = writeln!(
                out,
                "## Trading frequency\n{}\n",
                strategy.prompt.trading_frequency
            );
            let _ = writeln!(
                out,
                "## Entry standards\n{}\n",
                strategy.prompt.entry_standards
            );
            let _ = writeln!(
                out,
                "## Decision process\n{}\n",
                strategy.prompt.decision_process
            );
        }
    }
    out.push_str(OUTPUT_CONTRACT);
    out
}

pub fn compose_user_prompt(
    strategy: &StrategyConfig,
    snapshot: &MarketSnapshot,
    account: &AccountSnapshot,
    now: DateTime<Utc>,
) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "Current UTC time: {}", now.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(out);

    let _ = writeln!(out, "=== ACCOUNT ===");
    let _ = writeln!(out, "Equity: {:.2}", account.equity);
    let _ = writeln!(out, "Available margin: {:.2}", account.available_margin);
    let _ = writeln!(out, "Default leverage: {}x", account.default_leverage);
    let _ = writeln!(out);

    let _ = writeln!(out, "=== POSITIONS ===");
    if account.positions.is_empty() {
        let _ = writeln!(out, "(none)");
    } else {
        let mut symbols: Vec<&String> = account.positions.keys().collect();
        symbols.sort();
        for sym in symbols {
            let p = &account.positions[sym];
            let _ = writeln!(
                out,
                "{} {:?} size={:.6} entry={:.4} pnl={:.2} leverage={}x",
                sym, p.side, p.size, p.entry_price, p.unrealized_pnl, p.leverage
            );
        }
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "=== CANDIDATES ===");
    for block in &snapshot.symbols {
        let _ = writeln!(out, "--- {} ---", block.symbol);
        for tf in &block.timeframes {
            let _ = writeln!(
                out,
                "=== {} TIMEFRAME (oldest -> latest) ===",
                tf.timeframe.to_uppercase()
            );
            if tf.insufficient {
                let _ = writeln!(out, "(insufficient history: {} bars)", tf.bars.len());
            }
            write_series(&mut out, "Prices", &tf.bars.iter().map(|b| b.close).collect::<Vec<_>>());
            write_series(&mut out, "Volumes", &tf.bars.iter().map(|b| b.volume).collect::<Vec<_>>());
            write_indicator_block(&mut out, &strategy_indicator_labels(strategy), &tf.indicators);
        }
    }

    out
}

struct IndicatorLabels {
    ema_enabled: bool,
    macd_enabled: bool,
    rsi_enabled: bool,
    atr_enabled: bool,
}

fn strategy_indicator_labels(strategy: &StrategyConfig) -> IndicatorLabels {
    IndicatorLabels {
        ema_enabled: !strategy.indicators.ema_periods.is_empty(),
        macd_enabled: strategy.indicators.macd_enabled,
        rsi_enabled: !strategy.indicators.rsi_periods.is_empty(),
        atr_enabled: !strategy.indicators.atr_periods.is_empty(),
    }
}

fn write_indicator_block(out: &mut String, labels: &IndicatorLabels, series: &IndicatorSeries) {
    if labels.ema_enabled {
        let mut periods: Vec<&u32> = series.ema.keys().collect();
        periods.sort();
        for p in periods {
            write_series(out, &format!("EMA{}", p), &series.ema[p]);
        }
    }
    if labels.macd_enabled {
        if let Some((macd, signal, hist)) = &series.macd {
            write_series(out, "MACD", macd);
            write_series(out, "MACD_SIGNAL", signal);
            write_series(out, "MACD_HIST", hist);
        }
    }
    if labels.rsi_enabled {
        let mut periods: Vec<&u32> = series.rsi.keys().collect();
        periods.sort();
        for p in periods {
            write_series(out, &format!("RSI{}", p), &series.rsi[p]);
        }
    }
    if labels.atr_enabled {
        let mut periods: Vec<&u32> = series.atr.keys().collect();
        periods.sort();
        for p in periods {
            write_series(out, &format!("ATR{}", p), &series.atr[p]);
        }
    }
    if let Some(oi) = series.open_interest {
        let _ = writeln!(out, "OpenInterest: {:.4}", oi);
    }
    if let Some(fr) = series.funding_rate {
        let _ = writeln!(out, "FundingRate: {:.6}", fr);
    }
}

fn write_series(out: &mut String, label: &str, values: &[f64]) {
    let joined: Vec<String> = values.iter().map(|v| format!("{:.4}", v)).collect();
    let _ = writeln!(out, "{}: [{}]", label, joined.join(", "));
}
