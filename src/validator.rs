//! Decision validator — C5.
//!
//! Per-decision rules applied in order; first failure yields a typed error
//! naming the violated rule. Invalid decisions are dropped, not aborted —
//! the cycle continues with the surviving subset.

use std::collections::HashMap;

use crate::error::ValidationDrop;
use crate::models::{Action, AccountSnapshot, Decision, PositionSide, RiskConfig};

/// Validates one decision against the configured risk rules, returning the
/// violated rule name on the first failure.
pub fn validate_decision(
    decision: &Decision,
    risk: &RiskConfig,
    account: &AccountSnapshot,
    entry_hint: Option<f64>,
) -> Result<(), String> {
    match decision.action {
        Action::OpenLong | Action::OpenShort => validate_open(decision, risk, entry_hint),
        Action::CloseLong => validate_close(decision, account, PositionSide::Long),
        Action::CloseShort => validate_close(decision, account, PositionSide::Short),
        Action::Hold | Action::Wait => Ok(()),
    }
}

fn validate_open(decision: &Decision, risk: &RiskConfig, entry_hint: Option<f64>) -> Result<(), String> {
    let leverage = decision.leverage.ok_or("missing_leverage")?;
    if leverage == 0 {
        return Err("leverage_must_be_positive".into());
    }
    let cap = risk.max_leverage_for(&decision.symbol);
    if leverage > cap {
        return Err("leverage_exceeds_class_cap".into());
    }

    let size = decision.position_size_usd.ok_or("missing_position_size")?;
    if size < risk.min_position_size {
        return Err("position_size_below_minimum".into());
    }

    let stop_loss = decision.stop_loss.ok_or("missing_stop_loss")?;
    let take_profit = decision.take_profit.ok_or("missing_take_profit")?;
    if stop_loss <= 0.0 || take_profit <= 0.0 {
        return Err("stop_or_target_not_positive".into());
    }

    if let Some(entry) = entry_hint {
        let ordered_ok = match decision.action {
            Action::OpenLong => stop_loss < entry && entry < take_profit,
            Action::OpenShort => take_profit < entry && entry < stop_loss,
            _ => unreachable!(),
        };
        if !ordered_ok {
            return Err("stop_target_not_ordered_for_side".into());
        }
    }

    let confidence = decision.confidence.ok_or("missing_confidence")?;
    if !(0.0..=100.0).contains(&confidence) {
        return Err("confidence_out_of_range".into());
    }
    if confidence < risk.min_confidence {
        return Err("confidence_below_minimum".into());
    }

    if let Some(entry) = entry_hint {
        let rr = decision.risk_reward(entry).ok_or("risk_reward_unavailable")?;
        if rr < risk.min_rr {
            return Err("risk_reward_below_minimum".into());
        }
    }

    if let Some(risk_usd) = decision.risk_usd {
        let entry = entry_hint.unwrap_or(stop_loss).max(f64::EPSILON);
        let stop_distance = (entry - stop_loss).abs();
        let implied_risk = stop_distance / entry * size;
        let tolerance = implied_risk.max(1.0) * 0.5;
        if (risk_usd - implied_risk).abs() > tolerance {
            return Err("risk_usd_inconsistent_with_stop_distance".into());
        }
    }

    Ok(())
}

fn validate_close(decision: &Decision, account: &AccountSnapshot, side: PositionSide) -> Result<(), String> {
    match account.position_for(&decision.symbol, side) {
        Some(_) => Ok(()),
        None => Err("no_matching_position_to_close".into()),
    }
}

/// Runs every decision through `validate_decision`, splitting survivors
/// from drops. Total — never aborts the batch.
pub fn validate_all(
    decisions: Vec<Decision>,
    risk: &RiskConfig,
    account: &AccountSnapshot,
    entry_hints: &HashMap<String, f64>,
) -> (Vec<Decision>, Vec<ValidationDrop>) {
    let mut survivors = Vec::with_capacity(decisions.len());
    let mut drops = Vec::new();

    for decision in decisions {
        let hint = entry_hints.get(&decision.symbol).copied();
        match validate_decision(&decision, risk, account, hint) {
            Ok(()) => survivors.push(decision),
            Err(rule) => drops.push(ValidationDrop {
                symbol: decision.symbol.clone(),
                rule,
                detail: format!("dropped decision for {}", decision.symbol),
            }),
        }
    }

    (survivors, drops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn risk() -> RiskConfig {
        RiskConfig {
            max_open_positions: 3,
            btc_eth_max_leverage: 10,
            altcoin_max_leverage: 5,
            btc_eth_max_position_ratio: 0.5,
            altcoin_max_position_ratio: 0.3,
            max_margin_usage: 0.8,
            min_position_size: 100.0,
            min_rr: 1.5,
            min_confidence: 60.0,
        }
    }

    fn account() -> AccountSnapshot {
        AccountSnapshot {
            equity: 10_000.0,
            available_margin: 9_000.0,
            default_leverage: 5,
            positions: Map::new(),
        }
    }

    fn open_long(overrides: impl FnOnce(&mut Decision)) -> Decision {
        let mut d = Decision {
            symbol: "BTCUSDT".into(),
            action: Action::OpenLong,
            leverage: Some(5),
            position_size_usd: Some(3000.0),
            stop_loss: Some(62000.0),
            take_profit: Some(68000.0),
            confidence: Some(70.0),
            risk_usd: None,
            reasoning: "test".into(),
        };
        overrides(&mut d);
        d
    }

    #[test]
    fn s1_valid_open_long_passes() {
        let d = open_long(|_| {});
        assert!(validate_decision(&d, &risk(), &account(), Some(65000.0)).is_ok());
    }

    #[test]
    fn leverage_exceeding_class_cap_is_rejected() {
        let d = open_long(|d| d.leverage = Some(20));
        let err = validate_decision(&d, &risk(), &account(), Some(65000.0)).unwrap_err();
        assert_eq!(err, "leverage_exceeds_class_cap");
    }

    #[test]
    fn altcoin_uses_altcoin_cap() {
        let d = open_long(|d| {
            d.symbol = "DOGEUSDT".into();
            d.leverage = Some(8);
        });
        let err = validate_decision(&d, &risk(), &account(), Some(0.1)).unwrap_err();
        assert_eq!(err, "leverage_exceeds_class_cap");
    }

    #[test]
    fn low_confidence_is_rejected() {
        let d = open_long(|d| d.confidence = Some(40.0));
        let err = validate_decision(&d, &risk(), &account(), Some(65000.0)).unwrap_err();
        assert_eq!(err, "confidence_below_minimum");
    }

    #[test]
    fn bad_stop_target_order_for_long_is_rejected() {
        let d = open_long(|d| {
            d.stop_loss = Some(70000.0);
            d.take_profit = Some(60000.0);
        });
        let err = validate_decision(&d, &risk(), &account(), Some(65000.0)).unwrap_err();
        assert_eq!(err, "stop_target_not_ordered_for_side");
    }

    #[test]
    fn close_without_matching_position_is_rejected() {
        let d = Decision {
            symbol: "BTCUSDT".into(),
            action: Action::CloseLong,
            leverage: None,
            position_size_usd: None,
            stop_loss: None,
            take_profit: None,
            confidence: None,
            risk_usd: None,
            reasoning: "exit".into(),
        };
        let err = validate_decision(&d, &risk(), &account(), None).unwrap_err();
        assert_eq!(err, "no_matching_position_to_close");
    }

    #[test]
    fn hold_and_wait_never_need_numeric_fields() {
        let hold = Decision {
            symbol: "BTCUSDT".into(),
            action: Action::Hold,
            leverage: None,
            position_size_usd: None,
            stop_loss: None,
            take_profit: None,
            confidence: None,
            risk_usd: None,
            reasoning: "nothing to do".into(),
        };
        assert!(validate_decision(&hold, &risk(), &account(), None).is_ok());
    }

    #[test]
    fn rr_below_minimum_is_rejected() {
        let d = open_long(|d| {
            d.stop_loss = Some(64000.0);
            d.take_profit = Some(65500.0);
        });
        let err = validate_decision(&d, &risk(), &account(), Some(65000.0)).unwrap_err();
        assert_eq!(err, "risk_reward_below_minimum");
    }

    #[test]
    fn validate_all_drops_invalid_keeps_valid() {
        let good = open_long(|_| {});
        let bad = open_long(|d| d.confidence = Some(1.0));
        let mut hints = Map::new();
        hints.insert("BTCUSDT".to_string(), 65000.0);
        let (survivors, drops) = validate_all(vec![good, bad], &risk(), &account(), &hints);
        assert_eq!(survivors.len(), 1);
        assert_eq!(drops.len(), 1);
        assert_eq!(drops[0].rule, "confidence_below_minimum");
    }
}
