//! Risk enforcer — C6.
//!
//! A total function: it never fails, only reshapes or drops decisions, and
//! records every reshape. Applied after the decisions are sorted for
//! execution (the sort itself lives in `executor`, since the ordering
//! serves both risk accounting here and submission order there).

use crate::error::RiskReshape;
use crate::models::{Action, AccountSnapshot, Decision, RiskConfig};

pub struct EnforcementOutcome {
    pub decisions: Vec<Decision>,
    pub reshapes: Vec<RiskReshape>,
}

/// Applies the four reshape rules in order. `decisions` is expected to
/// already be the C5-validated survivor set.
pub fn enforce(decisions: Vec<Decision>, risk: &RiskConfig, account: &AccountSnapshot) -> EnforcementOutcome {
    let mut reshapes = Vec::new();

    let decisions = cap_max_open_positions(decisions, risk, account, &mut reshapes);
    let decisions = cap_position_value(decisions, risk, account, &mut reshapes);
    let decisions = cap_available_margin(decisions, risk, account, &mut reshapes);
    let decisions = downgrade_stale_closes(decisions, account, &mut reshapes);

    EnforcementOutcome {
        decisions,
        reshapes,
    }
}

/// Rule 1: count `current_positions + pending_opens`; if above
/// `max_positions`, drop surplus open-actions in reverse confidence order.
fn cap_max_open_positions(
    decisions: Vec<Decision>,
    risk: &RiskConfig,
    account: &AccountSnapshot,
    reshapes: &mut Vec<RiskReshape>,
) -> Vec<Decision> {
    let current = account.open_position_count();
    let mut opens: Vec<(usize, Decision)> = Vec::new();
    let mut others: Vec<Decision> = Vec::new();

    for (idx, d) in decisions.into_iter().enumerate() {
        if d.action.is_open() {
            opens.push((idx, d));
        } else {
            others.push(d);
        }
    }

    let budget = risk.max_open_positions.saturating_sub(current);

    if opens.len() > budget {
        // Highest confidence first so we keep the best, drop from the tail.
        opens.sort_by(|a, b| {
            b.1.confidence
                .unwrap_or(0.0)
                .partial_cmp(&a.1.confidence.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let dropped = opens.split_off(budget);
        for (_, d) in dropped {
            reshapes.push(RiskReshape {
                rule: "max_open_positions".into(),
                symbol: Some(d.symbol.clone()),
                detail: format!(
                    "dropped open-action for {} (budget {}, current {})",
                    d.symbol, risk.max_open_positions, current
                ),
            });
        }
    }

    opens.sort_by_key(|(idx, _)| *idx);
    let mut merged: Vec<Decision> = opens.into_iter().map(|(_, d)| d).collect();
    merged.extend(others);
    merged
}

/// Rule 2: scale `position_size_usd` down to the per-class ratio cap; drop
/// if it falls below `min_position_size` after scaling.
fn cap_position_value(
    decisions: Vec<Decision>,
    risk: &RiskConfig,
    account: &AccountSnapshot,
    reshapes: &mut Vec<RiskReshape>,
) -> Vec<Decision> {
    decisions
        .into_iter()
        .filter_map(|mut d| {
            if !d.action.is_open() {
                return Some(d);
            }
            let Some(size) = d.position_size_usd else {
                return Some(d);
            };
            if account.equity <= 0.0 {
                return Some(d);
            }
            let ratio = size / account.equity;
            let cap = risk.max_ratio_for(&d.symbol);
            if ratio <= cap {
                return Some(d);
            }

            let scaled = cap * account.equity;
            if scaled < risk.min_position_size {
                reshapes.push(RiskReshape {
                    rule: "position_value_ratio".into(),
                    symbol: Some(d.symbol.clone()),
                    detail: format!(
                        "{} scaled size {:.2} below minimum {:.2}, dropped",
                        d.symbol, scaled, risk.min_position_size
                    ),
                });
                return None;
            }

            reshapes.push(RiskReshape {
                rule: "position_value_ratio".into(),
                symbol: Some(d.symbol.clone()),
                detail: format!("{} scaled {:.2} -> {:.2}", d.symbol, size, scaled),
            });
            d.position_size_usd = Some(scaled);
            Some(d)
        })
        .collect()
}

/// Rule 3: required margin = sum(size/leverage) for pending opens +
/// existing margin usage; if it exceeds `equity * max_margin_usage`, shrink
/// pending opens proportionally, then re-check `min_position_size`.
fn cap_available_margin(
    decisions: Vec<Decision>,
    risk: &RiskConfig,
    account: &AccountSnapshot,
    reshapes: &mut Vec<RiskReshape>,
) -> Vec<Decision> {
    let existing_margin: f64 = account
        .positions
        .values()
        .map(|p| p.size / p.leverage.max(1) as f64)
        .sum();

    let pending_margin: f64 = decisions
        .iter()
        .filter(|d| d.action.is_open())
        .filter_map(|d| {
            let size = d.position_size_usd?;
            let lev = d.leverage.unwrap_or(1).max(1) as f64;
            Some(size / lev)
        })
        .sum();

    let budget = account.equity * risk.max_margin_usage;
    let available_for_pending = budget - existing_margin;

    if pending_margin <= available_for_pending || pending_margin <= 0.0 {
        return decisions;
    }

    let scale = (available_for_pending.max(0.0) / pending_margin).clamp(0.0, 1.0);

    decisions
        .into_iter()
        .filter_map(|mut d| {
            if !d.action.is_open() {
                return Some(d);
            }
            let Some(size) = d.position_size_usd else {
                return Some(d);
            };
            let shrunk = size * scale;
            if shrunk < risk.min_position_size {
                reshapes.push(RiskReshape {
                    rule: "available_margin".into(),
                    symbol: Some(d.symbol.clone()),
                    detail: format!(
                        "{} shrunk size {:.2} below minimum after margin cap, dropped",
                        d.symbol, shrunk
                    ),
                });
                return None;
            }
            reshapes.push(RiskReshape {
                rule: "available_margin".into(),
                symbol: Some(d.symbol.clone()),
                detail: format!("{} shrunk {:.2} -> {:.2} (margin cap)", d.symbol, size, shrunk),
            });
            d.position_size_usd = Some(shrunk);
            Some(d)
        })
        .collect()
}

/// Rule 4: if the account no longer holds a matching position (race with
/// an out-of-band liquidation), downgrade close-actions to `wait`.
fn downgrade_stale_closes(
    decisions: Vec<Decision>,
    account: &AccountSnapshot,
    reshapes: &mut Vec<RiskReshape>,
) -> Vec<Decision> {
    decisions
        .into_iter()
        .map(|mut d| {
            let side = match d.action {
                Action::CloseLong => crate::models::PositionSide::Long,
                Action::CloseShort => crate::models::PositionSide::Short,
                _ => return d,
            };
            if account.position_for(&d.symbol, side).is_none() {
                reshapes.push(RiskReshape {
                    rule: "close_only_consistency".into(),
                    symbol: Some(d.symbol.clone()),
                    detail: format!("{} has no matching position, downgraded to wait", d.symbol),
                });
                d.action = Action::Wait;
            }
            d
        })
        .collect()
}
