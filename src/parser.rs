//! Response parser — C4.
//!
//! Adversarial parsing of a free-text model response into a chain-of-thought
//! trace and a list of decision JSON objects. Total and re-entrant: never
//! panics, always returns `Result`.

use serde::{Deserialize, Serialize};

use crate::error::ParseErrorKind;
use crate::models::{Action, Decision};

#[derive(Debug, Clone)]
pub struct ParsedResponse {
    pub cot_trace: String,
    pub decisions: Vec<RawDecision>,
}

/// A decision as recovered from JSON, before C5 validation: missing
/// numeric fields are `None`, never defaulted to zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDecision {
    pub symbol: String,
    pub action: String,
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
    pub reasoning: Option<String>,
}

impl RawDecision {
    pub fn into_decision(self) -> Result<Decision, ParseErrorKind> {
        let action = Action::parse(&self.action).ok_or(ParseErrorKind::Schema)?;
        Ok(Decision {
            symbol: self.symbol,
            action,
            leverage: self.leverage,
            position_size_usd: self.position_size_usd,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
            confidence: self.confidence,
            risk_usd: self.risk_usd,
            reasoning: self.reasoning.unwrap_or_default(),
        })
    }
}

/// Strips invisible code points and folds full-width punctuation to ASCII.
/// Idempotent: `normalize(normalize(s)) == normalize(s)`.
pub fn normalize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if is_invisible(c) {
            continue;
        }
        out.push(fold_fullwidth(c));
    }
    out
}

fn is_invisible(c: char) -> bool {
    matches!(
        c,
        '\u{200B}'..='\u{200F}' // zero-width space/joiners, bidi marks
        | '\u{FEFF}'            // BOM
        | '\u{202A}'..='\u{202E}' // bidi embedding/override
        | '\u{2060}'
    )
}

fn fold_fullwidth(c: char) -> char {
    match c {
        '\u{201C}' | '\u{201D}' | '\u{FF02}' => '"', // “ ” full-width "
        '\u{2018}' | '\u{2019}' => '\'',
        '\u{FF1A}' => ':',  // ：
        '\u{FF0C}' => ',',  // ，
        '\u{FF3B}' => '[',  // ［
        '\u{FF3D}' => ']',  // ］
        '\u{FF5B}' => '{',  // ｛
        '\u{FF5D}' => '}',  // ｝
        other => other,
    }
}

/// Top-level entry point: normalize, recover CoT, recover and validate the
/// decision JSON array. Never panics; every branch returns `Result`.
pub fn parse_response(raw: &str) -> Result<ParsedResponse, ParseErrorKind> {
    let normalized = normalize(raw);
    let cot_trace = extract_cot(&normalized);
    let json_text = extract_decision_json(&normalized).ok_or(ParseErrorKind::NoJson)?;
    let decisions = parse_decision_array(&json_text)?;

    Ok(ParsedResponse {
        cot_trace,
        decisions,
    })
}

/// First match wins.
fn extract_cot(text: &str) -> String {
    if let Some(inner) = between(text, "<reasoning>", "</reasoning>") {
        return inner.trim().to_string();
    }
    if let Some(idx) = text.find("<decision>") {
        return text[..idx].trim().to_string();
    }
    if let Some(idx) = find_json_array_start(text) {
        return text[..idx].trim().to_string();
    }
    text.trim().to_string()
}

/// First match wins.
fn extract_decision_json(text: &str) -> Option<String> {
    if let Some(envelope) = between(text, "<decision>", "</decision>") {
        if let Some(block) = extract_fenced_json(envelope) {
            return Some(block);
        }
        if let Some(arr) = find_balanced_json_array(envelope) {
            return Some(arr);
        }
    }

    if let Some(block) = extract_fenced_json(text) {
        return Some(block);
    }

    find_balanced_json_array(text)
}

fn extract_fenced_json(text: &str) -> Option<String> {
    let marker = "```json";
    let start = text.find(marker)? + marker.len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim().to_string())
}

fn find_json_array_start(text: &str) -> Option<usize> {
    text.find('[')
}

/// Scans for the first balanced `[...]` span, tracking string/escape state
/// so brackets inside string literals don't confuse the scan.
fn find_balanced_json_array(text: &str) -> Option<String> {
    let bytes: Vec<char> = text.chars().collect();
    let start = bytes.iter().position(|&c| c == '[')?;

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for i in start..bytes.len() {
        let c = bytes[i];
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    let s: String = bytes[start..=i].iter().collect();
                    return Some(s);
                }
            }
            _ => {}
        }
    }
    None
}

fn between<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = text.find(open)? + open.len();
    let rest = &text[start..];
    let end = rest.find(close)?;
    Some(&rest[..end])
}

fn parse_decision_array(json_text: &str) -> Result<Vec<RawDecision>, ParseErrorKind> {
    let value: serde_json::Value =
        serde_json::from_str(json_text).map_err(|_| ParseErrorKind::InvalidJson)?;
    let arr = value.as_array().ok_or(ParseErrorKind::Schema)?;

    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        if !item.is_object() {
            return Err(ParseErrorKind::Schema);
        }
        let obj = item.as_object().unwrap();
        if !obj.contains_key("symbol") || !obj.contains_key("action") {
            return Err(ParseErrorKind::Schema);
        }
        let decision: RawDecision =
            serde_json::from_value(item.clone()).map_err(|_| ParseErrorKind::Schema)?;
        out.push(decision);
    }
    Ok(out)
}
