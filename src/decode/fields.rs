//! Field-name reconciliation and scalar parsing.
//!
//! Producers disagree on naming (`pool_id` vs `poolId`, `bettor_address` vs
//! `bettor`). [`canonicalize`] maps every key onto one camelCase name so the
//! rest of the decoder only ever looks up a single spelling.

use serde_json::{Map, Value};

/// Semantic aliases that a plain snake→camel conversion would not catch.
const ALIASES: &[(&str, &str)] = &[
    ("bettorAddress", "bettor"),
    ("userAddress", "user"),
    ("playerAddress", "player"),
    ("creatorAddress", "creator"),
    ("providerAddress", "provider"),
    ("lpAddress", "provider"),
    ("correctPredictions", "correctCount"),
    ("prizeAmount", "prize"),
    ("betAmount", "amount"),
    ("fillPercent", "fillPercentage"),
];

/// Upper bound for second-resolution timestamps; larger values are taken to
/// be milliseconds.
const MAX_SECONDS_TIMESTAMP: i64 = 100_000_000_000;

pub fn snake_to_camel(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for (i, ch) in key.chars().enumerate() {
        if ch == '_' || ch == '-' {
            upper_next = i > 0;
            continue;
        }
        if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

pub fn canonical_key(key: &str) -> String {
    let camel = snake_to_camel(key);
    ALIASES
        .iter()
        .find(|(from, _)| *from == camel)
        .map(|(_, to)| to.to_string())
        .unwrap_or(camel)
}

/// Rename every key to its canonical spelling. A key that is already
/// canonical wins over an alias of it.
pub fn canonicalize(raw: Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::with_capacity(raw.len());
    let mut aliased = Vec::new();

    for (key, value) in raw {
        let canonical = canonical_key(&key);
        if canonical == key {
            out.insert(key, value);
        } else {
            aliased.push((canonical, value));
        }
    }
    for (key, value) in aliased {
        out.entry(key).or_insert(value);
    }
    out
}

/// Parse a Unix timestamp from the shapes producers use. Millisecond
/// values are converted to seconds. Non-numeric input yields `None`.
pub fn parse_timestamp(value: &Value) -> Option<i64> {
    let secs = match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))?,
        Value::String(s) => {
            let s = s.trim();
            if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                i64::from_str_radix(hex, 16).ok()?
            } else if let Ok(v) = s.parse::<i64>() {
                v
            } else {
                s.parse::<f64>().ok().filter(|f| f.is_finite())? as i64
            }
        }
        _ => return None,
    };

    if secs > MAX_SECONDS_TIMESTAMP {
        Some(secs / 1000)
    } else {
        Some(secs)
    }
}

/// Derive `currency` from a `useBitr` flag when the payload does not name
/// one explicitly.
pub fn reconcile_currency(fields: &mut Map<String, Value>) {
    if fields.get("currency").map_or(false, |v| !v.is_null()) {
        return;
    }
    let use_bitr = match fields.get("useBitr") {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_u64().map_or(false, |v| v != 0),
        Some(Value::String(s)) => s == "true" || s == "1",
        _ => return,
    };
    let currency = if use_bitr { "BITR" } else { "STT" };
    fields.insert("currency".to_string(), Value::String(currency.to_string()));
}
