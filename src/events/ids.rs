//! Identifier normalisation.
//!
//! Pool, cycle and slip ids reach us as hex strings (indexed topics,
//! `0x`-prefixed JSON), plain decimal strings, JSON numbers or `U256`s.
//! Everything downstream (dedupe keys, consumer filters) compares the
//! canonical decimal rendering produced here.

use alloy::primitives::{hex, Address, U256};
use serde_json::Value;
use std::str::FromStr;

/// Normalise an identifier carried in a JSON value. Never fails.
///
/// `null` becomes `"0"`, hex strings are rendered in decimal, numbers are
/// stringified, anything else is returned in its string form.
pub fn normalize_id(value: &Value) -> String {
    match value {
        Value::Null => "0".to_string(),
        Value::String(s) => normalize_id_str(s),
        Value::Number(n) => {
            if let Some(v) = n.as_u64() {
                v.to_string()
            } else if let Some(v) = n.as_i64() {
                v.to_string()
            } else {
                match n.as_f64() {
                    Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
                        format!("{}", f as i64)
                    }
                    _ => n.to_string(),
                }
            }
        }
        other => other.to_string(),
    }
}

/// Normalise a string identifier. `0x`-prefixed values are parsed as a
/// big integer; on failure the input is returned unchanged.
pub fn normalize_id_str(raw: &str) -> String {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"));

    match digits {
        Some(d) if !d.is_empty() => match U256::from_str_radix(d, 16) {
            Ok(v) => v.to_string(),
            Err(_) => raw.to_string(),
        },
        _ => raw.to_string(),
    }
}

/// Render a `U256` in canonical form.
pub fn normalize_u256(value: U256) -> String {
    value.to_string()
}

/// Lower-cased, `0x`-prefixed form of an address, or `None` if the input is
/// not a 20-byte hex address.
pub fn normalize_address(raw: &str) -> Option<String> {
    Address::from_str(raw.trim()).ok().map(format_address)
}

pub fn format_address(addr: Address) -> String {
    format!("0x{}", hex::encode(addr.as_slice()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hex_to_decimal() {
        assert_eq!(normalize_id_str("0x2a"), "42");
        assert_eq!(normalize_id(&json!("0x2A")), "42");
        assert_eq!(
            normalize_id_str("0x000000000000000000000000000000000000000000000000000000000000002a"),
            "42"
        );
    }

    #[test]
    fn test_passthrough_and_null() {
        assert_eq!(normalize_id(&Value::Null), "0");
        assert_eq!(normalize_id(&json!("17")), "17");
        assert_eq!(normalize_id(&json!(17)), "17");
        assert_eq!(normalize_id(&json!(17.0)), "17");
        // unparsable hex is returned as-is
        assert_eq!(normalize_id_str("0xnothex"), "0xnothex");
        assert_eq!(normalize_id_str("0x"), "0x");
    }

    #[test]
    fn test_idempotent() {
        for input in [
            json!("0x2a"),
            json!("42"),
            json!(42),
            json!(null),
            json!("0xzz"),
            json!("pool-7"),
            json!("0xffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        ] {
            let once = normalize_id(&input);
            let twice = normalize_id_str(&once);
            assert_eq!(once, twice, "input {input}");
        }
    }

    #[test]
    fn test_address_lowercased() {
        let addr = normalize_address("0xAbCdEf0123456789aBcDeF0123456789ABCDEF01").unwrap();
        assert_eq!(addr, "0xabcdef0123456789abcdef0123456789abcdef01");
        assert!(normalize_address("0x1234").is_none());
        assert!(normalize_address("not an address").is_none());
    }
}
