//! Payload decoding.
//!
//! Transports hand us one of three shapes: a raw log, a JSON string, or an
//! already-structured value. [`decode`] turns any of them into an
//! [`EventDraft`]: ids normalised, actor lower-cased, fields under their
//! canonical names. The timestamp is parsed but not yet validated; that is
//! the recency stage's job.

pub mod abi;
pub mod fields;
pub mod log;

pub use self::log::RawLog;

use crate::events::ids::{normalize_address, normalize_id};
use crate::events::{CanonicalEvent, EventType};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not an object")]
    NotAnObject,
    #[error("missing entity id field {0}")]
    MissingEntity(&'static str),
    #[error("log is not business data: {0}")]
    NotBusinessData(&'static str),
    #[error("log data truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

/// A payload as delivered by a transport.
#[derive(Debug, Clone)]
pub enum Payload {
    Log(RawLog),
    Text(String),
    Value(Value),
}

impl Payload {
    /// Classify a JSON value by its structural markers.
    pub fn from_value(value: Value) -> Self {
        if value.get("topics").is_some() {
            if let Some(log) = RawLog::from_json(&value) {
                return Payload::Log(log);
            }
        }
        match value {
            Value::String(text) => Payload::Text(text),
            other => Payload::Value(other),
        }
    }
}

/// A decoded event whose timestamp has not been validated yet.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub event_type: EventType,
    pub entity_id: String,
    pub secondary_id: Option<String>,
    pub actor_address: String,
    pub timestamp: Option<i64>,
    pub fields: Map<String, Value>,
}

impl EventDraft {
    /// Seal the draft once its timestamp has been validated.
    pub fn into_event(self, timestamp: i64) -> CanonicalEvent {
        CanonicalEvent {
            event_type: self.event_type,
            entity_id: self.entity_id,
            secondary_id: self.secondary_id,
            actor_address: self.actor_address,
            timestamp,
            fields: self.fields,
        }
    }
}

/// Decode any payload shape. `entity_hint` supplies the entity id when the
/// transport knows it out-of-band (per-entity channels).
pub fn decode(
    event_type: EventType,
    payload: &Payload,
    entity_hint: Option<&str>,
) -> Result<EventDraft, DecodeError> {
    let fields = match payload {
        Payload::Log(log) => log::decode_log(event_type, log)?,
        Payload::Text(text) => {
            let mut value: Value = serde_json::from_str(text)?;
            if let Value::Array(items) = value {
                value = items.into_iter().next().ok_or(DecodeError::NotAnObject)?;
            }
            return match Payload::from_value(value) {
                Payload::Text(_) => Err(DecodeError::NotAnObject),
                inner => decode(event_type, &inner, entity_hint),
            };
        }
        Payload::Value(value) => object_fields(value)?,
    };

    build_draft(event_type, fields, entity_hint)
}

fn object_fields(value: &Value) -> Result<Map<String, Value>, DecodeError> {
    let obj = match value {
        Value::Object(map) => map,
        Value::Array(items) => match items.first() {
            Some(Value::Object(map)) => map,
            _ => return Err(DecodeError::NotAnObject),
        },
        _ => return Err(DecodeError::NotAnObject),
    };
    Ok(fields::canonicalize(obj.clone()))
}

fn build_draft(
    event_type: EventType,
    mut fields: Map<String, Value>,
    entity_hint: Option<&str>,
) -> Result<EventDraft, DecodeError> {
    let shape = event_type.shape();

    let entity_id = match fields.get(shape.entity_field).or_else(|| fields.get("id")) {
        Some(v) if !v.is_null() => normalize_id(v),
        _ => match entity_hint {
            Some(hint) => {
                let id = crate::events::ids::normalize_id_str(hint);
                fields.insert(shape.entity_field.to_string(), Value::String(id.clone()));
                id
            }
            None => return Err(DecodeError::MissingEntity(shape.entity_field)),
        },
    };

    let secondary_id = shape
        .secondary_field
        .and_then(|f| fields.get(f))
        .filter(|v| !v.is_null())
        .map(normalize_id);

    let actor_address = shape
        .actor_fields
        .iter()
        .filter_map(|f| fields.get(*f).and_then(|v| v.as_str()))
        .find_map(normalize_address)
        .unwrap_or_default();

    let timestamp = fields
        .get("timestamp")
        .or_else(|| fields.get("blockTimestamp"))
        .and_then(fields::parse_timestamp);

    fields::reconcile_currency(&mut fields);

    Ok(EventDraft {
        event_type,
        entity_id,
        secondary_id,
        actor_address,
        timestamp,
        fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snake_and_camel_decode_identically() {
        let snake = Payload::Value(json!({
            "pool_id": "0x2a",
            "bettor_address": "0xAbCdEf0123456789aBcDeF0123456789ABCDEF01",
            "amount": "100",
            "timestamp": 1_700_000_000,
        }));
        let camel = Payload::Text(
            json!({
                "poolId": 42,
                "bettor": "0xabcdef0123456789abcdef0123456789abcdef01",
                "amount": "100",
                "timestamp": "1700000000",
            })
            .to_string(),
        );

        let a = decode(EventType::BetPlaced, &snake, None).unwrap();
        let b = decode(EventType::BetPlaced, &camel, None).unwrap();
        assert_eq!(a.entity_id, "42");
        assert_eq!(a.entity_id, b.entity_id);
        assert_eq!(a.actor_address, b.actor_address);
        assert_eq!(a.actor_address, "0xabcdef0123456789abcdef0123456789abcdef01");
        assert_eq!(a.timestamp, Some(1_700_000_000));
        assert_eq!(a.timestamp, b.timestamp);
    }

    #[test]
    fn test_json_array_takes_first_element() {
        let payload = Payload::Text(r#"[{"cycle_id": 9, "timestamp": 5}, {"cycle_id": 10}]"#.into());
        let draft = decode(EventType::CycleResolved, &payload, None).unwrap();
        assert_eq!(draft.entity_id, "9");
        assert_eq!(draft.actor_address, "");
    }

    #[test]
    fn test_slip_secondary_id() {
        let payload = Payload::Value(json!({
            "cycleId": "3",
            "slip_id": "0x10",
            "player": "0x52908400098527886E0F7030069857D2E4169EE7",
            "correct_predictions": 7,
        }));
        let draft = decode(EventType::SlipEvaluated, &payload, None).unwrap();
        assert_eq!(draft.secondary_id.as_deref(), Some("16"));
        assert_eq!(draft.fields["correctCount"], json!(7));
        assert_eq!(draft.timestamp, None);
    }

    #[test]
    fn test_entity_hint_fills_missing_id() {
        let payload = Payload::Value(json!({"fillPercentage": 40, "timestamp": 1}));
        let draft = decode(EventType::PoolProgress, &payload, Some("7")).unwrap();
        assert_eq!(draft.entity_id, "7");
        assert_eq!(draft.fields["poolId"], json!("7"));

        assert!(matches!(
            decode(EventType::PoolProgress, &payload, None),
            Err(DecodeError::MissingEntity("poolId"))
        ));
    }

    #[test]
    fn test_malformed_payloads_rejected() {
        assert!(matches!(
            decode(EventType::BetPlaced, &Payload::Text("{not json".into()), None),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            decode(EventType::BetPlaced, &Payload::Value(json!(12)), None),
            Err(DecodeError::NotAnObject)
        ));
        assert!(matches!(
            decode(EventType::BetPlaced, &Payload::Text(r#""nested""#.into()), None),
            Err(DecodeError::NotAnObject)
        ));
    }

    #[test]
    fn test_from_value_detects_logs() {
        let log = json!({"topics": ["0x01", "0x02"], "data": "0x"});
        assert!(matches!(Payload::from_value(log), Payload::Log(_)));
        assert!(matches!(Payload::from_value(json!("{}")), Payload::Text(_)));
        assert!(matches!(Payload::from_value(json!({"poolId": 1})), Payload::Value(_)));
    }
}
