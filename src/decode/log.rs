//! Raw on-chain log decoding.
//!
//! Indexed parameters live in `topics[1..]`: the entity id is topic 1, the
//! actor address (if the event has one) is topic 2. The data blob is first
//! probed for tunnelled application JSON; only if none is found do we fall
//! back to positional ABI decoding, which additionally requires topic0 to
//! match the expected event signature.

use crate::decode::abi::{self, EventAbi, Word};
use crate::decode::fields::{self, parse_timestamp};
use crate::decode::DecodeError;
use crate::events::ids::{format_address, normalize_u256};
use crate::events::EventType;

use alloy::primitives::{hex, Address, Bytes, B256, I256, U256};
use alloy::rpc::types::Log;
use serde_json::{Map, Value};
use std::str::FromStr;
use tracing::debug;

/// Any "address" topic whose integer value is below this is a byte offset
/// or a small counter, not an account.
const MIN_ADDRESS_VALUE: u64 = 1 << 32;

/// How many candidate `{`/`[` positions we try when probing a data blob.
const MAX_JSON_PROBES: usize = 8;

/// A log in transport-neutral form.
#[derive(Debug, Clone, PartialEq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_timestamp: Option<u64>,
}

impl RawLog {
    /// Build from the JSON shape `{address, topics: [hex...], data: hex}`.
    /// Returns `None` if the value does not look like a log.
    pub fn from_json(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;

        let topics = obj
            .get("topics")?
            .as_array()?
            .iter()
            .map(|t| t.as_str().and_then(parse_word))
            .collect::<Option<Vec<_>>>()?;

        let address = obj
            .get("address")
            .and_then(|v| v.as_str())
            .and_then(|s| Address::from_str(s).ok())
            .unwrap_or(Address::ZERO);

        let data = match obj.get("data") {
            Some(Value::String(s)) => decode_hex(s)?,
            None | Some(Value::Null) => Bytes::new(),
            Some(_) => return None,
        };

        let block_timestamp = obj
            .get("blockTimestamp")
            .or_else(|| obj.get("block_timestamp"))
            .and_then(parse_timestamp)
            .and_then(|t| u64::try_from(t).ok());

        Some(Self {
            address,
            topics,
            data,
            block_timestamp,
        })
    }
}

impl From<&Log> for RawLog {
    fn from(log: &Log) -> Self {
        Self {
            address: log.address(),
            topics: log.topics().to_vec(),
            data: log.data().data.clone(),
            block_timestamp: log.block_timestamp,
        }
    }
}

/// Decode a log into a canonical field map for `event_type`.
pub fn decode_log(event_type: EventType, log: &RawLog) -> Result<Map<String, Value>, DecodeError> {
    let shape = event_type.shape();
    let abi = abi::event_abi(event_type);

    let topic0 = log
        .topics
        .first()
        .ok_or(DecodeError::NotBusinessData("log has no topics"))?;

    let mut fields = match probe_json(&log.data) {
        Some(map) => {
            debug!(event_type = %event_type, "decoded tunnelled JSON from log data");
            fields::canonicalize(map)
        }
        None => {
            if *topic0 != abi::topic0(event_type) {
                return Err(DecodeError::NotBusinessData("topic0 does not match event signature"));
            }
            if log.topics.len() != abi.indexed + 1 {
                return Err(DecodeError::NotBusinessData("unexpected indexed topic count"));
            }
            decode_words(abi, &log.data)?
        }
    };

    // Indexed topics are authoritative over anything tunnelled in the body.
    if let Some(topic) = log.topics.get(1) {
        let id = normalize_u256(U256::from_be_bytes(topic.0));
        fields.insert(shape.entity_field.to_string(), Value::String(id));
    }
    if let (Some(topic), Some(field)) = (log.topics.get(2), shape.actor_fields.first()) {
        match address_from_topic(topic) {
            Some(addr) => {
                fields.insert(field.to_string(), Value::String(addr));
            }
            None => debug!(topic = %topic, "ignoring implausible actor topic"),
        }
    }
    if !fields.contains_key("timestamp") {
        if let Some(ts) = log.block_timestamp {
            fields.insert("timestamp".to_string(), Value::from(ts));
        }
    }

    Ok(fields)
}

/// The last 20 bytes of a 32-byte topic as a lower-cased address, unless
/// the topic is zero or too small to be a real account.
pub fn address_from_topic(topic: &B256) -> Option<String> {
    let as_int = U256::from_be_bytes(topic.0);
    if as_int < U256::from(MIN_ADDRESS_VALUE) {
        return None;
    }
    Some(format_address(Address::from_slice(&topic.0[12..])))
}

/// Look for a JSON object (or array of objects) embedded in raw bytes.
fn probe_json(data: &[u8]) -> Option<Map<String, Value>> {
    if data.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(data);

    text.char_indices()
        .filter(|(_, c)| *c == '{' || *c == '[')
        .take(MAX_JSON_PROBES)
        .find_map(|(start, _)| {
            let mut stream =
                serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
            match stream.next()? {
                Ok(Value::Object(map)) => Some(map),
                Ok(Value::Array(items)) => items.into_iter().find_map(|v| match v {
                    Value::Object(map) => Some(map),
                    _ => None,
                }),
                _ => None,
            }
        })
}

/// Positional decoding of static 32-byte words.
fn decode_words(abi: &EventAbi, data: &[u8]) -> Result<Map<String, Value>, DecodeError> {
    let expected = abi.data.len() * 32;
    if data.len() < expected {
        return Err(DecodeError::Truncated {
            expected,
            actual: data.len(),
        });
    }

    let mut fields = Map::with_capacity(abi.data.len());
    for (i, (name, word)) in abi.data.iter().enumerate() {
        let bytes: [u8; 32] = data[i * 32..(i + 1) * 32].try_into().unwrap_or([0u8; 32]);
        let raw = U256::from_be_bytes(bytes);
        let value = match word {
            Word::Uint => match u64::try_from(raw) {
                Ok(v) => Value::from(v),
                Err(_) => Value::String(raw.to_string()),
            },
            Word::Int => {
                let signed = I256::from_raw(raw);
                match signed.to_string().parse::<i64>() {
                    Ok(v) => Value::from(v),
                    Err(_) => Value::String(signed.to_string()),
                }
            }
            Word::Bool => Value::Bool(!raw.is_zero()),
            Word::Address => Value::String(format_address(Address::from_slice(&bytes[12..]))),
        };
        fields.insert(name.to_string(), value);
    }
    Ok(fields)
}

/// Parse a hex topic, left-padding short values to 32 bytes.
fn parse_word(s: &str) -> Option<B256> {
    let bytes = decode_hex(s)?;
    if bytes.len() > 32 {
        return None;
    }
    let mut word = [0u8; 32];
    word[32 - bytes.len()..].copy_from_slice(&bytes);
    Some(B256::from(word))
}

fn decode_hex(s: &str) -> Option<Bytes> {
    let s = s.trim();
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() {
        return Some(Bytes::new());
    }
    hex::decode(digits).ok().map(Bytes::from)
}
