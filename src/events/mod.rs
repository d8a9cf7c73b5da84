//! Event catalogue and the canonical event record.
//!
//! Every feed the engine knows about is an [`EventType`]. Each type carries
//! a static [`EventShape`] describing where its ids live, how fresh it must
//! be and how it is addressed on the transports.

pub mod ids;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// The closed set of feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    PoolCreated,
    PoolSettled,
    BetPlaced,
    PoolProgress,
    ReputationChanged,
    LiquidityAdded,
    CycleResolved,
    SlipEvaluated,
    PrizeClaimed,
}

/// Static description of one event type.
#[derive(Debug)]
pub struct EventShape {
    pub name: &'static str,
    /// Canonical field holding the primary entity id (pool or cycle).
    pub entity_field: &'static str,
    /// Canonical fields that may hold the actor address, in priority order.
    pub actor_fields: &'static [&'static str],
    /// Canonical field holding the secondary id, if the type has one.
    pub secondary_field: Option<&'static str>,
    /// Whether the secondary id is folded into the dedupe key.
    pub key_includes_secondary: bool,
    pub default_freshness_secs: i64,
    /// Well-known channel on the secondary socket.
    pub socket_channel: &'static str,
    /// Suffix for per-entity socket channels (`pool:<id>:<suffix>`).
    pub entity_channel_suffix: Option<&'static str>,
}

const POOL_CREATED: EventShape = EventShape {
    name: "pool-created",
    entity_field: "poolId",
    actor_fields: &["creator", "actor"],
    secondary_field: None,
    key_includes_secondary: false,
    default_freshness_secs: 180,
    socket_channel: "pools:created",
    entity_channel_suffix: None,
};

const POOL_SETTLED: EventShape = EventShape {
    name: "pool-settled",
    entity_field: "poolId",
    actor_fields: &["settler", "actor"],
    secondary_field: None,
    key_includes_secondary: false,
    default_freshness_secs: 120,
    socket_channel: "pools:settled",
    entity_channel_suffix: None,
};

const BET_PLACED: EventShape = EventShape {
    name: "bet-placed",
    entity_field: "poolId",
    actor_fields: &["bettor", "user", "actor"],
    secondary_field: None,
    key_includes_secondary: false,
    default_freshness_secs: 120,
    socket_channel: "bets:recent",
    entity_channel_suffix: Some("bets"),
};

const POOL_PROGRESS: EventShape = EventShape {
    name: "pool-progress",
    entity_field: "poolId",
    actor_fields: &[],
    secondary_field: None,
    key_includes_secondary: false,
    default_freshness_secs: 300,
    socket_channel: "pools:progress",
    entity_channel_suffix: Some("progress"),
};

const REPUTATION_CHANGED: EventShape = EventShape {
    name: "reputation-changed",
    entity_field: "poolId",
    actor_fields: &["user", "actor"],
    secondary_field: None,
    key_includes_secondary: false,
    default_freshness_secs: 180,
    socket_channel: "reputation:changed",
    entity_channel_suffix: None,
};

const LIQUIDITY_ADDED: EventShape = EventShape {
    name: "liquidity-added",
    entity_field: "poolId",
    actor_fields: &["provider", "user", "actor"],
    secondary_field: None,
    key_includes_secondary: false,
    default_freshness_secs: 120,
    socket_channel: "liquidity:added",
    entity_channel_suffix: None,
};

const CYCLE_RESOLVED: EventShape = EventShape {
    name: "cycle-resolved",
    entity_field: "cycleId",
    actor_fields: &[],
    secondary_field: None,
    key_includes_secondary: false,
    default_freshness_secs: 60,
    socket_channel: "cycles:resolved",
    entity_channel_suffix: None,
};

const SLIP_EVALUATED: EventShape = EventShape {
    name: "slip-evaluated",
    entity_field: "cycleId",
    actor_fields: &["player", "user", "actor"],
    secondary_field: Some("slipId"),
    key_includes_secondary: true,
    default_freshness_secs: 120,
    socket_channel: "slips:evaluated",
    entity_channel_suffix: None,
};

const PRIZE_CLAIMED: EventShape = EventShape {
    name: "prize-claimed",
    entity_field: "cycleId",
    actor_fields: &["player", "user", "actor"],
    secondary_field: None,
    key_includes_secondary: false,
    default_freshness_secs: 120,
    socket_channel: "prizes:claimed",
    entity_channel_suffix: None,
};

impl EventType {
    pub const ALL: [EventType; 9] = [
        EventType::PoolCreated,
        EventType::PoolSettled,
        EventType::BetPlaced,
        EventType::PoolProgress,
        EventType::ReputationChanged,
        EventType::LiquidityAdded,
        EventType::CycleResolved,
        EventType::SlipEvaluated,
        EventType::PrizeClaimed,
    ];

    pub fn shape(self) -> &'static EventShape {
        match self {
            EventType::PoolCreated => &POOL_CREATED,
            EventType::PoolSettled => &POOL_SETTLED,
            EventType::BetPlaced => &BET_PLACED,
            EventType::PoolProgress => &POOL_PROGRESS,
            EventType::ReputationChanged => &REPUTATION_CHANGED,
            EventType::LiquidityAdded => &LIQUIDITY_ADDED,
            EventType::CycleResolved => &CYCLE_RESOLVED,
            EventType::SlipEvaluated => &SLIP_EVALUATED,
            EventType::PrizeClaimed => &PRIZE_CLAIMED,
        }
    }

    pub fn as_str(self) -> &'static str {
        self.shape().name
    }

    /// Logical channel name used for the primary upstream subscription.
    pub fn upstream_channel(self) -> &'static str {
        self.as_str()
    }

    /// Cycle events are emitted by the cycle contract, not the pool contract.
    pub fn is_cycle_event(self) -> bool {
        self.shape().entity_field == "cycleId"
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event type: {0}")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    /// Accepts the kebab-case name as well as snake_case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

/// A decoded, normalised and validated event, as handed to consumers.
///
/// `timestamp` is always a positive Unix-seconds value that passed the
/// freshness check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalEvent {
    pub event_type: EventType,
    pub entity_id: String,
    pub secondary_id: Option<String>,
    pub actor_address: String,
    pub timestamp: i64,
    /// Event-specific fields under their canonical (camelCase) names.
    pub fields: Map<String, Value>,
}

impl CanonicalEvent {
    /// Deterministic identity of this occurrence, independent of which
    /// transport delivered it.
    pub fn dedupe_key(&self) -> String {
        let mut key = format!(
            "{}|{}|{}|{}",
            self.event_type, self.entity_id, self.actor_address, self.timestamp
        );
        if self.event_type.shape().key_includes_secondary {
            key.push('|');
            key.push_str(self.secondary_id.as_deref().unwrap_or(""));
        }
        key
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn str_field(&self, name: &str) -> Option<String> {
        match self.fields.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn amount(&self) -> Option<String> {
        self.fields.get("amount").map(ids::normalize_id)
    }

    /// `amount` interpreted as an 18-decimal token quantity.
    pub fn amount_tokens(&self) -> Option<Decimal> {
        let raw: i128 = self.amount()?.parse().ok()?;
        Decimal::try_from_i128_with_scale(raw, 18)
            .ok()
            .map(|d| d.normalize())
    }

    pub fn currency(&self) -> Option<String> {
        self.str_field("currency")
    }

    pub fn fill_percentage(&self) -> Option<f64> {
        match self.fields.get("fillPercentage")? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: EventType) -> CanonicalEvent {
        CanonicalEvent {
            event_type,
            entity_id: "42".to_string(),
            secondary_id: Some("7".to_string()),
            actor_address: "0xabc".to_string(),
            timestamp: 1_700_000_000,
            fields: Map::new(),
        }
    }

    #[test]
    fn test_event_type_names_round_trip() {
        for t in EventType::ALL {
            assert_eq!(t.as_str().parse::<EventType>().unwrap(), t);
            assert_eq!(serde_json::to_value(t).unwrap(), json!(t.as_str()));
        }
        assert_eq!("bet_placed".parse::<EventType>().unwrap(), EventType::BetPlaced);
        assert!("bet-cancelled".parse::<EventType>().is_err());
    }

    #[test]
    fn test_dedupe_key_secondary_only_for_slips() {
        assert_eq!(
            event(EventType::BetPlaced).dedupe_key(),
            "bet-placed|42|0xabc|1700000000"
        );
        assert_eq!(
            event(EventType::SlipEvaluated).dedupe_key(),
            "slip-evaluated|42|0xabc|1700000000|7"
        );
    }

    #[test]
    fn test_progress_windows_wider_than_resolution() {
        assert!(
            EventType::PoolProgress.shape().default_freshness_secs
                > EventType::CycleResolved.shape().default_freshness_secs
        );
    }

    #[test]
    fn test_amount_tokens() {
        let mut e = event(EventType::BetPlaced);
        e.fields.insert("amount".into(), json!("1500000000000000000"));
        assert_eq!(e.amount_tokens().unwrap().to_string(), "1.5");
        e.fields.insert("amount".into(), json!("0x0de0b6b3a7640000"));
        assert_eq!(e.amount_tokens().unwrap().to_string(), "1");
    }
}
