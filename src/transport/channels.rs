//! Secondary socket channel naming.
//!
//! Most feeds share one well-known channel with the entity id carried in
//! the payload. Pool-scoped feeds that have per-entity channels use
//! `pool:<id>:<suffix>`, and the id is recovered from the channel name.

use crate::events::ids::normalize_id_str;
use crate::events::EventType;

pub fn type_channel(event_type: EventType) -> &'static str {
    event_type.shape().socket_channel
}

/// Per-entity channel for `event_type`, if the type has one.
pub fn entity_channel(event_type: EventType, entity_id: &str) -> Option<String> {
    let suffix = event_type.shape().entity_channel_suffix?;
    Some(format!("pool:{}:{}", normalize_id_str(entity_id), suffix))
}

/// Which feed a channel carries, and the entity it is scoped to.
pub fn route(channel: &str) -> Option<(EventType, Option<String>)> {
    if let Some(t) = EventType::ALL
        .into_iter()
        .find(|t| t.shape().socket_channel == channel)
    {
        return Some((t, None));
    }

    let mut parts = channel.splitn(3, ':');
    if parts.next()? != "pool" {
        return None;
    }
    let id = parts.next().filter(|id| !id.is_empty())?;
    let suffix = parts.next()?;
    EventType::ALL
        .into_iter()
        .find(|t| t.shape().entity_channel_suffix == Some(suffix))
        .map(|t| (t, Some(normalize_id_str(id))))
}
