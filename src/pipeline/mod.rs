//! The filtering pipeline every inbound payload passes through:
//! decode, recency, rate limit, dedupe. Only records surviving all stages
//! are broadcast.

pub mod dedupe;
pub mod rate_limit;
pub mod recency;

pub use dedupe::{BoundedKeySet, DedupeStore};
pub use rate_limit::RateLimiter;
pub use recency::FreshnessPolicy;

use crate::config::PipelineConfig;
use crate::decode::{self, DecodeError, Payload};
use crate::events::{CanonicalEvent, EventType};
use crate::storage::KvStore;
use chrono::Utc;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Which transport delivered a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Primary,
    Socket,
    Poll,
    Injected,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Source::Primary => "primary",
            Source::Socket => "socket",
            Source::Poll => "poll",
            Source::Injected => "injected",
        })
    }
}

/// A raw payload tagged with the feed it arrived on.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub event_type: EventType,
    pub payload: Payload,
    /// Entity id known from the delivery channel, if any.
    pub entity_hint: Option<String>,
    pub source: Source,
}

impl Inbound {
    pub fn new(event_type: EventType, payload: Payload, source: Source) -> Self {
        Self {
            event_type,
            payload,
            entity_hint: None,
            source,
        }
    }

    pub fn with_entity_hint(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_hint = Some(entity_id.into());
        self
    }
}

/// Wall-clock seconds for freshness plus a monotonic instant for throttling.
#[derive(Debug, Clone, Copy)]
pub struct Moment {
    pub unix_secs: i64,
    pub instant: Instant,
}

impl Moment {
    pub fn now() -> Self {
        Self {
            unix_secs: Utc::now().timestamp(),
            instant: Instant::now(),
        }
    }

    pub fn at(unix_secs: i64, instant: Instant) -> Self {
        Self { unix_secs, instant }
    }

    /// The same moment `secs` later on both clocks.
    pub fn plus_secs(self, secs: u64) -> Self {
        Self {
            unix_secs: self.unix_secs + secs as i64,
            instant: self.instant + Duration::from_secs(secs),
        }
    }
}

/// Why a payload did not reach consumers.
#[derive(Error, Debug)]
pub enum Rejection {
    #[error("malformed payload: {0}")]
    Malformed(#[from] DecodeError),
    #[error("stale or missing timestamp")]
    Stale,
    #[error("rate limited")]
    RateLimited,
    #[error("duplicate")]
    Duplicate,
    #[error("no subscribers")]
    NoSubscribers,
}

pub struct Pipeline {
    freshness: FreshnessPolicy,
    limiter: RateLimiter,
    dedupe: Mutex<DedupeStore>,
}

impl Pipeline {
    pub fn new(freshness: FreshnessPolicy, limiter: RateLimiter, dedupe: DedupeStore) -> Self {
        Self {
            freshness,
            limiter,
            dedupe: Mutex::new(dedupe),
        }
    }

    pub fn from_config(config: &PipelineConfig, store: Arc<dyn KvStore>) -> Self {
        Self::new(
            FreshnessPolicy::new(config.freshness_overrides(), config.max_future_skew_secs),
            RateLimiter::new(Duration::from_millis(config.min_notify_interval_ms)),
            DedupeStore::load(store, config.dedupe_capacity, config.seen_cycles_capacity),
        )
    }

    /// Run one payload through every stage, in order.
    pub fn process(&self, inbound: &Inbound, now: Moment) -> Result<CanonicalEvent, Rejection> {
        let event_type = inbound.event_type;

        let draft = decode::decode(event_type, &inbound.payload, inbound.entity_hint.as_deref())?;

        let timestamp = match draft.timestamp {
            Some(ts) if self.freshness.is_fresh(event_type, Some(ts), now.unix_secs) => ts,
            other => {
                debug!(event_type = %event_type, timestamp = ?other, "dropping stale event");
                return Err(Rejection::Stale);
            }
        };
        let event = draft.into_event(timestamp);

        // one lock over both stages so the throttle commit sees the dedupe verdict
        let mut dedupe = match self.dedupe.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if !self.limiter.would_allow(event_type, &event.entity_id, now.instant) {
            debug!(event_type = %event_type, entity = %event.entity_id, "rate limited");
            return Err(Rejection::RateLimited);
        }

        let key = event.dedupe_key();
        if event_type == EventType::CycleResolved && dedupe.cycle_seen(&event.entity_id) {
            debug!(cycle = %event.entity_id, "cycle resolution already delivered");
            return Err(Rejection::Duplicate);
        }
        if !dedupe.check_and_mark(event_type, &key) {
            debug!(key = %key, source = %inbound.source, "duplicate event");
            return Err(Rejection::Duplicate);
        }
        if event_type == EventType::CycleResolved {
            dedupe.mark_cycle(&event.entity_id);
        }
        self.limiter.record(event_type, &event.entity_id, now.instant);

        Ok(event)
    }
}
