//! Per-entity notification throttle.
//!
//! Distinct events for the same `(event type, entity)` arriving within the
//! minimum interval are dropped, even though none of them is a duplicate.

use crate::events::EventType;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Above this many tracked keys, entries older than the interval are pruned.
const PRUNE_THRESHOLD: usize = 4096;

pub struct RateLimiter {
    min_interval: Duration,
    last_accepted: DashMap<(EventType, String), Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_accepted: DashMap::new(),
        }
    }

    pub fn allow(&self, event_type: EventType, entity_id: &str) -> bool {
        self.allow_at(event_type, entity_id, Instant::now())
    }

    /// Admit and record the occurrence unless one for the same key was
    /// accepted less than `min_interval` before `now`.
    pub fn allow_at(&self, event_type: EventType, entity_id: &str, now: Instant) -> bool {
        if !self.would_allow(event_type, entity_id, now) {
            return false;
        }
        self.record(event_type, entity_id, now);
        true
    }

    /// Check without recording. Pair with [`record`](Self::record) once the
    /// occurrence is actually accepted.
    pub fn would_allow(&self, event_type: EventType, entity_id: &str, now: Instant) -> bool {
        match self.last_accepted.get(&(event_type, entity_id.to_string())) {
            Some(last) => now.saturating_duration_since(*last) >= self.min_interval,
            None => true,
        }
    }

    pub fn record(&self, event_type: EventType, entity_id: &str, now: Instant) {
        match self.last_accepted.entry((event_type, entity_id.to_string())) {
            Entry::Occupied(mut last) => {
                if now > *last.get() {
                    last.insert(now);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
            }
        }

        if self.last_accepted.len() > PRUNE_THRESHOLD {
            let min = self.min_interval;
            self.last_accepted
                .retain(|_, t| now.saturating_duration_since(*t) < min);
        }
    }

    pub fn tracked(&self) -> usize {
        self.last_accepted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_boundary() {
        let limiter = RateLimiter::new(Duration::from_secs(2));
        let t0 = Instant::now();
        assert!(limiter.allow_at(EventType::BetPlaced, "42", t0));
        assert!(!limiter.allow_at(EventType::BetPlaced, "42", t0 + Duration::from_millis(1500)));
        assert!(limiter.allow_at(EventType::BetPlaced, "42", t0 + Duration::from_millis(2100)));
        // rejected occurrences do not move the reference point
        assert!(!limiter.allow_at(EventType::BetPlaced, "42", t0 + Duration::from_millis(3000)));
        assert!(limiter.allow_at(EventType::BetPlaced, "42", t0 + Duration::from_millis(4200)));
    }

    #[test]
    fn test_check_does_not_record() {
        let limiter = RateLimiter::new(Duration::from_secs(2));
        let t0 = Instant::now();
        assert!(limiter.would_allow(EventType::BetPlaced, "42", t0));
        assert!(limiter.would_allow(EventType::BetPlaced, "42", t0));
        assert_eq!(limiter.tracked(), 0);

        limiter.record(EventType::BetPlaced, "42", t0);
        assert!(!limiter.would_allow(EventType::BetPlaced, "42", t0 + Duration::from_secs(1)));
        assert!(limiter.would_allow(EventType::BetPlaced, "42", t0 + Duration::from_secs(2)));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(2));
        let t0 = Instant::now();
        assert!(limiter.allow_at(EventType::BetPlaced, "42", t0));
        assert!(limiter.allow_at(EventType::BetPlaced, "43", t0));
        assert!(limiter.allow_at(EventType::PoolProgress, "42", t0));
        assert_eq!(limiter.tracked(), 3);
    }

    #[test]
    fn test_prunes_stale_keys() {
        let limiter = RateLimiter::new(Duration::from_secs(2));
        let t0 = Instant::now();
        for i in 0..=PRUNE_THRESHOLD {
            limiter.allow_at(EventType::BetPlaced, &i.to_string(), t0);
        }
        assert!(limiter.allow_at(EventType::BetPlaced, "fresh", t0 + Duration::from_secs(5)));
        assert_eq!(limiter.tracked(), 1);
    }
}
