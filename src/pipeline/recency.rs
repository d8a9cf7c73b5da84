//! Freshness windows.

use crate::events::EventType;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct FreshnessPolicy {
    windows: HashMap<EventType, i64>,
    max_future_skew_secs: i64,
}

impl FreshnessPolicy {
    /// Per-type windows fall back to each type's built-in default.
    pub fn new(overrides: HashMap<EventType, i64>, max_future_skew_secs: i64) -> Self {
        let windows = EventType::ALL
            .into_iter()
            .map(|t| {
                let window = overrides
                    .get(&t)
                    .copied()
                    .unwrap_or(t.shape().default_freshness_secs);
                (t, window)
            })
            .collect();
        Self {
            windows,
            max_future_skew_secs,
        }
    }

    pub fn window(&self, event_type: EventType) -> i64 {
        self.windows
            .get(&event_type)
            .copied()
            .unwrap_or(event_type.shape().default_freshness_secs)
    }

    /// A missing, zero, negative or far-future timestamp is never fresh.
    pub fn is_fresh(&self, event_type: EventType, timestamp: Option<i64>, now: i64) -> bool {
        let Some(ts) = timestamp else {
            return false;
        };
        if ts <= 0 || ts > now.saturating_add(self.max_future_skew_secs) {
            return false;
        }
        now.saturating_sub(ts) <= self.window(event_type)
    }
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self::new(HashMap::new(), 60)
    }
}
