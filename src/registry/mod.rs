//! Subscription registry.
//!
//! Maps each event type to its consumer callbacks and upstream lease. An
//! entry moves through
//!
//! ```text
//! Idle -> PendingUpstream -> Active -> GraceTeardown -> Idle
//!                \                         |
//!                 -> Degraded              -> Active (resubscribe in grace)
//! ```
//!
//! The registry never awaits. It only records decisions; the engine runs
//! the acquisition and teardown tasks and reports back with the entry's
//! generation so that late completions for a replaced entry are ignored.

use crate::events::{CanonicalEvent, EventType};
use crate::transport::{TransportError, UpstreamLease};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub type Callback = Arc<dyn Fn(&CanonicalEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Idle,
    PendingUpstream,
    Active,
    Degraded,
    GraceTeardown,
}

/// What the caller must do after attaching a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attach {
    /// First subscriber: start upstream acquisition for this generation.
    Acquire { generation: u64 },
    /// Upstream already open, pending or degraded.
    Reused,
    /// A pending teardown was cancelled.
    Resumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detach {
    Remaining(usize),
    /// Last subscriber left: arm the grace timer for this generation.
    LastGone { generation: u64 },
    NotFound,
}

pub struct SubscriptionEntry {
    callbacks: Vec<(SubscriberId, Callback)>,
    pending_upstream: bool,
    degraded: bool,
    lease: Option<UpstreamLease>,
    teardown: Option<JoinHandle<()>>,
    generation: u64,
}

impl SubscriptionEntry {
    fn new(generation: u64) -> Self {
        Self {
            callbacks: Vec::new(),
            pending_upstream: true,
            degraded: false,
            lease: None,
            teardown: None,
            generation,
        }
    }

    pub fn state(&self) -> EntryState {
        if self.teardown.is_some() {
            EntryState::GraceTeardown
        } else if self.pending_upstream {
            EntryState::PendingUpstream
        } else if self.lease.is_some() {
            EntryState::Active
        } else if self.degraded {
            EntryState::Degraded
        } else {
            EntryState::Idle
        }
    }
}

impl Drop for SubscriptionEntry {
    fn drop(&mut self) {
        if let Some(timer) = self.teardown.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<EventType, SubscriptionEntry>,
    next_generation: u64,
}

#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
    next_subscriber: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Add a callback. The pending flag is set here, before any
    /// acquisition starts, so concurrent first subscribers see it.
    pub fn attach(&self, event_type: EventType, callback: Callback) -> (SubscriberId, Attach) {
        let id = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.lock();

        if let Some(entry) = inner.entries.get_mut(&event_type) {
            entry.callbacks.push((id, callback));
            if let Some(timer) = entry.teardown.take() {
                timer.abort();
                debug!(event_type = %event_type, "teardown cancelled by resubscribe");
                return (id, Attach::Resumed);
            }
            return (id, Attach::Reused);
        }

        inner.next_generation += 1;
        let generation = inner.next_generation;
        let mut entry = SubscriptionEntry::new(generation);
        entry.callbacks.push((id, callback));
        inner.entries.insert(event_type, entry);
        (id, Attach::Acquire { generation })
    }

    pub fn detach(&self, event_type: EventType, id: SubscriberId) -> Detach {
        let mut inner = self.lock();
        let Some(entry) = inner.entries.get_mut(&event_type) else {
            return Detach::NotFound;
        };
        let before = entry.callbacks.len();
        entry.callbacks.retain(|(sid, _)| *sid != id);
        if entry.callbacks.len() == before {
            return Detach::NotFound;
        }
        match entry.callbacks.len() {
            0 => Detach::LastGone {
                generation: entry.generation,
            },
            n => Detach::Remaining(n),
        }
    }

    /// Store the grace timer. If the entry was replaced or regained
    /// subscribers in the meantime, the timer is cancelled instead.
    pub fn arm_teardown(&self, event_type: EventType, generation: u64, timer: JoinHandle<()>) {
        let mut inner = self.lock();
        match inner.entries.get_mut(&event_type) {
            Some(entry) if entry.generation == generation && entry.callbacks.is_empty() => {
                if let Some(old) = entry.teardown.replace(timer) {
                    old.abort();
                }
            }
            _ => timer.abort(),
        }
    }

    /// Grace period elapsed. Removes the entry if still unused and returns
    /// it so the caller can drop its lease outside the lock.
    pub fn finish_teardown(&self, event_type: EventType, generation: u64) -> Option<SubscriptionEntry> {
        let mut inner = self.lock();
        let entry = inner.entries.get_mut(&event_type)?;
        if entry.generation != generation || !entry.callbacks.is_empty() {
            return None;
        }
        // The running timer is the caller; forget it rather than abort.
        entry.teardown = None;
        inner.entries.remove(&event_type)
    }

    /// Record the outcome of an acquisition. A lease that arrives for an
    /// entry that is gone (or replaced) is handed back to be dropped.
    pub fn complete_acquisition(
        &self,
        event_type: EventType,
        generation: u64,
        result: Result<UpstreamLease, TransportError>,
    ) -> Option<UpstreamLease> {
        let mut inner = self.lock();
        let entry = match inner.entries.get_mut(&event_type) {
            Some(entry) if entry.generation == generation => entry,
            _ => return result.ok(),
        };
        entry.pending_upstream = false;
        match result {
            Ok(lease) => {
                entry.degraded = false;
                entry.lease.replace(lease)
            }
            Err(e) => {
                warn!(event_type = %event_type, error = %e, "event type degraded");
                entry.degraded = true;
                None
            }
        }
    }

    /// Mark every degraded entry pending again and return what to retry.
    pub fn take_degraded(&self) -> Vec<(EventType, u64)> {
        let mut inner = self.lock();
        inner
            .entries
            .iter_mut()
            .filter(|(_, e)| e.degraded && !e.pending_upstream && e.lease.is_none())
            .map(|(t, e)| {
                e.pending_upstream = true;
                e.degraded = false;
                (*t, e.generation)
            })
            .collect()
    }

    /// Callbacks in registration order.
    pub fn callbacks(&self, event_type: EventType) -> Vec<Callback> {
        self.lock()
            .entries
            .get(&event_type)
            .map(|e| e.callbacks.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default()
    }

    pub fn has_subscribers(&self, event_type: EventType) -> bool {
        self.subscriber_count(event_type) > 0
    }

    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.lock()
            .entries
            .get(&event_type)
            .map_or(0, |e| e.callbacks.len())
    }

    pub fn state(&self, event_type: EventType) -> EntryState {
        self.lock()
            .entries
            .get(&event_type)
            .map_or(EntryState::Idle, SubscriptionEntry::state)
    }

    /// Remove every entry, for shutdown.
    pub fn drain(&self) -> Vec<SubscriptionEntry> {
        self.lock().entries.drain().map(|(_, e)| e).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Callback {
        Arc::new(|_: &CanonicalEvent| {})
    }

    #[test]
    fn test_first_attach_acquires_once() {
        let registry = Registry::new();
        let (_, first) = registry.attach(EventType::BetPlaced, noop());
        let (_, second) = registry.attach(EventType::BetPlaced, noop());
        let (_, other) = registry.attach(EventType::PoolCreated, noop());

        assert!(matches!(first, Attach::Acquire { .. }));
        assert_eq!(second, Attach::Reused);
        assert!(matches!(other, Attach::Acquire { .. }));
        assert_eq!(registry.state(EventType::BetPlaced), EntryState::PendingUpstream);
        assert_eq!(registry.subscriber_count(EventType::BetPlaced), 2);
    }

    #[test]
    fn test_acquisition_outcomes() {
        let registry = Registry::new();
        let (_, Attach::Acquire { generation }) = registry.attach(EventType::BetPlaced, noop())
        else {
            panic!("expected acquire");
        };
        let leftover =
            registry.complete_acquisition(EventType::BetPlaced, generation, Ok(UpstreamLease::default()));
        assert!(leftover.is_none());
        assert_eq!(registry.state(EventType::BetPlaced), EntryState::Active);

        let (_, Attach::Acquire { generation }) = registry.attach(EventType::CycleResolved, noop())
        else {
            panic!("expected acquire");
        };
        registry.complete_acquisition(
            EventType::CycleResolved,
            generation,
            Err(TransportError::Unavailable(EventType::CycleResolved)),
        );
        assert_eq!(registry.state(EventType::CycleResolved), EntryState::Degraded);

        assert_eq!(registry.take_degraded(), vec![(EventType::CycleResolved, generation)]);
        assert_eq!(registry.state(EventType::CycleResolved), EntryState::PendingUpstream);
        assert!(registry.take_degraded().is_empty());
    }

    #[test]
    fn test_stale_generation_hands_lease_back() {
        let registry = Registry::new();
        let (_, Attach::Acquire { generation }) = registry.attach(EventType::BetPlaced, noop())
        else {
            panic!("expected acquire");
        };
        let leftover = registry.complete_acquisition(
            EventType::BetPlaced,
            generation + 1,
            Ok(UpstreamLease::default()),
        );
        assert!(leftover.is_some());
        assert!(registry
            .complete_acquisition(EventType::PoolSettled, 1, Ok(UpstreamLease::default()))
            .is_some());
    }

    #[test]
    fn test_detach_counts() {
        let registry = Registry::new();
        let (a, _) = registry.attach(EventType::BetPlaced, noop());
        let (b, _) = registry.attach(EventType::BetPlaced, noop());

        assert_eq!(registry.detach(EventType::BetPlaced, a), Detach::Remaining(1));
        assert_eq!(registry.detach(EventType::BetPlaced, a), Detach::NotFound);
        assert!(matches!(
            registry.detach(EventType::BetPlaced, b),
            Detach::LastGone { .. }
        ));
        assert_eq!(registry.detach(EventType::PoolCreated, b), Detach::NotFound);
    }

    #[tokio::test]
    async fn test_grace_cancel_and_finish() {
        let registry = Registry::new();
        let (a, Attach::Acquire { generation }) = registry.attach(EventType::BetPlaced, noop())
        else {
            panic!("expected acquire");
        };
        registry.complete_acquisition(EventType::BetPlaced, generation, Ok(UpstreamLease::default()));

        let Detach::LastGone { generation } = registry.detach(EventType::BetPlaced, a) else {
            panic!("expected last gone");
        };
        registry.arm_teardown(EventType::BetPlaced, generation, tokio::spawn(std::future::pending()));
        assert_eq!(registry.state(EventType::BetPlaced), EntryState::GraceTeardown);

        let (b, resumed) = registry.attach(EventType::BetPlaced, noop());
        assert_eq!(resumed, Attach::Resumed);
        assert_eq!(registry.state(EventType::BetPlaced), EntryState::Active);
        // a teardown firing late for a revived entry does nothing
        assert!(registry.finish_teardown(EventType::BetPlaced, generation).is_none());

        registry.detach(EventType::BetPlaced, b);
        let entry = registry.finish_teardown(EventType::BetPlaced, generation).unwrap();
        assert_eq!(entry.state(), EntryState::Active);
        assert_eq!(registry.state(EventType::BetPlaced), EntryState::Idle);
    }

    #[test]
    fn test_callbacks_in_registration_order() {
        let registry = Registry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            registry.attach(
                EventType::PoolCreated,
                Arc::new(move |_: &CanonicalEvent| order.lock().unwrap().push(i)),
            );
        }
        let event = CanonicalEvent {
            event_type: EventType::PoolCreated,
            entity_id: "1".into(),
            secondary_id: None,
            actor_address: String::new(),
            timestamp: 1,
            fields: Default::default(),
        };
        for cb in registry.callbacks(EventType::PoolCreated) {
            cb(&event);
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
