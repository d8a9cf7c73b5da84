//! Bounded, persisted dedupe sets.
//!
//! One FIFO-evicting key set per event type, plus a list of cycle ids whose
//! resolution has already been delivered. Every mark is mirrored to the
//! key-value store so a restart does not re-deliver what was already shown.
//!
//! Inside a tokio runtime the mirror is write-behind: snapshots go to a
//! writer task that coalesces them per key and writes on the blocking pool.
//! Snapshots still queued when the process exits are lost.

use crate::events::EventType;
use crate::storage::{KvStore, StorageError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const KEY_PREFIX: &str = "poolstream:dedupe";
const SEEN_CYCLES_KEY: &str = "poolstream:seen-cycles";

/// Insertion-ordered set that drops its oldest entry once over capacity.
#[derive(Debug, Clone)]
pub struct BoundedKeySet {
    capacity: usize,
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl BoundedKeySet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.members.contains(key)
    }

    /// Returns false if the key was already present.
    pub fn insert(&mut self, key: String) -> bool {
        if self.members.contains(&key) {
            return false;
        }
        self.members.insert(key.clone());
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.order.iter()
    }
}

enum StateWriter {
    Inline(Arc<dyn KvStore>),
    Background(mpsc::UnboundedSender<(String, String)>),
}

impl StateWriter {
    fn new(store: Arc<dyn KvStore>) -> Self {
        match Handle::try_current() {
            Ok(runtime) => {
                let (tx, rx) = mpsc::unbounded_channel();
                runtime.spawn(run_writer(store, rx));
                StateWriter::Background(tx)
            }
            Err(_) => StateWriter::Inline(store),
        }
    }

    fn put(&self, key: &str, json: String) {
        match self {
            StateWriter::Inline(store) => {
                if let Err(e) = store.put(key, &json) {
                    warn!(key, error = %e, "failed to persist dedupe state");
                }
            }
            StateWriter::Background(tx) => {
                if tx.send((key.to_string(), json)).is_err() {
                    warn!(key, "dedupe writer stopped, state not persisted");
                }
            }
        }
    }
}

/// Drain queued snapshots, keep the newest per key, write them off-thread.
async fn run_writer(store: Arc<dyn KvStore>, mut rx: mpsc::UnboundedReceiver<(String, String)>) {
    while let Some((key, json)) = rx.recv().await {
        let mut batch = HashMap::new();
        batch.insert(key, json);
        while let Ok((key, json)) = rx.try_recv() {
            batch.insert(key, json);
        }

        let store = store.clone();
        let written = tokio::task::spawn_blocking(move || {
            for (key, json) in batch {
                if let Err(e) = store.put(&key, &json) {
                    warn!(key = %key, error = %e, "failed to persist dedupe state");
                }
            }
        })
        .await;
        if let Err(e) = written {
            warn!(error = %e, "dedupe writer batch failed");
        }
    }
}

pub struct DedupeStore {
    writer: StateWriter,
    capacity: usize,
    sets: HashMap<EventType, BoundedKeySet>,
    seen_cycles: BoundedKeySet,
}

impl DedupeStore {
    /// Load persisted state. Unreadable or corrupt entries are discarded.
    pub fn load(store: Arc<dyn KvStore>, capacity: usize, seen_cycles_capacity: usize) -> Self {
        let mut sets = HashMap::new();
        for event_type in EventType::ALL {
            let mut set = BoundedKeySet::new(capacity);
            for key in load_list(store.as_ref(), &storage_key(event_type)) {
                set.insert(key);
            }
            if !set.is_empty() {
                debug!(event_type = %event_type, keys = set.len(), "restored dedupe keys");
            }
            sets.insert(event_type, set);
        }

        let mut seen_cycles = BoundedKeySet::new(seen_cycles_capacity);
        for id in load_list(store.as_ref(), SEEN_CYCLES_KEY) {
            seen_cycles.insert(id);
        }

        Self {
            writer: StateWriter::new(store),
            capacity,
            sets,
            seen_cycles,
        }
    }

    pub fn seen(&self, event_type: EventType, key: &str) -> bool {
        self.sets
            .get(&event_type)
            .is_some_and(|set| set.contains(key))
    }

    pub fn mark(&mut self, event_type: EventType, key: &str) {
        let capacity = self.capacity;
        let set = self
            .sets
            .entry(event_type)
            .or_insert_with(|| BoundedKeySet::new(capacity));
        if set.insert(key.to_string()) {
            persist(&self.writer, &storage_key(event_type), set);
        }
    }

    /// Atomically test and record. Returns true if the key is new.
    pub fn check_and_mark(&mut self, event_type: EventType, key: &str) -> bool {
        if self.seen(event_type, key) {
            return false;
        }
        self.mark(event_type, key);
        true
    }

    pub fn cycle_seen(&self, cycle_id: &str) -> bool {
        self.seen_cycles.contains(cycle_id)
    }

    /// Record a delivered cycle resolution. Returns false if already seen.
    pub fn mark_cycle(&mut self, cycle_id: &str) -> bool {
        if !self.seen_cycles.insert(cycle_id.to_string()) {
            return false;
        }
        persist(&self.writer, SEEN_CYCLES_KEY, &self.seen_cycles);
        true
    }

    pub fn len(&self, event_type: EventType) -> usize {
        self.sets.get(&event_type).map_or(0, BoundedKeySet::len)
    }
}

fn storage_key(event_type: EventType) -> String {
    format!("{KEY_PREFIX}:{event_type}")
}

fn load_list(store: &dyn KvStore, key: &str) -> Vec<String> {
    let raw = match store.get(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return Vec::new(),
        Err(e) => {
            warn!(key, error = %e, "failed to read persisted dedupe state");
            return Vec::new();
        }
    };
    match serde_json::from_str::<Vec<String>>(&raw) {
        Ok(list) => list,
        Err(e) => {
            warn!(key, error = %e, "discarding corrupt dedupe state");
            Vec::new()
        }
    }
}

fn persist(writer: &StateWriter, key: &str, set: &BoundedKeySet) {
    let list: Vec<&String> = set.iter().collect();
    match serde_json::to_string(&list) {
        Ok(json) => writer.put(key, json),
        Err(e) => warn!(key, error = %StorageError::from(e), "failed to serialise dedupe state"),
    }
}
