//! The stream engine.
//!
//! One [`StreamEngine`] per process owns the registry, the pipeline and the
//! transports. Consumers subscribe with a callback and receive every
//! surviving event for that type, in registration order. Payloads from all
//! transports go through a single dispatch task, so pipeline stages and
//! broadcasts never interleave.
//!
//! The engine spawns tasks, so it must be built and used inside a tokio
//! runtime. A [`Subscription`] dropped outside one releases its upstream
//! immediately, without a grace period.

pub mod consumers;

use crate::config::Config;
use crate::events::{CanonicalEvent, EventType};
use crate::pipeline::{Inbound, Moment, Pipeline, Rejection};
use crate::registry::{Attach, Callback, Detach, EntryState, Registry, SubscriberId};
use crate::storage::{FileKvStore, KvStore, StorageError};
use crate::transport::{
    AlloyUpstream, PollSettings, SocketHandle, SocketSettings, StatusReporter, TransportManager,
    TransportStatus, UpstreamClient,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct EngineInner {
    registry: Registry,
    pipeline: Pipeline,
    transports: TransportManager,
    grace_period: Duration,
    inbound: mpsc::UnboundedSender<Inbound>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct StreamEngine {
    inner: Arc<EngineInner>,
}

pub struct EngineBuilder<'a> {
    config: &'a Config,
    upstream: Option<Arc<dyn UpstreamClient>>,
    store: Option<Arc<dyn KvStore>>,
}

impl<'a> EngineBuilder<'a> {
    /// Use this client instead of the one derived from `[primary]`.
    pub fn upstream(mut self, client: Arc<dyn UpstreamClient>) -> Self {
        self.upstream = Some(client);
        self
    }

    /// Use this store instead of a file store under `[storage] dir`.
    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<StreamEngine, StorageError> {
        let config = self.config;
        let store: Arc<dyn KvStore> = match self.store {
            Some(store) => store,
            None => Arc::new(FileKvStore::open(&config.storage.dir)?),
        };

        let upstream = self.upstream.or_else(|| {
            config.primary.enabled().then(|| {
                Arc::new(AlloyUpstream::new(
                    config.primary.ws_url.clone(),
                    config.primary.pool_address(),
                    config.primary.cycle_address(),
                )) as Arc<dyn UpstreamClient>
            })
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let status = StatusReporter::new();

        let socket = config.secondary.enabled().then(|| {
            SocketHandle::new(
                SocketSettings {
                    url: config.secondary.ws_url.clone(),
                    reconnect_delay: Duration::from_millis(config.secondary.reconnect_delay_ms),
                    heartbeat: Duration::from_secs(config.secondary.heartbeat_secs.max(1)),
                },
                tx.clone(),
                status.clone(),
            )
        });

        let endpoints = config.polling.endpoint_map();
        let poll = (!endpoints.is_empty()).then(|| PollSettings {
            interval: Duration::from_millis(config.polling.interval_ms.max(1)),
            endpoints,
        });

        let transports = TransportManager::new(
            upstream,
            socket,
            poll,
            tx.clone(),
            status,
            config.primary.reconnect_delay(),
            config.secondary.redundant,
        );

        let inner = Arc::new(EngineInner {
            registry: Registry::new(),
            pipeline: Pipeline::from_config(&config.pipeline, store),
            transports,
            grace_period: Duration::from_millis(config.registry.grace_period_ms),
            inbound: tx,
            dispatcher: Mutex::new(None),
        });

        let handle = tokio::spawn(run_dispatch(Arc::downgrade(&inner), rx));
        *lock(&inner.dispatcher) = Some(handle);
        info!("stream engine started");

        Ok(StreamEngine { inner })
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn run_dispatch(engine: Weak<EngineInner>, mut rx: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(msg) = rx.recv().await {
        let Some(inner) = engine.upgrade() else {
            break;
        };
        let event_type = msg.event_type;
        let source = msg.source;
        match inner.dispatch(msg, Moment::now()) {
            Ok(delivered) => {
                debug!(event_type = %event_type, source = %source, delivered, "event broadcast")
            }
            Err(Rejection::NoSubscribers) => {}
            Err(reason) => {
                debug!(event_type = %event_type, source = %source, reason = %reason, "payload dropped")
            }
        }
    }
    debug!("dispatch loop stopped");
}

impl EngineInner {
    fn dispatch(&self, inbound: Inbound, now: Moment) -> Result<usize, Rejection> {
        let event_type = inbound.event_type;
        if !self.registry.has_subscribers(event_type) {
            return Err(Rejection::NoSubscribers);
        }
        let event = self.pipeline.process(&inbound, now)?;
        Ok(self.broadcast(&event))
    }

    fn broadcast(&self, event: &CanonicalEvent) -> usize {
        let callbacks = self.registry.callbacks(event.event_type);
        for callback in &callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!(event_type = %event.event_type, entity = %event.entity_id, "consumer callback panicked");
            }
        }
        callbacks.len()
    }

    fn detach(self: &Arc<Self>, event_type: EventType, id: SubscriberId, channels: &[String]) {
        if let Some(socket) = self.transports.socket() {
            for channel in channels {
                socket.release(channel);
            }
        }

        match self.registry.detach(event_type, id) {
            Detach::LastGone { generation } => {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    // no runtime to run a grace timer on: release now
                    if let Some(entry) = self.registry.finish_teardown(event_type, generation) {
                        info!(event_type = %event_type, "upstream released outside runtime");
                        drop(entry);
                    }
                    return;
                };
                debug!(event_type = %event_type, grace = ?self.grace_period, "last subscriber gone");
                let weak = Arc::downgrade(self);
                let grace = self.grace_period;
                let timer = runtime.spawn(async move {
                    tokio::time::sleep(grace).await;
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    if let Some(entry) = inner.registry.finish_teardown(event_type, generation) {
                        info!(event_type = %event_type, "upstream released after grace period");
                        drop(entry);
                    }
                });
                self.registry.arm_teardown(event_type, generation, timer);
            }
            Detach::Remaining(n) => debug!(event_type = %event_type, remaining = n, "subscriber left"),
            Detach::NotFound => {}
        }
    }

    fn spawn_acquire(self: &Arc<Self>, event_type: EventType, generation: u64) {
        let inner = self.clone();
        tokio::spawn(async move {
            let result = inner.transports.acquire(event_type).await;
            if let Some(leftover) = inner.registry.complete_acquisition(event_type, generation, result) {
                debug!(event_type = %event_type, "discarding lease for a released entry");
                drop(leftover);
            }
        });
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.dispatcher).take() {
            handle.abort();
        }
        self.transports.shutdown();
    }
}

impl StreamEngine {
    pub fn builder(config: &Config) -> EngineBuilder<'_> {
        EngineBuilder {
            config,
            upstream: None,
            store: None,
        }
    }

    /// Register `callback` for `event_type`. The first subscriber for a type
    /// opens its upstream in the background; this call never waits for it.
    pub fn subscribe<F>(&self, event_type: EventType, callback: F) -> Subscription
    where
        F: Fn(&CanonicalEvent) + Send + Sync + 'static,
    {
        self.attach(event_type, Arc::new(callback), Vec::new())
    }

    pub(crate) fn attach(
        &self,
        event_type: EventType,
        callback: Callback,
        channels: Vec<String>,
    ) -> Subscription {
        let (id, outcome) = self.inner.registry.attach(event_type, callback);
        match outcome {
            Attach::Acquire { generation } => {
                info!(event_type = %event_type, "acquiring upstream");
                self.inner.spawn_acquire(event_type, generation);
            }
            Attach::Resumed => info!(event_type = %event_type, "reusing upstream within grace period"),
            Attach::Reused => debug!(event_type = %event_type, subscriber = %id, "subscriber added"),
        }

        let channels = match self.inner.transports.socket() {
            Some(socket) => {
                for channel in &channels {
                    socket.want(channel);
                }
                channels
            }
            None => Vec::new(),
        };

        Subscription {
            engine: Arc::downgrade(&self.inner),
            event_type,
            id,
            channels,
            active: true,
        }
    }

    /// Feed a payload through the pipeline now, bypassing the transports.
    pub fn ingest(&self, inbound: Inbound) -> Result<usize, Rejection> {
        self.ingest_at(inbound, Moment::now())
    }

    /// As [`ingest`](Self::ingest), at an explicit moment.
    pub fn ingest_at(&self, inbound: Inbound, now: Moment) -> Result<usize, Rejection> {
        self.inner.dispatch(inbound, now)
    }

    /// Queue a payload behind everything the transports have delivered.
    pub fn sender(&self) -> mpsc::UnboundedSender<Inbound> {
        self.inner.inbound.clone()
    }

    /// Retry acquisition for every degraded event type.
    pub fn reconnect(&self) -> usize {
        let retry = self.inner.registry.take_degraded();
        for (event_type, generation) in &retry {
            info!(event_type = %event_type, "retrying upstream acquisition");
            self.inner.spawn_acquire(*event_type, *generation);
        }
        retry.len()
    }

    pub fn status(&self) -> watch::Receiver<TransportStatus> {
        self.inner.transports.status().subscribe()
    }

    pub fn current_status(&self) -> TransportStatus {
        self.inner.transports.status().current()
    }

    pub fn entry_state(&self, event_type: EventType) -> EntryState {
        self.inner.registry.state(event_type)
    }

    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.inner.registry.subscriber_count(event_type)
    }

    /// Stop dispatching and release every upstream.
    pub fn shutdown(&self) {
        if let Some(handle) = lock(&self.inner.dispatcher).take() {
            handle.abort();
        }
        let entries = self.inner.registry.drain();
        if !entries.is_empty() {
            info!(entries = entries.len(), "releasing upstreams");
        }
        drop(entries);
        self.inner.transports.shutdown();
        info!("stream engine stopped");
    }
}

/// Handle for one registered callback. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    engine: Weak<EngineInner>,
    event_type: EventType,
    id: SubscriberId,
    channels: Vec<String>,
    active: bool,
}

impl Subscription {
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Socket channels held open for this subscription only.
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        match self.engine.upgrade() {
            Some(inner) => inner.detach(self.event_type, self.id, &self.channels),
            None => warn!(event_type = %self.event_type, "engine dropped before unsubscribe"),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
