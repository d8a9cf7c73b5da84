//! Primary push transport.
//!
//! [`UpstreamClient`] is the seam the engine talks to: open a feed for one
//! event type and get a stream of payloads back. [`AlloyUpstream`] is the
//! production client over an Ethereum JSON-RPC WebSocket; the pump keeps a
//! feed alive by re-opening it after a fixed delay whenever it ends.

use crate::decode::abi;
use crate::decode::{Payload, RawLog};
use crate::events::EventType;
use crate::pipeline::{Inbound, Source};
use crate::transport::{StatusReporter, TransportError};

use alloy::primitives::Address;
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::Filter;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// An open upstream feed.
pub struct UpstreamFeed {
    pub stream: BoxStream<'static, Result<Payload, TransportError>>,
}

pub trait UpstreamClient: Send + Sync {
    /// Open the logical channel for `event_type`.
    fn open(&self, event_type: EventType) -> BoxFuture<'static, Result<UpstreamFeed, TransportError>>;
}

/// Log subscriptions over one shared WebSocket provider.
pub struct AlloyUpstream {
    url: String,
    pool_contract: Option<Address>,
    cycle_contract: Option<Address>,
    provider: Arc<Mutex<Option<DynProvider>>>,
}

impl AlloyUpstream {
    pub fn new(url: String, pool_contract: Option<Address>, cycle_contract: Option<Address>) -> Self {
        Self {
            url,
            pool_contract,
            cycle_contract,
            provider: Arc::new(Mutex::new(None)),
        }
    }

    fn filter(&self, event_type: EventType) -> Filter {
        let contract = if event_type.is_cycle_event() {
            self.cycle_contract
        } else {
            self.pool_contract
        };
        let filter = Filter::new().event_signature(abi::topic0(event_type));
        match contract {
            Some(address) => filter.address(address),
            None => filter,
        }
    }
}

/// The provider is created on first use and shared by every feed. A failed
/// subscription drops it so the next attempt reconnects.
async fn shared_provider(
    slot: &Mutex<Option<DynProvider>>,
    url: &str,
) -> Result<DynProvider, TransportError> {
    let mut guard = slot.lock().await;
    if let Some(provider) = guard.as_ref() {
        return Ok(provider.clone());
    }
    info!(url = %url, "connecting upstream provider");
    let provider = ProviderBuilder::new()
        .connect_ws(WsConnect::new(url))
        .await
        .map_err(|e| TransportError::Rpc(e.to_string()))?
        .erased();
    *guard = Some(provider.clone());
    Ok(provider)
}

impl UpstreamClient for AlloyUpstream {
    fn open(&self, event_type: EventType) -> BoxFuture<'static, Result<UpstreamFeed, TransportError>> {
        let slot = self.provider.clone();
        let url = self.url.clone();
        let filter = self.filter(event_type);

        async move {
            let provider = shared_provider(&slot, &url).await?;
            let sub = match provider.subscribe_logs(&filter).await {
                Ok(sub) => sub,
                Err(e) => {
                    slot.lock().await.take();
                    return Err(TransportError::Rpc(e.to_string()));
                }
            };
            info!(channel = event_type.upstream_channel(), "subscribed upstream logs");

            let stream = sub
                .into_stream()
                .map(|log| Ok(Payload::Log(RawLog::from(&log))))
                .boxed();
            Ok(UpstreamFeed { stream })
        }
        .boxed()
    }
}

/// Counts one feed as live on the shared primary link while it delivers.
struct LiveFeed {
    status: StatusReporter,
    up: bool,
}

impl LiveFeed {
    fn up(&mut self) {
        if !self.up {
            self.up = true;
            self.status.primary_feed_up();
        }
    }

    fn ended(&mut self) {
        if self.up {
            self.up = false;
            self.status.primary_feed_ended();
        }
    }
}

impl Drop for LiveFeed {
    fn drop(&mut self) {
        if self.up {
            self.status.primary_feed_released();
        }
    }
}

/// Forward a feed into the engine, re-opening it whenever it ends.
pub(crate) fn spawn_pump(
    client: Arc<dyn UpstreamClient>,
    event_type: EventType,
    feed: UpstreamFeed,
    inbound: mpsc::UnboundedSender<Inbound>,
    status: StatusReporter,
    reconnect_delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut live = LiveFeed {
            status: status.clone(),
            up: false,
        };
        live.up();
        let mut stream = feed.stream;
        loop {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(payload) => {
                        let msg = Inbound::new(event_type, payload, Source::Primary);
                        if inbound.send(msg).is_err() {
                            return;
                        }
                    }
                    Err(e) => debug!(event_type = %event_type, error = %e, "upstream item error"),
                }
            }

            warn!(event_type = %event_type, "upstream feed ended");
            live.ended();

            stream = loop {
                tokio::time::sleep(reconnect_delay).await;
                if inbound.is_closed() {
                    return;
                }
                match client.open(event_type).await {
                    Ok(feed) => {
                        info!(event_type = %event_type, "upstream feed re-opened");
                        live.up();
                        break feed.stream;
                    }
                    Err(e) => {
                        warn!(event_type = %event_type, error = %e, "upstream re-open failed");
                        status.record_error(&e);
                    }
                }
            };
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LinkState;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct OneShot {
        opens: AtomicUsize,
    }

    impl UpstreamClient for OneShot {
        fn open(&self, _: EventType) -> BoxFuture<'static, Result<UpstreamFeed, TransportError>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let item = Ok(Payload::Text(r#"{"poolId":1}"#.into()));
            async move {
                Ok(UpstreamFeed {
                    stream: stream::iter(vec![item]).boxed(),
                })
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_reopens_after_delay() {
        let client = Arc::new(OneShot {
            opens: AtomicUsize::new(0),
        });
        let feed = client.open(EventType::PoolCreated).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pump = spawn_pump(
            client.clone(),
            EventType::PoolCreated,
            feed,
            tx,
            StatusReporter::new(),
            Duration::from_secs(3),
        );

        assert!(rx.recv().await.is_some());
        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert_eq!(client.opens.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.recv().await.is_some());
        assert_eq!(client.opens.load(Ordering::SeqCst), 2);
        pump.abort();
    }

    struct Refusing;

    impl UpstreamClient for Refusing {
        fn open(&self, _: EventType) -> BoxFuture<'static, Result<UpstreamFeed, TransportError>> {
            async { Err(TransportError::Rpc("connection refused".into())) }.boxed()
        }
    }

    fn pending_feed() -> (
        futures::channel::mpsc::UnboundedSender<Result<Payload, TransportError>>,
        UpstreamFeed,
    ) {
        let (tx, rx) = futures::channel::mpsc::unbounded();
        (tx, UpstreamFeed { stream: rx.boxed() })
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_link_down_only_when_last_feed_ends() {
        let status = StatusReporter::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let client: Arc<dyn UpstreamClient> = Arc::new(Refusing);
        let delay = Duration::from_secs(3600);

        let (end_bets, bets) = pending_feed();
        let (_keep_pools, pools) = pending_feed();
        let (end_cycles, cycles) = pending_feed();
        let _bets = spawn_pump(client.clone(), EventType::BetPlaced, bets, tx.clone(), status.clone(), delay);
        let pools = spawn_pump(client.clone(), EventType::PoolCreated, pools, tx.clone(), status.clone(), delay);
        let _cycles = spawn_pump(client, EventType::CycleResolved, cycles, tx, status.clone(), delay);
        settle().await;
        assert_eq!(status.live_primary_feeds(), 3);
        assert_eq!(status.current().primary, LinkState::Connected);

        drop(end_bets);
        settle().await;
        assert_eq!(status.live_primary_feeds(), 2);
        assert_eq!(status.current().primary, LinkState::Connected);

        // closing a feed on purpose never marks the link down
        pools.abort();
        settle().await;
        assert_eq!(status.live_primary_feeds(), 1);
        assert_eq!(status.current().primary, LinkState::Connected);

        drop(end_cycles);
        settle().await;
        assert_eq!(status.live_primary_feeds(), 0);
        assert_eq!(status.current().primary, LinkState::Disconnected);
    }

    #[test]
    fn test_filter_targets_contract_by_family() {
        let pool = Address::repeat_byte(0x11);
        let cycle = Address::repeat_byte(0x22);
        let upstream = AlloyUpstream::new("ws://localhost:8546".into(), Some(pool), Some(cycle));

        let f = upstream.filter(EventType::CycleResolved);
        assert!(f.address.matches(&cycle));
        assert!(!f.address.matches(&pool));
        let f = upstream.filter(EventType::BetPlaced);
        assert!(f.address.matches(&pool));
    }
}
