//! Upstream transports.
//!
//! The [`TransportManager`] owns the single primary client, the optional
//! secondary socket and the polling settings. Acquiring an event type
//! yields an [`UpstreamLease`]; dropping the lease releases everything it
//! opened. All payloads end up on the engine's inbound channel.

pub mod channels;
pub mod poller;
pub mod primary;
pub mod socket;

pub use primary::{AlloyUpstream, UpstreamClient, UpstreamFeed};
pub use socket::{ChannelSet, SocketHandle, SocketSettings};

use crate::events::EventType;
use crate::pipeline::Inbound;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("connection closed unexpectedly")]
    Closed,
    #[error("no transport available for {0}")]
    Unavailable(EventType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Disabled,
    Connecting,
    Connected,
    Disconnected,
}

/// Connection health, observable by UI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStatus {
    pub primary: LinkState,
    pub secondary: LinkState,
    pub last_error: Option<String>,
}

impl TransportStatus {
    /// True when no enabled transport is currently connected.
    pub fn is_degraded(&self) -> bool {
        let enabled = [self.primary, self.secondary]
            .into_iter()
            .filter(|s| *s != LinkState::Disabled)
            .collect::<Vec<_>>();
        !enabled.is_empty() && !enabled.contains(&LinkState::Connected)
    }
}

/// Shared writer for [`TransportStatus`].
#[derive(Clone)]
pub struct StatusReporter {
    tx: Arc<watch::Sender<TransportStatus>>,
    live_primary: Arc<AtomicUsize>,
}

impl StatusReporter {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(TransportStatus::default())),
            live_primary: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TransportStatus> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> TransportStatus {
        self.tx.borrow().clone()
    }

    pub fn set_primary(&self, state: LinkState) {
        self.tx.send_if_modified(|s| {
            let changed = s.primary != state;
            s.primary = state;
            changed
        });
    }

    pub fn set_secondary(&self, state: LinkState) {
        self.tx.send_if_modified(|s| {
            let changed = s.secondary != state;
            s.secondary = state;
            changed
        });
    }

    /// A primary feed is delivering.
    pub fn primary_feed_up(&self) {
        self.live_primary.fetch_add(1, Ordering::SeqCst);
        self.set_primary(LinkState::Connected);
    }

    /// A primary feed ended on its own. The link is reported down only
    /// once no other feed on it is live.
    pub fn primary_feed_ended(&self) {
        if self.release_primary_feed() == 0 {
            self.set_primary(LinkState::Disconnected);
        }
    }

    /// A primary feed was closed by its owner; the link state is untouched.
    pub fn primary_feed_released(&self) {
        self.release_primary_feed();
    }

    pub fn live_primary_feeds(&self) -> usize {
        self.live_primary.load(Ordering::SeqCst)
    }

    fn release_primary_feed(&self) -> usize {
        let previous = self
            .live_primary
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn record_error(&self, error: &dyn fmt::Display) {
        let message = error.to_string();
        self.tx.send_modify(|s| s.last_error = Some(message));
    }
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything opened upstream for one event type. Dropping it aborts the
/// feed tasks and releases the socket channel.
#[derive(Default)]
pub struct UpstreamLease {
    primary: Option<JoinHandle<()>>,
    socket: Option<(SocketHandle, String)>,
    poller: Option<JoinHandle<()>>,
}

impl UpstreamLease {
    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    pub fn socket_channel(&self) -> Option<&str> {
        self.socket.as_ref().map(|(_, ch)| ch.as_str())
    }

    pub fn has_poller(&self) -> bool {
        self.poller.is_some()
    }

    fn is_empty(&self) -> bool {
        self.primary.is_none() && self.socket.is_none() && self.poller.is_none()
    }
}

impl Drop for UpstreamLease {
    fn drop(&mut self) {
        if let Some(task) = self.primary.take() {
            task.abort();
        }
        if let Some(task) = self.poller.take() {
            task.abort();
        }
        if let Some((socket, channel)) = self.socket.take() {
            socket.release(&channel);
        }
    }
}

impl fmt::Debug for UpstreamLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamLease")
            .field("primary", &self.has_primary())
            .field("socket", &self.socket_channel())
            .field("poller", &self.has_poller())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: Duration,
    pub endpoints: HashMap<EventType, String>,
}

pub struct TransportManager {
    upstream: Option<Arc<dyn UpstreamClient>>,
    socket: Option<SocketHandle>,
    poll: Option<PollSettings>,
    http: reqwest::Client,
    inbound: mpsc::UnboundedSender<Inbound>,
    status: StatusReporter,
    reconnect_delay: Duration,
    redundant: bool,
}

impl TransportManager {
    pub fn new(
        upstream: Option<Arc<dyn UpstreamClient>>,
        socket: Option<SocketHandle>,
        poll: Option<PollSettings>,
        inbound: mpsc::UnboundedSender<Inbound>,
        status: StatusReporter,
        reconnect_delay: Duration,
        redundant: bool,
    ) -> Self {
        if upstream.is_some() {
            status.set_primary(LinkState::Disconnected);
        }
        Self {
            upstream,
            socket,
            poll,
            http: reqwest::Client::new(),
            inbound,
            status,
            reconnect_delay,
            redundant,
        }
    }

    /// Open whatever can serve `event_type`: the primary feed first, then
    /// the socket (as fallback, or always when redundant), then polling if
    /// push delivery failed.
    pub async fn acquire(&self, event_type: EventType) -> Result<UpstreamLease, TransportError> {
        let mut lease = UpstreamLease::default();

        if let Some(client) = &self.upstream {
            if self.status.current().primary != LinkState::Connected {
                self.status.set_primary(LinkState::Connecting);
            }
            match client.open(event_type).await {
                Ok(feed) => {
                    self.status.set_primary(LinkState::Connected);
                    lease.primary = Some(primary::spawn_pump(
                        client.clone(),
                        event_type,
                        feed,
                        self.inbound.clone(),
                        self.status.clone(),
                        self.reconnect_delay,
                    ));
                }
                Err(e) => {
                    warn!(event_type = %event_type, error = %e, "primary acquisition failed");
                    self.status.record_error(&e);
                    if self.status.live_primary_feeds() == 0 {
                        self.status.set_primary(LinkState::Disconnected);
                    }
                }
            }
        }

        let push_ok = lease.has_primary();
        if let Some(socket) = &self.socket {
            if !push_ok || self.redundant {
                let channel = channels::type_channel(event_type);
                socket.want(channel);
                lease.socket = Some((socket.clone(), channel.to_string()));
            }
        }

        if !push_ok {
            if let Some(url) = self.poll.as_ref().and_then(|p| p.endpoints.get(&event_type)) {
                let every = self.poll.as_ref().map_or(Duration::from_secs(2), |p| p.interval);
                lease.poller = Some(poller::spawn(
                    self.http.clone(),
                    url.clone(),
                    event_type,
                    every,
                    self.inbound.clone(),
                ));
            }
        }

        if lease.is_empty() {
            return Err(TransportError::Unavailable(event_type));
        }
        info!(event_type = %event_type, lease = ?lease, "upstream acquired");
        Ok(lease)
    }

    pub fn socket(&self) -> Option<&SocketHandle> {
        self.socket.as_ref()
    }

    pub fn status(&self) -> &StatusReporter {
        &self.status
    }

    pub fn shutdown(&self) {
        if let Some(socket) = &self.socket {
            socket.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Payload;
    use futures::future::BoxFuture;
    use futures::{stream, FutureExt, StreamExt};

    struct Failing;

    impl UpstreamClient for Failing {
        fn open(&self, _: EventType) -> BoxFuture<'static, Result<UpstreamFeed, TransportError>> {
            async { Err(TransportError::Rpc("connection refused".into())) }.boxed()
        }
    }

    struct Pending;

    impl UpstreamClient for Pending {
        fn open(&self, _: EventType) -> BoxFuture<'static, Result<UpstreamFeed, TransportError>> {
            async {
                Ok(UpstreamFeed {
                    stream: stream::pending::<Result<Payload, TransportError>>().boxed(),
                })
            }
            .boxed()
        }
    }

    fn socket(tx: &mpsc::UnboundedSender<Inbound>, status: &StatusReporter) -> SocketHandle {
        SocketHandle::new(
            SocketSettings {
                // nothing listens here; the connection task just keeps retrying
                url: "ws://127.0.0.1:9".into(),
                reconnect_delay: Duration::from_secs(3),
                heartbeat: Duration::from_secs(20),
            },
            tx.clone(),
            status.clone(),
        )
    }

    #[tokio::test]
    async fn test_no_transport_is_unavailable() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let status = StatusReporter::new();
        let manager = TransportManager::new(
            Some(Arc::new(Failing)),
            None,
            None,
            tx,
            status.clone(),
            Duration::from_secs(3),
            false,
        );
        let err = manager.acquire(EventType::BetPlaced).await.unwrap_err();
        assert!(matches!(err, TransportError::Unavailable(EventType::BetPlaced)));

        let current = status.current();
        assert_eq!(current.primary, LinkState::Disconnected);
        assert!(current.last_error.unwrap().contains("connection refused"));
        assert!(status.current().is_degraded());
    }

    #[tokio::test]
    async fn test_socket_fallback_and_release() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let status = StatusReporter::new();
        let sock = socket(&tx, &status);
        let manager = TransportManager::new(
            Some(Arc::new(Failing)),
            Some(sock.clone()),
            None,
            tx,
            status,
            Duration::from_secs(3),
            false,
        );

        let lease = manager.acquire(EventType::PoolProgress).await.unwrap();
        assert!(!lease.has_primary());
        assert_eq!(lease.socket_channel(), Some("pools:progress"));
        assert!(sock.is_desired("pools:progress"));

        drop(lease);
        assert!(!sock.is_desired("pools:progress"));
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_primary_success_skips_socket_unless_redundant() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let status = StatusReporter::new();
        let sock = socket(&tx, &status);

        let plain = TransportManager::new(
            Some(Arc::new(Pending)),
            Some(sock.clone()),
            None,
            tx.clone(),
            status.clone(),
            Duration::from_secs(3),
            false,
        );
        let lease = plain.acquire(EventType::BetPlaced).await.unwrap();
        assert!(lease.has_primary());
        assert!(lease.socket_channel().is_none());
        assert_eq!(status.current().primary, LinkState::Connected);

        let redundant = TransportManager::new(
            Some(Arc::new(Pending)),
            Some(sock.clone()),
            None,
            tx,
            status,
            Duration::from_secs(3),
            true,
        );
        let lease = redundant.acquire(EventType::BetPlaced).await.unwrap();
        assert!(lease.has_primary());
        assert_eq!(lease.socket_channel(), Some("bets:recent"));
        sock.shutdown();
    }

    #[test]
    fn test_degraded_status() {
        let mut s = TransportStatus::default();
        assert!(!s.is_degraded());
        s.primary = LinkState::Disconnected;
        assert!(s.is_degraded());
        s.secondary = LinkState::Connected;
        assert!(!s.is_degraded());
    }
}
