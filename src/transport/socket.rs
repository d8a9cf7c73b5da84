//! Secondary socket transport.
//!
//! One background connection, started on first use, multiplexing every
//! requested channel. The set of desired channels survives reconnects;
//! on every (re)connect only channels still desired are re-subscribed.
//!
//! Frames are JSON text: `{type: "update"|"connected"|"subscribed",
//! channel, data}` inbound, `{type: "subscribe"|"unsubscribe", channel}`
//! outbound.

use crate::decode::Payload;
use crate::pipeline::{Inbound, Source};
use crate::transport::{channels, LinkState, StatusReporter, TransportError};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Desired channels (reference counted) versus channels the server has
/// acknowledged on the current connection.
#[derive(Debug, Default)]
pub struct ChannelSet {
    desired: HashMap<String, usize>,
    acknowledged: HashSet<String>,
}

impl ChannelSet {
    /// Returns true if the channel was not desired before.
    pub fn want(&mut self, channel: &str) -> bool {
        let count = self.desired.entry(channel.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Returns true if nobody wants the channel any more.
    pub fn release(&mut self, channel: &str) -> bool {
        match self.desired.get_mut(channel) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.desired.remove(channel);
                true
            }
            None => false,
        }
    }

    pub fn acknowledge(&mut self, channel: &str) {
        if self.desired.contains_key(channel) {
            self.acknowledged.insert(channel.to_string());
        }
    }

    pub fn forget(&mut self, channel: &str) {
        self.acknowledged.remove(channel);
    }

    /// Start of a new connection: nothing is acknowledged, everything
    /// desired must be requested again.
    pub fn reset(&mut self) -> Vec<String> {
        self.acknowledged.clear();
        let mut channels: Vec<String> = self.desired.keys().cloned().collect();
        channels.sort();
        channels
    }

    pub fn is_desired(&self, channel: &str) -> bool {
        self.desired.contains_key(channel)
    }

    pub fn is_acknowledged(&self, channel: &str) -> bool {
        self.acknowledged.contains(channel)
    }
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Serialize)]
struct ControlFrame<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    channel: &'a str,
}

#[derive(Debug)]
enum Command {
    Subscribe(String),
    Unsubscribe(String),
}

#[derive(Debug, Clone)]
pub struct SocketSettings {
    pub url: String,
    pub reconnect_delay: Duration,
    pub heartbeat: Duration,
}

struct Shared {
    settings: SocketSettings,
    channels: Mutex<ChannelSet>,
    commands: mpsc::UnboundedSender<Command>,
    pending_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    inbound: mpsc::UnboundedSender<Inbound>,
    status: StatusReporter,
}

/// Cheap handle onto the shared socket connection.
#[derive(Clone)]
pub struct SocketHandle {
    shared: Arc<Shared>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SocketHandle {
    pub fn new(
        settings: SocketSettings,
        inbound: mpsc::UnboundedSender<Inbound>,
        status: StatusReporter,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        status.set_secondary(LinkState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                settings,
                channels: Mutex::new(ChannelSet::default()),
                commands,
                pending_rx: Mutex::new(Some(rx)),
                task: Mutex::new(None),
                inbound,
                status,
            }),
        }
    }

    /// Request a channel, connecting the socket if this is the first use.
    pub fn want(&self, channel: &str) {
        let newly = lock(&self.shared.channels).want(channel);
        self.ensure_running();
        if newly {
            debug!(channel, "requesting socket channel");
            let _ = self.shared.commands.send(Command::Subscribe(channel.to_string()));
        }
    }

    pub fn release(&self, channel: &str) {
        if lock(&self.shared.channels).release(channel) {
            debug!(channel, "releasing socket channel");
            let _ = self.shared.commands.send(Command::Unsubscribe(channel.to_string()));
        }
    }

    pub fn is_desired(&self, channel: &str) -> bool {
        lock(&self.shared.channels).is_desired(channel)
    }

    pub fn is_acknowledged(&self, channel: &str) -> bool {
        lock(&self.shared.channels).is_acknowledged(channel)
    }

    pub fn shutdown(&self) {
        if let Some(task) = lock(&self.shared.task).take() {
            task.abort();
        }
        self.shared.status.set_secondary(LinkState::Disabled);
    }

    fn ensure_running(&self) {
        let mut task = lock(&self.shared.task);
        if task.is_some() {
            return;
        }
        let Some(rx) = lock(&self.shared.pending_rx).take() else {
            return;
        };
        let shared = self.shared.clone();
        *task = Some(tokio::spawn(async move {
            run_socket(shared, rx).await;
        }));
    }
}

async fn run_socket(shared: Arc<Shared>, mut commands: mpsc::UnboundedReceiver<Command>) {
    let delay = shared.settings.reconnect_delay;
    loop {
        info!(url = %shared.settings.url, "connecting to secondary socket");
        shared.status.set_secondary(LinkState::Connecting);

        match connect_and_stream(&shared, &mut commands).await {
            Ok(()) => info!("secondary socket closed"),
            Err(e) => {
                error!(error = %e, "secondary socket error");
                shared.status.record_error(&e);
            }
        }
        if shared.inbound.is_closed() {
            return;
        }
        shared.status.set_secondary(LinkState::Disconnected);

        info!(delay = ?delay, "reconnecting to secondary socket");
        tokio::time::sleep(delay).await;
    }
}

async fn connect_and_stream(
    shared: &Shared,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> Result<(), TransportError> {
    let (ws_stream, _response) = connect_async(shared.settings.url.as_str()).await?;
    let (mut write, mut read) = ws_stream.split();

    // Commands queued while disconnected are superseded by the desired set.
    while commands.try_recv().is_ok() {}
    let resubscribe = lock(&shared.channels).reset();
    for channel in &resubscribe {
        write.send(control("subscribe", channel)?).await?;
    }
    info!(channels = resubscribe.len(), "secondary socket connected");
    shared.status.set_secondary(LinkState::Connected);

    let mut heartbeat = interval(shared.settings.heartbeat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => handle_text(shared, &text),
                Some(Ok(Message::Ping(payload))) => write.send(Message::Pong(payload)).await?,
                Some(Ok(Message::Pong(_))) => debug!("secondary socket pong"),
                Some(Ok(Message::Close(frame))) => {
                    info!(frame = ?frame, "secondary socket received close frame");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Err(TransportError::Closed),
            },
            cmd = commands.recv() => match cmd {
                Some(Command::Subscribe(channel)) => {
                    write.send(control("subscribe", &channel)?).await?;
                }
                Some(Command::Unsubscribe(channel)) => {
                    lock(&shared.channels).forget(&channel);
                    write.send(control("unsubscribe", &channel)?).await?;
                }
                None => return Ok(()),
            },
            _ = heartbeat.tick() => {
                write.send(Message::Ping(Vec::new())).await?;
            }
        }
    }
}

fn control(kind: &str, channel: &str) -> Result<Message, TransportError> {
    let frame = serde_json::to_string(&ControlFrame { kind, channel })?;
    Ok(Message::Text(frame))
}

fn handle_text(shared: &Shared, text: &str) {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "ignoring unparsable socket frame");
            return;
        }
    };
    let channel = frame.channel.unwrap_or_default();

    match frame.kind.as_str() {
        "connected" => debug!("secondary socket handshake"),
        "subscribed" => {
            debug!(channel = %channel, "socket channel acknowledged");
            lock(&shared.channels).acknowledge(&channel);
        }
        "update" => {
            let Some((event_type, entity)) = channels::route(&channel) else {
                debug!(channel = %channel, "update on unknown channel");
                return;
            };
            let mut msg = Inbound::new(event_type, Payload::from_value(frame.data), Source::Socket);
            if let Some(entity) = entity {
                msg = msg.with_entity_hint(entity);
            }
            if shared.inbound.send(msg).is_err() {
                warn!("engine gone, dropping socket update");
            }
        }
        other => debug!(kind = other, channel = %channel, "unhandled socket frame"),
    }
}
