//! TCP feed client
//!
//! Multiplexes any number of channels over one connection to a relay.
//! Channels are keyed by topic on the wire. A lost connection is re-established
//! with backoff and every open topic is subscribed again.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::{ChangeFilter, ChannelStatus, Message};
use crate::transport::{ChannelId, FeedTransport, Signal, Subscription, CHANNEL_BUFFER};

/// Interval between keepalive pings
const KEEPALIVE_INTERVAL_MS: u64 = 15_000;

/// Backoff delays between reconnect attempts: 1s, 2s, 5s, 10s, 30s (capped)
const RECONNECT_DELAYS_MS: &[u64] = &[1000, 2000, 5000, 10000, 30000];

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    /// Closed for good; subscribing fails
    Disconnected,
    Connected,
    /// Lost the relay, retrying with backoff
    Reconnecting,
}

struct ClientChannel {
    id: ChannelId,
    filters: Vec<ChangeFilter>,
    tx: mpsc::Sender<Signal>,
}

struct ClientState {
    connection: ConnectionState,
    /// Open channels by topic, kept across reconnects
    channels: HashMap<String, ClientChannel>,
}

enum ClientCommand {
    Subscribe(String),
    Unsubscribe(String),
    Disconnect,
}

/// How one connection ended
enum SessionEnd {
    Requested,
    Lost,
}

/// Feed transport connected to a relay over TCP
#[derive(Clone)]
pub struct TcpFeed {
    state: Arc<RwLock<ClientState>>,
    cmd_tx: mpsc::Sender<ClientCommand>,
}

impl TcpFeed {
    /// Connect to a relay
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect_with_backoff(addr, RECONNECT_DELAYS_MS).await
    }

    pub(crate) async fn connect_with_backoff(
        addr: SocketAddr,
        backoff_ms: &'static [u64],
    ) -> Result<Self> {
        info!(addr = %addr, "Connecting to feed relay");
        let stream = TcpStream::connect(addr).await?;

        let state = Arc::new(RwLock::new(ClientState {
            connection: ConnectionState::Connected,
            channels: HashMap::new(),
        }));
        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_BUFFER);

        tokio::spawn(connection_task(
            addr,
            stream,
            state.clone(),
            cmd_rx,
            backoff_ms,
        ));

        Ok(Self { state, cmd_tx })
    }

    #[cfg(test)]
    pub(crate) async fn connection_state(&self) -> ConnectionState {
        self.state.read().await.connection
    }

    /// Close the connection and stop reconnecting; every open channel receives `CLOSED`
    pub async fn disconnect(&self) {
        if self.cmd_tx.send(ClientCommand::Disconnect).await.is_err() {
            debug!("Feed connection already stopped");
        }
    }
}

impl FeedTransport for TcpFeed {
    async fn subscribe(&self, topic: &str, filters: Vec<ChangeFilter>) -> Result<Subscription> {
        let id = ChannelId::new();
        let (tx, signals) = mpsc::channel(CHANNEL_BUFFER);

        // Register first so the relay's status reply has somewhere to go
        {
            let mut s = self.state.write().await;
            if s.connection == ConnectionState::Disconnected {
                return Err(Error::NotConnected);
            }
            if s.channels.contains_key(topic) {
                return Err(Error::Rejected(format!("topic {} already open", topic)));
            }
            s.channels
                .insert(topic.to_string(), ClientChannel { id, filters, tx });
        }

        if self
            .cmd_tx
            .send(ClientCommand::Subscribe(topic.to_string()))
            .await
            .is_err()
        {
            self.state.write().await.channels.remove(topic);
            return Err(Error::NotConnected);
        }

        debug!(channel = %id, topic = %topic, "Subscribe queued");
        Ok(Subscription {
            id,
            topic: topic.to_string(),
            signals,
        })
    }

    async fn unsubscribe(&self, id: ChannelId) {
        let topic = {
            let mut s = self.state.write().await;
            let topic = s
                .channels
                .iter()
                .find(|(_, c)| c.id == id)
                .map(|(topic, _)| topic.clone());
            if let Some(topic) = &topic {
                s.channels.remove(topic);
            }
            topic
        };

        if let Some(topic) = topic {
            if self
                .cmd_tx
                .send(ClientCommand::Unsubscribe(topic))
                .await
                .is_err()
            {
                debug!(channel = %id, "Unsubscribe not sent, connection gone");
            }
        }
    }
}

/// Owns the socket for the life of the feed, reconnecting whenever it is lost
async fn connection_task(
    addr: SocketAddr,
    mut stream: TcpStream,
    state: Arc<RwLock<ClientState>>,
    mut cmd_rx: mpsc::Receiver<ClientCommand>,
    backoff_ms: &'static [u64],
) {
    loop {
        if let SessionEnd::Requested = run_session(stream, &state, &mut cmd_rx).await {
            break;
        }

        warn!(addr = %addr, "Lost connection to feed relay");
        state.write().await.connection = ConnectionState::Reconnecting;
        broadcast_status(&state, ChannelStatus::TimedOut, false).await;

        match reconnect(addr, &mut cmd_rx, backoff_ms).await {
            Some(next) => {
                state.write().await.connection = ConnectionState::Connected;
                stream = next;
            }
            None => break,
        }
    }

    state.write().await.connection = ConnectionState::Disconnected;
    broadcast_status(&state, ChannelStatus::Closed, true).await;
    info!("Disconnected from feed relay");
}

/// Serve one connection until it drops or a disconnect is requested.
///
/// Every registered topic is subscribed on entry, so a fresh connection picks
/// up where the lost one left off.
async fn run_session(
    stream: TcpStream,
    state: &Arc<RwLock<ClientState>>,
    cmd_rx: &mut mpsc::Receiver<ClientCommand>,
) -> SessionEnd {
    let (reader, mut writer) = tokio::io::split(stream);
    let (closed_tx, mut closed_rx) = oneshot::channel();
    let reader = tokio::spawn(reader_task(reader, state.clone(), closed_tx));

    // Topics the relay has been asked for on this connection
    let mut announced: HashSet<String> = HashSet::new();
    let topics: Vec<String> = state.read().await.channels.keys().cloned().collect();

    let mut keepalive = tokio::time::interval(Duration::from_millis(KEEPALIVE_INTERVAL_MS));
    keepalive.tick().await;

    let mut end = SessionEnd::Lost;
    let mut healthy = true;
    for topic in topics {
        if let Err(e) = announce(&mut writer, state, &mut announced, topic).await {
            warn!(error = %e, "Resubscribe failed");
            healthy = false;
            break;
        }
    }

    while healthy {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let written = match cmd {
                    Some(ClientCommand::Subscribe(topic)) => {
                        announce(&mut writer, state, &mut announced, topic).await
                    }
                    Some(ClientCommand::Unsubscribe(topic)) => {
                        if announced.remove(&topic) {
                            write_frame(&mut writer, &Message::Unsubscribe { topic }).await
                        } else {
                            Ok(())
                        }
                    }
                    Some(ClientCommand::Disconnect) | None => {
                        debug!("Disconnect requested");
                        end = SessionEnd::Requested;
                        break;
                    }
                };
                if let Err(e) = written {
                    warn!(error = %e, "Write error");
                    break;
                }
            }

            _ = &mut closed_rx => break,

            _ = keepalive.tick() => {
                if let Err(e) = write_frame(&mut writer, &Message::Ping).await {
                    warn!(error = %e, "Keepalive failed");
                    break;
                }
            }
        }
    }

    reader.abort();
    let _ = writer.shutdown().await;
    end
}

/// Send `Subscribe` for a topic unless it is gone or already sent on this connection
async fn announce<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    state: &Arc<RwLock<ClientState>>,
    announced: &mut HashSet<String>,
    topic: String,
) -> Result<()> {
    if announced.contains(&topic) {
        return Ok(());
    }
    let filters = match state.read().await.channels.get(&topic) {
        Some(channel) => channel.filters.clone(),
        None => return Ok(()),
    };
    write_frame(
        writer,
        &Message::Subscribe {
            topic: topic.clone(),
            filters,
        },
    )
    .await?;
    announced.insert(topic);
    Ok(())
}

/// Wait out the backoff and dial again. `None` if the feed was shut down meanwhile.
async fn reconnect(
    addr: SocketAddr,
    cmd_rx: &mut mpsc::Receiver<ClientCommand>,
    backoff_ms: &'static [u64],
) -> Option<TcpStream> {
    let mut attempt = 0;
    loop {
        let delay_ms = backoff_ms[attempt.min(backoff_ms.len() - 1)];
        info!(attempt = attempt + 1, delay_ms = delay_ms, "Reconnect backoff");

        let sleep = tokio::time::sleep(Duration::from_millis(delay_ms));
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(ClientCommand::Disconnect) | None => {
                        info!("Reconnect cancelled");
                        return None;
                    }
                    // Open topics are replayed from the registry once connected
                    Some(_) => {}
                },
            }
        }

        match TcpStream::connect(addr).await {
            Ok(stream) => {
                info!(addr = %addr, attempt = attempt + 1, "Reconnected to feed relay");
                return Some(stream);
            }
            Err(e) => debug!(error = %e, "Reconnect attempt failed"),
        }
        attempt += 1;
    }
}

/// Push one status to every open channel, optionally forgetting them
async fn broadcast_status(state: &Arc<RwLock<ClientState>>, status: ChannelStatus, drain: bool) {
    let targets: Vec<mpsc::Sender<Signal>> = {
        let mut s = state.write().await;
        if drain {
            s.channels.drain().map(|(_, c)| c.tx).collect()
        } else {
            s.channels.values().map(|c| c.tx.clone()).collect()
        }
    };
    for tx in targets {
        let _ = tx.send(Signal::Status(status)).await;
    }
}

/// Reads frames and routes them to channels.
///
/// Runs apart from the session loop so a partially read frame is never cancelled.
/// Dropping `closed` tells the session the connection is gone.
async fn reader_task(
    mut reader: ReadHalf<TcpStream>,
    state: Arc<RwLock<ClientState>>,
    closed: oneshot::Sender<()>,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Message::Shutdown) => {
                info!("Relay shutting down");
                break;
            }
            Ok(msg) => route_message(msg, &state).await,
            Err(Error::ConnectionClosed) => {
                debug!("Relay closed connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Read error");
                break;
            }
        }
    }
    drop(closed);
}

/// Deliver a relay message to the channel it names
async fn route_message(msg: Message, state: &Arc<RwLock<ClientState>>) {
    let (topic, signal) = match msg {
        Message::Status { topic, status } => (topic, Signal::Status(status)),
        Message::Change { topic, change } => (topic, Signal::Change(change)),
        Message::Pong => {
            debug!("Received pong");
            return;
        }
        _ => {
            debug!("Ignoring unexpected message");
            return;
        }
    };

    let tx = state.read().await.channels.get(&topic).map(|c| c.tx.clone());
    match tx {
        Some(tx) => {
            if tx.send(signal).await.is_err() {
                debug!(topic = %topic, "Channel receiver dropped");
            }
        }
        None => debug!(topic = %topic, "Signal for unknown topic"),
    }
}
