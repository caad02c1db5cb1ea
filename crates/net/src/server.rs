//! TCP feed relay
//!
//! Serves a [`FeedHub`] to remote clients. Each connection may open a small
//! number of channels; changes published to the hub are forwarded to every
//! connection whose filters match.

use std::collections::HashMap;
use std::net::SocketAddr;

use coven_core::RowChange;
use tokio::io::WriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::hub::FeedHub;
use crate::protocol::{ChannelStatus, Message};
use crate::transport::{ChannelId, Signal, Subscription, CHANNEL_BUFFER};

/// Maximum channels a single connection may hold open
const MAX_CHANNELS: usize = 16;

/// Relay server handle
pub struct RelayServer {
    addr: SocketAddr,
    hub: FeedHub,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Bind and start accepting connections
    pub async fn start(addr: SocketAddr, hub: FeedHub) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let bound_addr = listener.local_addr()?;

        info!(addr = %bound_addr, "Feed relay started");

        let (shutdown_tx, _) = broadcast::channel(1);
        tokio::spawn(accept_loop(listener, hub.clone(), shutdown_tx.clone()));

        Ok(Self {
            addr: bound_addr,
            hub,
            shutdown_tx,
        })
    }

    /// Get the relay's bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn hub(&self) -> &FeedHub {
        &self.hub
    }

    /// Publish a change to every subscribed connection
    pub async fn publish(&self, change: RowChange) -> usize {
        self.hub.publish(change).await
    }

    /// Stop accepting and tell connected clients to go away
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Relay shutdown initiated");
    }
}

/// Accept incoming connections
async fn accept_loop(listener: TcpListener, hub: FeedHub, shutdown_tx: broadcast::Sender<()>) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        tokio::spawn(handle_connection(
                            stream,
                            addr,
                            hub.clone(),
                            shutdown_tx.subscribe(),
                        ));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: FeedHub,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (mut reader, writer) = tokio::io::split(stream);
    let (msg_tx, msg_rx) = mpsc::channel(CHANNEL_BUFFER);
    let writer_handle = tokio::spawn(writer_task(writer, msg_rx));

    let mut topics: HashMap<String, ChannelId> = HashMap::new();

    loop {
        tokio::select! {
            result = read_frame(&mut reader) => {
                match result {
                    Ok(msg) => handle_message(msg, &hub, &mut topics, &msg_tx).await,
                    Err(Error::ConnectionClosed) => {
                        debug!(addr = %addr, "Connection closed");
                        break;
                    }
                    Err(e) => {
                        warn!(addr = %addr, error = %e, "Read error");
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                let _ = msg_tx.send(Message::Shutdown).await;
                break;
            }
        }
    }

    // Cleanup
    for (_, id) in topics.drain() {
        hub.close(id).await;
    }
    drop(msg_tx);
    let _ = writer_handle.await;

    info!(addr = %addr, "Client disconnected");
}

/// Handle one client request
async fn handle_message(
    msg: Message,
    hub: &FeedHub,
    topics: &mut HashMap<String, ChannelId>,
    msg_tx: &mpsc::Sender<Message>,
) {
    match msg {
        Message::Subscribe { topic, filters } => {
            if topics.contains_key(&topic) || topics.len() >= MAX_CHANNELS {
                warn!(topic = %topic, "Subscription refused");
                let _ = msg_tx
                    .send(Message::Status {
                        topic,
                        status: ChannelStatus::ChannelError,
                    })
                    .await;
                return;
            }

            let subscription = hub.open(&topic, filters).await;
            topics.insert(topic.clone(), subscription.id);

            // Confirm before forwarding so the status precedes any change
            let _ = msg_tx
                .send(Message::Status {
                    topic,
                    status: ChannelStatus::Subscribed,
                })
                .await;
            tokio::spawn(forward_task(subscription, msg_tx.clone()));
        }
        Message::Unsubscribe { topic } => {
            if let Some(id) = topics.remove(&topic) {
                hub.close(id).await;
                let _ = msg_tx
                    .send(Message::Status {
                        topic,
                        status: ChannelStatus::Closed,
                    })
                    .await;
            }
        }
        Message::Ping => {
            let _ = msg_tx.send(Message::Pong).await;
        }
        _ => {
            debug!("Ignoring unexpected message type");
        }
    }
}

/// Forward one hub channel onto the connection
async fn forward_task(mut subscription: Subscription, msg_tx: mpsc::Sender<Message>) {
    let topic = subscription.topic;
    while let Some(signal) = subscription.signals.recv().await {
        let msg = match signal {
            Signal::Status(status) => Message::Status {
                topic: topic.clone(),
                status,
            },
            Signal::Change(change) => Message::Change {
                topic: topic.clone(),
                change,
            },
        };
        if msg_tx.send(msg).await.is_err() {
            break;
        }
    }
}

/// Writer task - sends messages to the client
async fn writer_task(mut writer: WriteHalf<TcpStream>, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        let is_shutdown = matches!(msg, Message::Shutdown);
        if let Err(e) = write_frame(&mut writer, &msg).await {
            debug!(error = %e, "Write failed");
            break;
        }
        if is_shutdown {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ConnectionState, TcpFeed};
    use crate::protocol::ChangeFilter;
    use crate::subscriber::{ChangeFeedSubscriber, ChannelNames, FeedEvent, FeedSink};
    use crate::transport::FeedTransport;
    use coven_core::Connectivity;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_signal(sub: &mut Subscription) -> Signal {
        timeout(Duration::from_secs(5), sub.signals.recv())
            .await
            .expect("timed out waiting for signal")
            .expect("channel closed")
    }

    async fn start_relay() -> RelayServer {
        RelayServer::start(SocketAddr::from(([127, 0, 0, 1], 0)), FeedHub::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_relay_start() {
        let relay = start_relay().await;
        assert!(relay.addr().port() > 0);
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_subscribe_and_receive_changes() {
        let relay = start_relay().await;
        let feed = TcpFeed::connect(relay.addr()).await.unwrap();

        let mut sub = feed
            .subscribe("game_channel", vec![ChangeFilter::all("game_players")])
            .await
            .unwrap();
        assert_eq!(
            next_signal(&mut sub).await,
            Signal::Status(ChannelStatus::Subscribed)
        );

        let delivered = relay
            .publish(RowChange::insert(
                "game_players",
                serde_json::json!({ "id": "a" }),
            ))
            .await;
        assert_eq!(delivered, 1);

        match next_signal(&mut sub).await {
            Signal::Change(change) => assert_eq!(change.table, "game_players"),
            other => panic!("unexpected signal: {:?}", other),
        }

        feed.unsubscribe(sub.id).await;
        feed.unsubscribe(sub.id).await;
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_duplicate_topic_rejected_locally() {
        let relay = start_relay().await;
        let feed = TcpFeed::connect(relay.addr()).await.unwrap();

        let _sub = feed.subscribe("game_channel", vec![]).await.unwrap();
        let err = feed.subscribe("game_channel", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::Rejected(_)));
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_relay_loss_times_out_then_disconnect_closes() {
        let relay = start_relay().await;
        let feed = TcpFeed::connect_with_backoff(relay.addr(), &[500])
            .await
            .unwrap();

        let mut sub = feed.subscribe("game_channel", vec![]).await.unwrap();
        assert_eq!(
            next_signal(&mut sub).await,
            Signal::Status(ChannelStatus::Subscribed)
        );

        relay.shutdown();
        assert_eq!(
            next_signal(&mut sub).await,
            Signal::Status(ChannelStatus::TimedOut)
        );
        assert_eq!(feed.connection_state().await, ConnectionState::Reconnecting);

        feed.disconnect().await;
        assert_eq!(
            next_signal(&mut sub).await,
            Signal::Status(ChannelStatus::Closed)
        );
        assert_eq!(feed.connection_state().await, ConnectionState::Disconnected);
        assert!(matches!(
            feed.subscribe("message_channel", vec![]).await,
            Err(Error::NotConnected)
        ));
    }

    /// Rebind `addr` once the previous listener has let go of it
    async fn restart_relay(addr: SocketAddr) -> RelayServer {
        for _ in 0..100 {
            if let Ok(relay) = RelayServer::start(addr, FeedHub::new()).await {
                return relay;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("could not rebind {}", addr);
    }

    #[tokio::test]
    async fn test_feed_resubscribes_after_relay_restart() {
        let relay = start_relay().await;
        let addr = relay.addr();
        let feed = TcpFeed::connect_with_backoff(addr, &[100, 20]).await.unwrap();

        let mut sub = feed
            .subscribe("game_channel", vec![ChangeFilter::all("game_players")])
            .await
            .unwrap();
        assert_eq!(
            next_signal(&mut sub).await,
            Signal::Status(ChannelStatus::Subscribed)
        );

        relay.shutdown();
        assert_eq!(
            next_signal(&mut sub).await,
            Signal::Status(ChannelStatus::TimedOut)
        );

        let relay = restart_relay(addr).await;
        assert_eq!(
            next_signal(&mut sub).await,
            Signal::Status(ChannelStatus::Subscribed)
        );
        assert_eq!(feed.connection_state().await, ConnectionState::Connected);

        relay
            .publish(RowChange::insert(
                "game_players",
                serde_json::json!({ "id": "b" }),
            ))
            .await;
        match next_signal(&mut sub).await {
            Signal::Change(change) => assert_eq!(change.table, "game_players"),
            other => panic!("unexpected signal: {:?}", other),
        }

        // A topic opened after the restart is announced once, not twice
        let mut late = feed.subscribe("message_channel", vec![]).await.unwrap();
        assert_eq!(
            next_signal(&mut late).await,
            Signal::Status(ChannelStatus::Subscribed)
        );

        feed.disconnect().await;
        relay.shutdown();
    }

    #[derive(Default)]
    struct ConnectivityLog(std::sync::Mutex<Vec<Connectivity>>);

    impl ConnectivityLog {
        fn last(&self) -> Option<Connectivity> {
            self.0.lock().unwrap().last().copied()
        }

        async fn wait_for(&self, expected: Connectivity) {
            for _ in 0..250 {
                if self.last() == Some(expected) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            panic!("connectivity stuck at {:?}, wanted {:?}", self.last(), expected);
        }
    }

    impl FeedSink for ConnectivityLog {
        fn apply(&self, _event: FeedEvent) {}

        fn set_connectivity(&self, connectivity: Connectivity) {
            self.0.lock().unwrap().push(connectivity);
        }
    }

    #[tokio::test]
    async fn test_subscriber_reconnects_through_relay_restart() {
        let relay = start_relay().await;
        let addr = relay.addr();
        let feed = TcpFeed::connect_with_backoff(addr, &[100, 20]).await.unwrap();
        let mut subscriber = ChangeFeedSubscriber::new(feed.clone(), ChannelNames::default());
        let log = Arc::new(ConnectivityLog::default());

        subscriber.open(log.clone()).await.unwrap();
        log.wait_for(Connectivity::Connected).await;

        relay.shutdown();
        log.wait_for(Connectivity::Connecting).await;

        let relay = restart_relay(addr).await;
        log.wait_for(Connectivity::Connected).await;

        subscriber.close().await;
        assert_eq!(log.last(), Some(Connectivity::Disconnected));
        feed.disconnect().await;
        relay.shutdown();
    }
}
