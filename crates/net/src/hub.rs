//! In-process feed hub
//!
//! Fans row changes out to every open channel whose filters match. The TCP
//! relay serves a hub to remote clients; [`LocalFeed`] exposes one directly
//! as a [`FeedTransport`].

use std::collections::HashMap;
use std::sync::Arc;

use coven_core::RowChange;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::protocol::{ChangeFilter, ChannelStatus};
use crate::transport::{ChannelId, FeedTransport, Signal, Subscription, CHANNEL_BUFFER};

struct HubChannel {
    topic: String,
    filters: Vec<ChangeFilter>,
    tx: mpsc::Sender<Signal>,
}

/// Routes published changes to matching channels
#[derive(Clone)]
pub struct FeedHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    channels: RwLock<HashMap<ChannelId, HubChannel>>,
}

impl FeedHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                channels: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a channel. No status is sent; the caller decides when it is confirmed.
    pub async fn open(&self, topic: &str, filters: Vec<ChangeFilter>) -> Subscription {
        let id = ChannelId::new();
        let (tx, signals) = mpsc::channel(CHANNEL_BUFFER);
        self.inner.channels.write().await.insert(
            id,
            HubChannel {
                topic: topic.to_string(),
                filters,
                tx,
            },
        );
        debug!(channel = %id, topic = %topic, "Channel opened");
        Subscription {
            id,
            topic: topic.to_string(),
            signals,
        }
    }

    /// Drop a channel. Returns false if it was not open.
    pub async fn close(&self, id: ChannelId) -> bool {
        let removed = self.inner.channels.write().await.remove(&id);
        if let Some(channel) = &removed {
            debug!(channel = %id, topic = %channel.topic, "Channel closed");
        }
        removed.is_some()
    }

    /// Push a status to one channel
    pub async fn set_status(&self, id: ChannelId, status: ChannelStatus) {
        let tx = self
            .inner
            .channels
            .read()
            .await
            .get(&id)
            .map(|c| c.tx.clone());
        if let Some(tx) = tx {
            if tx.send(Signal::Status(status)).await.is_err() {
                debug!(channel = %id, "Status dropped, receiver gone");
            }
        }
    }

    /// Push a status to every channel on `topic`
    pub async fn set_topic_status(&self, topic: &str, status: ChannelStatus) {
        let ids: Vec<ChannelId> = self
            .inner
            .channels
            .read()
            .await
            .iter()
            .filter(|(_, c)| c.topic == topic)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.set_status(id, status).await;
        }
    }

    /// Deliver a change to every matching channel. Returns how many received it.
    pub async fn publish(&self, change: RowChange) -> usize {
        // Senders are cloned out so a slow receiver never blocks open/close
        let targets: Vec<(ChannelId, mpsc::Sender<Signal>)> = self
            .inner
            .channels
            .read()
            .await
            .iter()
            .filter(|(_, c)| c.filters.iter().any(|f| f.matches(&change)))
            .map(|(id, c)| (*id, c.tx.clone()))
            .collect();

        let mut delivered = 0;
        for (id, tx) in targets {
            if tx.send(Signal::Change(change.clone())).await.is_ok() {
                delivered += 1;
            } else {
                debug!(channel = %id, "Change dropped, receiver gone");
            }
        }
        delivered
    }

    /// Republish a store's change stream until it ends
    pub fn forward(&self, mut changes: broadcast::Receiver<RowChange>) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        hub.publish(change).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Change forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            info!("Change forwarder stopped");
        })
    }

    pub async fn channel_count(&self) -> usize {
        self.inner.channels.read().await.len()
    }
}

impl Default for FeedHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport over an in-process hub
#[derive(Clone)]
pub struct LocalFeed {
    hub: FeedHub,
    auto_confirm: bool,
}

impl LocalFeed {
    /// Channels are confirmed as subscribed as soon as they open
    pub fn new(hub: FeedHub) -> Self {
        Self {
            hub,
            auto_confirm: true,
        }
    }

    /// Channels stay unconfirmed until a status is pushed through the hub
    pub fn unconfirmed(hub: FeedHub) -> Self {
        Self {
            hub,
            auto_confirm: false,
        }
    }

    pub fn hub(&self) -> &FeedHub {
        &self.hub
    }
}

impl FeedTransport for LocalFeed {
    async fn subscribe(&self, topic: &str, filters: Vec<ChangeFilter>) -> Result<Subscription> {
        let subscription = self.hub.open(topic, filters).await;
        if self.auto_confirm {
            self.hub
                .set_status(subscription.id, ChannelStatus::Subscribed)
                .await;
        }
        Ok(subscription)
    }

    async fn unsubscribe(&self, id: ChannelId) {
        self.hub.close(id).await;
    }
}
