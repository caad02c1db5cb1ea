//! Feed transport interface
//!
//! A transport opens filtered channels and delivers their status changes and
//! row changes, in order, on one receiver per channel.

use std::future::Future;

use coven_core::RowChange;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;
use crate::protocol::{ChangeFilter, ChannelStatus};

/// Buffered signals per channel before the producer waits
pub const CHANNEL_BUFFER: usize = 64;

/// Opaque handle to an open channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub Uuid);

impl ChannelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Something delivered on a channel
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Status(ChannelStatus),
    Change(RowChange),
}

/// An open channel and its signal stream
#[derive(Debug)]
pub struct Subscription {
    pub id: ChannelId,
    pub topic: String,
    pub signals: mpsc::Receiver<Signal>,
}

/// Subscribe-based change feed
pub trait FeedTransport: Send + Sync + 'static {
    /// Open a channel. Status signals follow on the returned stream.
    fn subscribe(
        &self,
        topic: &str,
        filters: Vec<ChangeFilter>,
    ) -> impl Future<Output = Result<Subscription>> + Send;

    /// Close a channel. Unknown or already-closed ids are ignored.
    fn unsubscribe(&self, id: ChannelId) -> impl Future<Output = ()> + Send;
}
