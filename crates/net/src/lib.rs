//! Coven Network Library
//!
//! The change feed between the remote store and the engine.
//!
//! # Architecture
//!
//! - **Transport**: opens filtered channels, delivers status and row changes
//! - **Hub**: in-process fan-out of row changes, usable directly via [`LocalFeed`]
//! - **Server**: relay serving a hub over TCP
//! - **Client**: [`TcpFeed`], a transport connected to a relay
//! - **Subscriber**: opens the game and message channels and normalizes events
//! - **Protocol**: length-prefixed JSON messages
//!
//! # Usage
//!
//! ```ignore
//! let hub = FeedHub::new();
//! let relay = RelayServer::start("127.0.0.1:7431".parse()?, hub.clone()).await?;
//!
//! let feed = TcpFeed::connect(relay.addr()).await?;
//! let mut subscriber = ChangeFeedSubscriber::new(feed, ChannelNames::default());
//! subscriber.open(sink).await?;
//! ```

pub mod client;
pub mod error;
mod frame;
pub mod hub;
pub mod protocol;
pub mod server;
pub mod subscriber;
pub mod transport;

pub use client::TcpFeed;
pub use error::{Error, Result};
pub use hub::{FeedHub, LocalFeed};
pub use protocol::{ChangeFilter, ChannelStatus, EventFilter, Message};
pub use server::RelayServer;
pub use subscriber::{
    connectivity_for, normalize, ChangeFeedSubscriber, ChannelNames, FeedEvent, FeedSink,
};
pub use transport::{ChannelId, FeedTransport, Signal, Subscription};

/// Default port for the feed relay
pub const DEFAULT_PORT: u16 = 7431;
