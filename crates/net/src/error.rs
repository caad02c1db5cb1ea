//! Errors raised by feed transports, the relay and event normalization

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("feed socket: {0}")]
    Io(#[from] io::Error),

    /// The peer hung up, cleanly or mid-frame
    #[error("relay connection closed")]
    ConnectionClosed,

    /// Bad framing or an unexpected message
    #[error("relay protocol violation: {0}")]
    Protocol(String),

    #[error("channel refused: {0}")]
    Rejected(String),

    #[error("feed is not connected")]
    NotConnected,

    /// A change event that could not be turned into a typed mutation
    #[error("malformed change: {0}")]
    Malformed(String),
}
