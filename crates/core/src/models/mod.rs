//! Data models mirrored from the remote store

mod change;
mod message;
mod participant;
mod snapshot;
mod status;

pub use change::*;
pub use message::*;
pub use participant::*;
pub use snapshot::*;
pub use status::*;
