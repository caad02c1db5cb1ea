//! Coven Core Library
//!
//! Entity models, snapshot invariants, and the remote store gateway for the
//! Coven game mirror.

pub mod error;
pub mod gateway;
pub mod invariants;
pub mod models;

pub use error::{Error, Result};
pub use gateway::{
    EntityKind, Gateway, LoadOutcome, MemoryStore, RemoteStore, RestStore, Select, StoreOp,
};
pub use models::*;
