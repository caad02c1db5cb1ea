//! Remote store interface
//!
//! The gateway talks to the authoritative store through this trait so that
//! the same engine runs against the HTTP store, the in-memory store, or a
//! test double.

use std::future::Future;

use serde_json::Value;

use crate::error::Result;

/// Tables mirrored by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Participant,
    GameStatus,
    Message,
}

impl EntityKind {
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Participant => "game_players",
            EntityKind::GameStatus => "game_state",
            EntityKind::Message => "game_messages",
        }
    }

    pub fn from_table(table: &str) -> Option<Self> {
        Self::all().iter().copied().find(|k| k.table() == table)
    }

    pub fn all() -> &'static [EntityKind] {
        &[
            EntityKind::Participant,
            EntityKind::GameStatus,
            EntityKind::Message,
        ]
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

/// Store operation, used to target injected failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Select,
    Insert,
    Update,
    Delete,
}

/// An ordered, optionally limited read of one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Select {
    pub kind: EntityKind,
    pub order_by: Option<&'static str>,
    pub descending: bool,
    pub limit: Option<usize>,
}

impl Select {
    pub fn from(kind: EntityKind) -> Self {
        Self {
            kind,
            order_by: None,
            descending: false,
            limit: None,
        }
    }

    pub fn order_by(mut self, column: &'static str) -> Self {
        self.order_by = Some(column);
        self
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Row-level operations offered by the authoritative store.
///
/// Rows are untyped JSON objects keyed by their `id` column.
pub trait RemoteStore: Send + Sync + 'static {
    /// Read rows of one table
    fn select(&self, query: Select) -> impl Future<Output = Result<Vec<Value>>> + Send;

    /// Read exactly one row. No rows is reported as [`crate::Error::NotFound`].
    fn select_single(&self, kind: EntityKind) -> impl Future<Output = Result<Value>> + Send;

    /// Insert one row; the store fills in generated columns
    fn insert(&self, kind: EntityKind, row: Value) -> impl Future<Output = Result<()>> + Send;

    /// Merge `patch` into the row whose id equals `key`
    fn update(
        &self,
        kind: EntityKind,
        key: &str,
        patch: Value,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Delete the row whose id equals `key`
    fn delete(&self, kind: EntityKind, key: &str) -> impl Future<Output = Result<()>> + Send;
}
