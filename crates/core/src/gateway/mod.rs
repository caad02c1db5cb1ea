//! Remote gateway for Coven
//!
//! Loads a consistent snapshot from the store and issues the single-row
//! writes behind optimistic actions.

mod memory;
mod rest;
mod traits;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{GameStatus, Message, NewMessage, Participant, ParticipantPatch, MESSAGE_LOG_CAP};

pub use memory::MemoryStore;
pub use rest::RestStore;
pub use traits::{EntityKind, RemoteStore, Select, StoreOp};

/// Result of the three concurrent snapshot reads.
///
/// Each part is independent: a failed read does not invalidate the others.
#[derive(Debug)]
pub struct LoadOutcome {
    pub participants: Result<Vec<Participant>>,
    /// `Ok(None)` when the game has not been initialized
    pub status: Result<Option<GameStatus>>,
    pub messages: Result<Vec<Message>>,
}

impl LoadOutcome {
    pub fn is_ok(&self) -> bool {
        self.participants.is_ok() && self.status.is_ok() && self.messages.is_ok()
    }

    /// Collapse every failed read into a single error
    pub fn error(&self) -> Option<Error> {
        let failures: Vec<String> = [
            ("participants", self.participants.as_ref().err()),
            ("status", self.status.as_ref().err()),
            ("messages", self.messages.as_ref().err()),
        ]
        .into_iter()
        .filter_map(|(part, err)| err.map(|e| format!("{}: {}", part, e)))
        .collect();

        if failures.is_empty() {
            None
        } else {
            Some(Error::Load(failures.join("; ")))
        }
    }
}

/// Typed access to a [`RemoteStore`]
pub struct Gateway<S> {
    store: S,
}

impl<S: RemoteStore> Gateway<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Issue the roster, status and message reads concurrently and wait for all three
    #[instrument(skip(self))]
    pub async fn load_snapshot(&self) -> LoadOutcome {
        let (participants, status, messages) = tokio::join!(
            self.load_participants(),
            self.load_status(),
            self.load_messages()
        );

        let outcome = LoadOutcome {
            participants,
            status,
            messages,
        };
        if outcome.is_ok() {
            debug!("Snapshot loaded");
        } else {
            debug!(
                participants = outcome.participants.is_ok(),
                status = outcome.status.is_ok(),
                messages = outcome.messages.is_ok(),
                "Snapshot reads finished with failures"
            );
        }
        outcome
    }

    async fn load_participants(&self) -> Result<Vec<Participant>> {
        let rows = self
            .store
            .select(Select::from(EntityKind::Participant).order_by("joined_at"))
            .await?;
        decode_rows(rows)
    }

    async fn load_status(&self) -> Result<Option<GameStatus>> {
        match self.store.select_single(EntityKind::GameStatus).await {
            Ok(row) => Ok(Some(serde_json::from_value(row)?)),
            Err(Error::NotFound(_)) => {
                debug!("No game status row, game not started");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn load_messages(&self) -> Result<Vec<Message>> {
        let rows = self
            .store
            .select(
                Select::from(EntityKind::Message)
                    .order_by("timestamp")
                    .descending()
                    .limit(MESSAGE_LOG_CAP),
            )
            .await?;
        let mut messages: Vec<Message> = decode_rows(rows)?;
        // Reverse to get chronological order
        messages.reverse();
        Ok(messages)
    }

    pub async fn update_participant(&self, id: Uuid, patch: &ParticipantPatch) -> Result<()> {
        let patch = serde_json::to_value(patch)?;
        self.store
            .update(EntityKind::Participant, &id.to_string(), patch)
            .await
    }

    pub async fn delete_participant(&self, id: Uuid) -> Result<()> {
        self.store
            .delete(EntityKind::Participant, &id.to_string())
            .await
    }

    pub async fn create_message(&self, message: &NewMessage) -> Result<()> {
        let row = serde_json::to_value(message)?;
        self.store.insert(EntityKind::Message, row).await
    }
}

fn decode_rows<T: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(Error::from))
        .collect()
}
