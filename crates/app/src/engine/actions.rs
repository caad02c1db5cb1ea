//! Local writes
//!
//! Participant writes are applied to the snapshot before the remote call.
//! A rejected write is rolled back by reloading the whole snapshot, then
//! the failure is returned to the caller.

use coven_core::{Error, NewMessage, ParticipantPatch, RemoteStore, Result};
use coven_net::FeedTransport;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::Engine;

/// Phase label used before the game has a status record
const LOBBY_LABEL: &str = "Lobby";

impl<S: RemoteStore, T: FeedTransport> Engine<S, T> {
    /// Patch a participant locally, then remotely
    #[instrument(skip(self, patch))]
    pub async fn update_participant(&self, id: Uuid, patch: ParticipantPatch) -> Result<()> {
        if id.is_nil() {
            return Err(Error::InvalidOperation("nil participant id".to_string()));
        }
        if patch.is_empty() {
            return Err(Error::InvalidOperation("empty participant patch".to_string()));
        }

        if !self.core.mutate(|s| s.patch_participant(id, &patch)) {
            debug!(participant_id = %id, "Participant not mirrored locally");
        }

        match self.gateway.update_participant(id, &patch).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.roll_back("update participant", e).await),
        }
    }

    /// Remove a participant locally, then remotely
    #[instrument(skip(self))]
    pub async fn remove_participant(&self, id: Uuid) -> Result<()> {
        if id.is_nil() {
            return Err(Error::InvalidOperation("nil participant id".to_string()));
        }

        if !self.core.mutate(|s| s.remove_participant(id).is_some()) {
            debug!(participant_id = %id, "Participant not mirrored locally");
        }

        match self.gateway.delete_participant(id).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.roll_back("remove participant", e).await),
        }
    }

    /// Submit a message. It becomes visible only when the feed delivers it back.
    #[instrument(skip(self, content, author_name))]
    pub async fn send_message(
        &self,
        content: &str,
        author_id: Uuid,
        author_name: &str,
        is_system: bool,
    ) -> Result<()> {
        let phase = self
            .core
            .snapshot
            .borrow()
            .status
            .as_ref()
            .map(|s| s.current_phase.clone())
            .unwrap_or_else(|| LOBBY_LABEL.to_string());

        let message = NewMessage {
            author_id,
            author_name: author_name.to_string(),
            content: content.to_string(),
            phase,
            is_system,
        };

        self.gateway.create_message(&message).await.map_err(|e| {
            warn!(error = %e, "Message rejected");
            Error::Write {
                op: "send message",
                source: Box::new(e),
            }
        })
    }

    /// Discard optimistic state by reloading, and wrap the original failure.
    ///
    /// Feed events applied while the reload is in flight can be overwritten by it.
    async fn roll_back(&self, op: &'static str, error: Error) -> Error {
        warn!(op = op, error = %error, "Write rejected, reloading snapshot");
        if let Err(reload) = self.refresh().await {
            warn!(op = op, error = %reload, "Reload after rejected write failed");
        }
        Error::Write {
            op,
            source: Box::new(error),
        }
    }
}
