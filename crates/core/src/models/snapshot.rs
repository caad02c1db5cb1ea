//! The aggregate root mirrored from the remote store

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{GameStatus, Message, Participant, ParticipantPatch};

/// Most recent messages retained in the local log
pub const MESSAGE_LOG_CAP: usize = 100;

/// Feed connectivity as seen by the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Connecting,
    Connected,
    #[default]
    Disconnected,
    Error,
}

/// Result of a participant upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced,
}

/// In-memory mirror of one game
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// Unique by id, ordered by join time at every structural insert
    pub participants: Vec<Participant>,
    /// `None` until the game has been initialized remotely
    pub status: Option<GameStatus>,
    /// Oldest first, never longer than [`MESSAGE_LOG_CAP`]
    pub messages: VecDeque<Message>,
    pub is_loading: bool,
    pub error: Option<String>,
    pub connectivity: Connectivity,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn participant(&self, id: Uuid) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    /// Insert a new participant in join order, or replace an existing one in place.
    pub fn upsert_participant(&mut self, participant: Participant) -> Upsert {
        if let Some(existing) = self.participants.iter_mut().find(|p| p.id == participant.id) {
            *existing = participant;
            return Upsert::Replaced;
        }
        self.participants.push(participant);
        self.participants.sort_by_key(|p| p.joined_at);
        Upsert::Inserted
    }

    /// Apply a patch to a known participant. Returns false if the id is absent.
    pub fn patch_participant(&mut self, id: Uuid, patch: &ParticipantPatch) -> bool {
        match self.participants.iter_mut().find(|p| p.id == id) {
            Some(p) => {
                p.apply_patch(patch);
                true
            }
            None => false,
        }
    }

    pub fn remove_participant(&mut self, id: Uuid) -> Option<Participant> {
        let index = self.participants.iter().position(|p| p.id == id)?;
        Some(self.participants.remove(index))
    }

    /// Replace the whole roster, dropping duplicate ids (last wins) and sorting by join time.
    /// Rows without an identity are skipped.
    pub fn replace_participants(&mut self, participants: Vec<Participant>) {
        let mut roster: Vec<Participant> = Vec::with_capacity(participants.len());
        for p in participants.into_iter().filter(|p| !p.id.is_nil()) {
            match roster.iter_mut().find(|r| r.id == p.id) {
                Some(existing) => *existing = p,
                None => roster.push(p),
            }
        }
        roster.sort_by_key(|p| p.joined_at);
        self.participants = roster;
    }

    /// Overwrite the status singleton, returning the previous record
    pub fn replace_status(&mut self, status: Option<GameStatus>) -> Option<GameStatus> {
        std::mem::replace(&mut self.status, status)
    }

    /// Append to the log and evict from the front past the cap.
    ///
    /// A message whose id is already in the log is ignored. Returns false in that case.
    pub fn append_message(&mut self, message: Message) -> bool {
        if self.messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        self.messages.push_back(message);
        while self.messages.len() > MESSAGE_LOG_CAP {
            self.messages.pop_front();
        }
        true
    }

    /// Replace the log with the tail of `messages`
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages.clear();
        for message in messages {
            self.append_message(message);
        }
    }
}
