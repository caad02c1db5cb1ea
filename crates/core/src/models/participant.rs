//! Participant model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Faction a participant has been assigned to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Affiliation {
    /// Primary faction
    Cult,
    /// Secondary faction
    Townsfolk,
}

impl Affiliation {
    pub fn display_name(&self) -> &'static str {
        match self {
            Affiliation::Cult => "Cult",
            Affiliation::Townsfolk => "Townsfolk",
        }
    }
}

impl std::fmt::Display for Affiliation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// A player seated in the game
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub name: String,
    /// `None` while unassigned
    pub affiliation: Option<Affiliation>,
    #[serde(rename = "character")]
    pub role: Option<String>,
    pub joined_at: DateTime<Utc>,
    pub is_alive: bool,
}

impl Participant {
    pub fn new(name: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            affiliation: None,
            role: None,
            joined_at: Utc::now(),
            is_alive: true,
        }
    }

    /// Merge a partial update into this record.
    ///
    /// Identity and join time are never touched by a patch.
    pub fn apply_patch(&mut self, patch: &ParticipantPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(affiliation) = patch.affiliation {
            self.affiliation = affiliation;
        }
        if let Some(role) = &patch.role {
            self.role = role.clone();
        }
        if let Some(is_alive) = patch.is_alive {
            self.is_alive = is_alive;
        }
    }
}

/// Partial participant update sent to the remote store.
///
/// Outer `None` leaves a field untouched; `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParticipantPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affiliation: Option<Option<Affiliation>>,
    #[serde(rename = "character", skip_serializing_if = "Option::is_none")]
    pub role: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_alive: Option<bool>,
}

impl ParticipantPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.affiliation.is_none()
            && self.role.is_none()
            && self.is_alive.is_none()
    }

    pub fn alive(is_alive: bool) -> Self {
        Self {
            is_alive: Some(is_alive),
            ..Self::default()
        }
    }

    pub fn affiliation(affiliation: Option<Affiliation>) -> Self {
        Self {
            affiliation: Some(affiliation),
            ..Self::default()
        }
    }
}
