//! Game status singleton

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Game status tags in progression order
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum GamePhase {
    #[default]
    Lobby,
    Night,
    Day,
    Voting,
    Finished,
}

impl GamePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            GamePhase::Lobby => "lobby",
            GamePhase::Night => "night",
            GamePhase::Day => "day",
            GamePhase::Voting => "voting",
            GamePhase::Finished => "finished",
        }
    }

    /// Parse a wire tag, `None` if it is not one of the five known tags
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::all().iter().copied().find(|p| p.as_str() == tag)
    }

    /// A game is in play between leaving the lobby and finishing
    pub fn is_active(&self) -> bool {
        !matches!(self, GamePhase::Lobby | GamePhase::Finished)
    }

    pub fn all() -> &'static [GamePhase] {
        &[
            GamePhase::Lobby,
            GamePhase::Night,
            GamePhase::Day,
            GamePhase::Voting,
            GamePhase::Finished,
        ]
    }
}

impl std::fmt::Display for GamePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single aggregate status record of a game
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameStatus {
    pub id: i64,
    pub status: GamePhase,
    /// Free-form label shown to players, e.g. "Night 2"
    pub current_phase: String,
    pub day_number: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GameStatus {
    pub fn new(status: GamePhase, current_phase: String) -> Self {
        let now = Utc::now();
        Self {
            id: 1,
            status,
            current_phase,
            day_number: 0,
            created_at: now,
            updated_at: now,
        }
    }
}
