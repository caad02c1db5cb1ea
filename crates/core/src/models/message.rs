//! Message log entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A chat or narrator line in the game log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    #[serde(rename = "player_id")]
    pub author_id: Uuid,
    /// Name as it was when the message was written
    #[serde(rename = "player_name")]
    pub author_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Phase label at time of send
    pub phase: String,
    pub is_system: bool,
}

/// Message payload as submitted to the store; id and timestamp are assigned remotely
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewMessage {
    #[serde(rename = "player_id")]
    pub author_id: Uuid,
    #[serde(rename = "player_name")]
    pub author_name: String,
    pub content: String,
    pub phase: String,
    pub is_system: bool,
}

impl Message {
    pub fn format_timestamp(&self) -> String {
        self.timestamp.format("%H:%M").to_string()
    }
}
