//! Feed protocol message types
//!
//! All messages are JSON-serialized and length-prefixed on the wire.

use coven_core::{ChangeKind, RowChange};
use serde::{Deserialize, Serialize};

/// Lifecycle status of one subscribed channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    Subscribed,
    TimedOut,
    Closed,
    ChannelError,
}

/// Which change kinds a filter admits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventFilter {
    #[serde(rename = "*")]
    All,
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

impl EventFilter {
    pub fn admits(&self, kind: ChangeKind) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Insert => kind == ChangeKind::Insert,
            EventFilter::Update => kind == ChangeKind::Update,
            EventFilter::Delete => kind == ChangeKind::Delete,
        }
    }
}

/// Selects the changes a channel receives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub event: EventFilter,
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
}

fn default_schema() -> String {
    "public".to_string()
}

impl ChangeFilter {
    /// Every change to `table`
    pub fn all(table: &str) -> Self {
        Self {
            event: EventFilter::All,
            schema: default_schema(),
            table: table.to_string(),
        }
    }

    /// Only inserts into `table`
    pub fn inserts(table: &str) -> Self {
        Self {
            event: EventFilter::Insert,
            schema: default_schema(),
            table: table.to_string(),
        }
    }

    pub fn matches(&self, change: &RowChange) -> bool {
        self.schema == change.schema
            && self.table == change.table
            && self.event.admits(change.event_type)
    }
}

/// Feed protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Client opens a channel
    Subscribe {
        topic: String,
        filters: Vec<ChangeFilter>,
    },

    /// Client closes a channel
    Unsubscribe { topic: String },

    /// Server reports a channel status
    Status { topic: String, status: ChannelStatus },

    /// A change matched one of the channel's filters
    Change { topic: String, change: RowChange },

    /// Keepalive
    Ping,

    /// Keepalive response
    Pong,

    /// Relay is shutting down
    Shutdown,
}

impl Message {
    /// Serialize message to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_message_roundtrip() {
        let msg = Message::Change {
            topic: "game_channel".to_string(),
            change: RowChange::insert("game_players", serde_json::json!({ "id": "a" })),
        };

        let bytes = msg.to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();

        match decoded {
            Message::Change { topic, change } => {
                assert_eq!(topic, "game_channel");
                assert_eq!(change.event_type, ChangeKind::Insert);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_status_wire_names() {
        let json = serde_json::to_value(ChannelStatus::ChannelError).unwrap();
        assert_eq!(json, "CHANNEL_ERROR");
        let json = serde_json::to_value(EventFilter::All).unwrap();
        assert_eq!(json, "*");
    }

    #[test]
    fn test_filter_matching() {
        let filter = ChangeFilter::inserts("game_messages");
        let insert = RowChange::insert("game_messages", serde_json::json!({}));
        let delete = RowChange::delete("game_messages", serde_json::json!({}));
        let other = RowChange::insert("game_players", serde_json::json!({}));

        assert!(filter.matches(&insert));
        assert!(!filter.matches(&delete));
        assert!(!filter.matches(&other));
        assert!(ChangeFilter::all("game_messages").matches(&delete));
    }
}
