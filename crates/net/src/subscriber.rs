//! Change-feed subscriber
//!
//! Opens the two feed channels the engine depends on, turns raw row changes
//! into typed [`FeedEvent`]s, and reports channel health as connectivity.
//! Reconnection is left to the transport: this only reacts to what arrives.

use std::sync::Arc;

use coven_core::{
    is_empty_record, ChangeKind, Connectivity, EntityKind, GamePhase, GameStatus, Message,
    Participant, RowChange,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::{ChangeFilter, ChannelStatus};
use crate::transport::{ChannelId, FeedTransport, Signal};

/// A feed change normalized into a mutation the engine can apply
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    ParticipantUpserted(Participant),
    ParticipantRemoved(Uuid),
    StatusReplaced(GameStatus),
    MessageAppended(Message),
}

/// Receives normalized events and connectivity updates
pub trait FeedSink: Send + Sync + 'static {
    fn apply(&self, event: FeedEvent);

    fn set_connectivity(&self, connectivity: Connectivity);
}

/// Topic names for the two channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    /// Participant and status changes
    pub game: String,
    /// Message inserts
    pub messages: String,
}

impl Default for ChannelNames {
    fn default() -> Self {
        Self {
            game: "game_channel".to_string(),
            messages: "message_channel".to_string(),
        }
    }
}

/// Connectivity implied by a channel status.
///
/// `TIMED_OUT` is transient while the transport retries; `CLOSED` means the
/// transport has given the channel up.
pub fn connectivity_for(status: ChannelStatus) -> Connectivity {
    match status {
        ChannelStatus::Subscribed => Connectivity::Connected,
        ChannelStatus::ChannelError => Connectivity::Error,
        ChannelStatus::TimedOut => Connectivity::Connecting,
        ChannelStatus::Closed => Connectivity::Disconnected,
    }
}

/// Turn a raw change into a typed event.
///
/// `Ok(None)` means the change is well-formed but has nothing to apply
/// (e.g. a deleted status row).
pub fn normalize(change: &RowChange) -> Result<Option<FeedEvent>> {
    let kind = EntityKind::from_table(&change.table)
        .ok_or_else(|| Error::Malformed(format!("unknown table {}", change.table)))?;

    match (kind, change.event_type) {
        (EntityKind::Participant, ChangeKind::Insert | ChangeKind::Update) => {
            let row = record(change.new.as_ref(), "new participant")?;
            identity(row)?;
            Ok(Some(FeedEvent::ParticipantUpserted(decode(row, "participant")?)))
        }
        (EntityKind::Participant, ChangeKind::Delete) => {
            let row = record(change.old.as_ref(), "old participant")?;
            Ok(Some(FeedEvent::ParticipantRemoved(identity(row)?)))
        }
        (EntityKind::GameStatus, ChangeKind::Insert | ChangeKind::Update) => {
            let row = record(change.new.as_ref(), "new status")?;
            let tag = row.get("status").and_then(Value::as_str).unwrap_or_default();
            if GamePhase::from_tag(tag).is_none() {
                return Err(Error::Malformed(format!("unrecognized status tag {:?}", tag)));
            }
            Ok(Some(FeedEvent::StatusReplaced(decode(row, "status")?)))
        }
        (EntityKind::GameStatus, ChangeKind::Delete) => Ok(None),
        (EntityKind::Message, ChangeKind::Insert) => {
            let row = record(change.new.as_ref(), "new message")?;
            Ok(Some(FeedEvent::MessageAppended(decode(row, "message")?)))
        }
        (EntityKind::Message, ChangeKind::Update | ChangeKind::Delete) => Ok(None),
    }
}

fn record<'a>(value: Option<&'a Value>, what: &str) -> Result<&'a Value> {
    match value {
        Some(v) if !is_empty_record(Some(v)) => Ok(v),
        _ => Err(Error::Malformed(format!("missing {} record", what))),
    }
}

fn identity(row: &Value) -> Result<Uuid> {
    row.get("id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .filter(|id| !id.is_nil())
        .ok_or_else(|| Error::Malformed("participant without a valid id".to_string()))
}

fn decode<T: DeserializeOwned>(row: &Value, what: &str) -> Result<T> {
    serde_json::from_value(row.clone()).map_err(|e| Error::Malformed(format!("{}: {}", what, e)))
}

struct OpenChannel {
    id: ChannelId,
    topic: String,
    pump: JoinHandle<()>,
}

/// Owns the two live channels and their pump tasks
pub struct ChangeFeedSubscriber<T> {
    transport: T,
    names: ChannelNames,
    channels: Vec<OpenChannel>,
    sink: Option<Arc<dyn FeedSink>>,
}

impl<T: FeedTransport> ChangeFeedSubscriber<T> {
    pub fn new(transport: T, names: ChannelNames) -> Self {
        Self {
            transport,
            names,
            channels: Vec::new(),
            sink: None,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.channels.is_empty()
    }

    /// Open both channels, delivering into `sink`.
    ///
    /// Connectivity goes to `Connecting` at once and only becomes `Connected`
    /// when the game channel confirms. Any channels already open are closed first.
    pub async fn open(&mut self, sink: Arc<dyn FeedSink>) -> Result<()> {
        self.close().await;
        sink.set_connectivity(Connectivity::Connecting);
        self.sink = Some(sink.clone());

        let game_filters = vec![
            ChangeFilter::all(EntityKind::Participant.table()),
            ChangeFilter::all(EntityKind::GameStatus.table()),
        ];
        let message_filters = vec![ChangeFilter::inserts(EntityKind::Message.table())];

        let names = self.names.clone();
        for (topic, filters, tracks_health) in [
            (names.game, game_filters, true),
            (names.messages, message_filters, false),
        ] {
            match self.transport.subscribe(&topic, filters).await {
                Ok(subscription) => {
                    info!(channel = %subscription.id, topic = %topic, "Subscription requested");
                    let pump = tokio::spawn(pump(
                        topic.clone(),
                        subscription.signals,
                        sink.clone(),
                        tracks_health,
                    ));
                    self.channels.push(OpenChannel {
                        id: subscription.id,
                        topic,
                        pump,
                    });
                }
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Subscription failed");
                    self.close().await;
                    sink.set_connectivity(Connectivity::Error);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Close both channels. Safe to call when never opened or already closed.
    pub async fn close(&mut self) {
        for channel in self.channels.drain(..) {
            channel.pump.abort();
            self.transport.unsubscribe(channel.id).await;
            debug!(channel = %channel.id, topic = %channel.topic, "Channel closed");
        }
        if let Some(sink) = self.sink.take() {
            sink.set_connectivity(Connectivity::Disconnected);
        }
    }
}

/// Drain one channel in delivery order
async fn pump(
    topic: String,
    mut signals: mpsc::Receiver<Signal>,
    sink: Arc<dyn FeedSink>,
    tracks_health: bool,
) {
    while let Some(signal) = signals.recv().await {
        match signal {
            Signal::Status(status) => {
                debug!(topic = %topic, status = ?status, "Channel status");
                if tracks_health {
                    sink.set_connectivity(connectivity_for(status));
                }
            }
            Signal::Change(change) => match normalize(&change) {
                Ok(Some(event)) => sink.apply(event),
                Ok(None) => {
                    debug!(topic = %topic, table = %change.table, "Change ignored");
                }
                Err(e) => {
                    warn!(topic = %topic, table = %change.table, error = %e, "Dropping malformed event");
                }
            },
        }
    }
    debug!(topic = %topic, "Signal stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{FeedHub, LocalFeed};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<FeedEvent>>,
        connectivity: Mutex<Vec<Connectivity>>,
    }

    impl RecordingSink {
        fn last_connectivity(&self) -> Option<Connectivity> {
            self.connectivity.lock().unwrap().last().copied()
        }

        fn event_count(&self) -> usize {
            self.events.lock().unwrap().len()
        }
    }

    impl FeedSink for RecordingSink {
        fn apply(&self, event: FeedEvent) {
            self.events.lock().unwrap().push(event);
        }

        fn set_connectivity(&self, connectivity: Connectivity) {
            self.connectivity.lock().unwrap().push(connectivity);
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn participant_row() -> Value {
        serde_json::json!({
            "id": "6f1c1f0e-6d3e-4b7a-9d55-2b1f3f1f7a10",
            "name": "alice",
            "affiliation": null,
            "character": null,
            "joined_at": "2024-05-01T12:00:00Z",
            "is_alive": true
        })
    }

    fn status_row(tag: &str) -> Value {
        serde_json::json!({
            "id": 1,
            "status": tag,
            "current_phase": "Night 1",
            "day_number": 1,
            "created_at": "2024-05-01T12:00:00Z",
            "updated_at": "2024-05-01T12:00:00Z"
        })
    }

    #[test]
    fn test_normalize_participant_changes() {
        let insert = RowChange::insert("game_players", participant_row());
        assert!(matches!(
            normalize(&insert),
            Ok(Some(FeedEvent::ParticipantUpserted(_)))
        ));

        let delete = RowChange::delete(
            "game_players",
            serde_json::json!({ "id": "6f1c1f0e-6d3e-4b7a-9d55-2b1f3f1f7a10" }),
        );
        match normalize(&delete) {
            Ok(Some(FeedEvent::ParticipantRemoved(id))) => {
                assert_eq!(id.to_string(), "6f1c1f0e-6d3e-4b7a-9d55-2b1f3f1f7a10")
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_participant_without_identity_is_malformed() {
        let mut row = participant_row();
        row["id"] = serde_json::json!("not-a-uuid");
        let change = RowChange::insert("game_players", row);
        assert!(matches!(normalize(&change), Err(Error::Malformed(_))));

        let change = RowChange::delete("game_players", serde_json::json!({}));
        assert!(matches!(normalize(&change), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_unrecognized_status_tag_is_malformed() {
        let change = RowChange::update("game_state", status_row("lobby"), status_row("dusk"));
        assert!(matches!(normalize(&change), Err(Error::Malformed(_))));

        let change = RowChange::update("game_state", status_row("lobby"), status_row("night"));
        assert!(matches!(
            normalize(&change),
            Ok(Some(FeedEvent::StatusReplaced(_)))
        ));
    }

    #[test]
    fn test_empty_new_status_is_malformed() {
        let change = RowChange::update("game_state", status_row("lobby"), serde_json::json!({}));
        assert!(matches!(normalize(&change), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_status_delete_and_unknown_table() {
        let change = RowChange::delete("game_state", status_row("day"));
        assert!(matches!(normalize(&change), Ok(None)));

        let change = RowChange::insert("rsvps", serde_json::json!({ "id": 1 }));
        assert!(matches!(normalize(&change), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_connectivity_mapping() {
        assert_eq!(
            connectivity_for(ChannelStatus::Subscribed),
            Connectivity::Connected
        );
        assert_eq!(
            connectivity_for(ChannelStatus::TimedOut),
            Connectivity::Connecting
        );
        assert_eq!(
            connectivity_for(ChannelStatus::ChannelError),
            Connectivity::Error
        );
        assert_eq!(
            connectivity_for(ChannelStatus::Closed),
            Connectivity::Disconnected
        );
    }

    #[tokio::test]
    async fn test_connecting_until_game_channel_confirms() {
        let hub = FeedHub::new();
        let mut subscriber =
            ChangeFeedSubscriber::new(LocalFeed::unconfirmed(hub.clone()), ChannelNames::default());
        let sink = Arc::new(RecordingSink::default());

        subscriber.open(sink.clone()).await.unwrap();
        settle().await;
        assert_eq!(sink.last_connectivity(), Some(Connectivity::Connecting));

        hub.set_topic_status("message_channel", ChannelStatus::Subscribed)
            .await;
        settle().await;
        assert_eq!(sink.last_connectivity(), Some(Connectivity::Connecting));

        hub.set_topic_status("game_channel", ChannelStatus::Subscribed)
            .await;
        settle().await;
        assert_eq!(sink.last_connectivity(), Some(Connectivity::Connected));
    }

    #[tokio::test]
    async fn test_events_are_normalized_and_malformed_dropped() {
        let hub = FeedHub::new();
        let mut subscriber =
            ChangeFeedSubscriber::new(LocalFeed::new(hub.clone()), ChannelNames::default());
        let sink = Arc::new(RecordingSink::default());
        subscriber.open(sink.clone()).await.unwrap();

        hub.publish(RowChange::insert("game_players", participant_row()))
            .await;
        hub.publish(RowChange::insert(
            "game_players",
            serde_json::json!({ "name": "no id" }),
        ))
        .await;
        settle().await;

        assert_eq!(sink.event_count(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_disconnects() {
        let hub = FeedHub::new();
        let mut subscriber =
            ChangeFeedSubscriber::new(LocalFeed::new(hub.clone()), ChannelNames::default());

        subscriber.close().await;

        let sink = Arc::new(RecordingSink::default());
        subscriber.open(sink.clone()).await.unwrap();
        assert!(subscriber.is_open());
        assert_eq!(hub.channel_count().await, 2);

        subscriber.close().await;
        subscriber.close().await;
        assert!(!subscriber.is_open());
        assert_eq!(hub.channel_count().await, 0);
        assert_eq!(sink.last_connectivity(), Some(Connectivity::Disconnected));
    }
}
