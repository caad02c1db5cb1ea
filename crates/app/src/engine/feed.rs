//! Applying normalized feed events to the snapshot

use std::sync::atomic::Ordering;
use std::sync::Arc;

use coven_core::{Connectivity, GameStatus, Message, Participant, RemoteStore, Upsert};
use coven_net::{FeedEvent, FeedSink, FeedTransport};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Core, Engine, PhaseTransition};

impl Core {
    /// Apply one event. With `session` set, the event is dropped unless that
    /// session is still the current one.
    pub(crate) fn apply(&self, event: FeedEvent, session: Option<u64>) -> bool {
        let live = |core: &Core| session.map_or(true, |s| core.is_current(s));

        match event {
            FeedEvent::ParticipantUpserted(participant) => {
                let id = participant.id;
                if id.is_nil() {
                    warn!("Participant without identity ignored");
                    return false;
                }
                let mut outcome = None;
                let applied = self.mutate(|s| {
                    if !live(self) {
                        return false;
                    }
                    outcome = Some(s.upsert_participant(participant));
                    true
                });
                if let Some(outcome) = outcome {
                    debug!(participant_id = %id, outcome = ?outcome, "Participant applied");
                    if outcome == Upsert::Inserted {
                        info!(participant_id = %id, "Participant joined");
                    }
                }
                applied
            }
            FeedEvent::ParticipantRemoved(id) => self.mutate(|s| {
                if !live(self) {
                    return false;
                }
                let removed = s.remove_participant(id).is_some();
                if removed {
                    info!(participant_id = %id, "Participant left");
                }
                removed
            }),
            FeedEvent::StatusReplaced(status) => self.replace_status(status, live),
            FeedEvent::MessageAppended(message) => self.mutate(|s| {
                if !live(self) {
                    return false;
                }
                let id = message.id;
                let appended = s.append_message(message);
                if !appended {
                    debug!(message_id = %id, "Duplicate message ignored");
                }
                appended
            }),
        }
    }

    /// Replace the singleton status wholesale. A transition is published after
    /// the commit when a previous status existed with a different tag.
    fn replace_status(&self, status: GameStatus, live: impl Fn(&Core) -> bool) -> bool {
        let mut transition = None;
        let applied = self.mutate(|s| {
            if !live(self) {
                return false;
            }
            let previous = s.replace_status(Some(status.clone()));
            if let Some(previous) = &previous {
                if previous.status != status.status {
                    transition = Some(PhaseTransition {
                        old_phase: previous.status,
                        new_phase: status.status,
                        status: status.clone(),
                    });
                }
            }
            previous.as_ref() != Some(&status)
        });

        if let Some(transition) = transition {
            info!(
                from = %transition.old_phase,
                to = %transition.new_phase,
                day = transition.status.day_number,
                "Phase changed"
            );
            if self.transitions.send(transition).is_err() {
                debug!("No transition listeners");
            }
        }
        applied
    }

    pub(crate) fn apply_connectivity(&self, connectivity: Connectivity, session: u64) {
        let mut recovered = false;
        self.mutate(|s| {
            if !self.is_current(session) || s.connectivity == connectivity {
                return false;
            }
            debug!(connectivity = ?connectivity, "Connectivity changed");
            if connectivity == Connectivity::Connected {
                recovered = self.was_connected.swap(true, Ordering::SeqCst);
            }
            s.connectivity = connectivity;
            true
        });

        if recovered {
            info!(session = session, "Feed reconnected");
            self.reconnected.notify_one();
        }
    }
}

/// Feed sink bound to one engine session
pub struct SessionSink {
    core: Arc<Core>,
    session: u64,
}

impl SessionSink {
    pub(crate) fn new(core: Arc<Core>, session: u64) -> Self {
        Self { core, session }
    }
}

impl FeedSink for SessionSink {
    fn apply(&self, event: FeedEvent) {
        if !self.core.apply(event, Some(self.session)) {
            debug!(session = self.session, "Event had no effect");
        }
    }

    fn set_connectivity(&self, connectivity: Connectivity) {
        self.core.apply_connectivity(connectivity, self.session);
    }
}

impl<S: RemoteStore, T: FeedTransport> Engine<S, T> {
    /// Insert in join order, or replace in place. Returns whether the snapshot changed.
    pub fn apply_participant_upserted(&self, participant: Participant) -> bool {
        self.core
            .apply(FeedEvent::ParticipantUpserted(participant), None)
    }

    pub fn apply_participant_removed(&self, id: Uuid) -> bool {
        self.core.apply(FeedEvent::ParticipantRemoved(id), None)
    }

    pub fn apply_status_replaced(&self, status: GameStatus) -> bool {
        self.core.apply(FeedEvent::StatusReplaced(status), None)
    }

    /// Append, keeping only the most recent messages
    pub fn apply_message_appended(&self, message: Message) -> bool {
        self.core.apply(FeedEvent::MessageAppended(message), None)
    }
}
