//! Reconciliation engine
//!
//! Owns the game snapshot. The snapshot is filled by a full load, kept live
//! by the change feed, and mutated optimistically by local writes.

mod actions;
mod feed;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use coven_core::invariants::assert_snapshot_invariants;
use coven_core::{
    Connectivity, Error, GamePhase, GameStatus, Gateway, LoadOutcome, Participant, RemoteStore,
    Result, Snapshot,
};
use coven_net::{ChangeFeedSubscriber, ChannelNames, FeedTransport};
use tokio::sync::{broadcast, watch, Notify};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::views::{self, Views};

pub use feed::SessionSink;

/// Buffered transitions per listener before it starts lagging
const TRANSITION_BUFFER: usize = 16;

/// Engine lifecycle, independent of the game's own phase.
///
/// Tracks the snapshot only. Feed health is reported separately as the
/// snapshot's `connectivity`, so an engine can be `Live` with connectivity
/// `Error` when the load succeeded but the feed could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Loading,
    /// The last load succeeded
    Live,
    /// The last load failed in at least one part
    LoadFailed,
    /// The feed was closed by `cleanup`
    Disconnected,
}

/// Published once per observed change of the status tag
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseTransition {
    pub old_phase: GamePhase,
    pub new_phase: GamePhase,
    pub status: GameStatus,
}

/// State shared between the engine and its feed sink
pub(crate) struct Core {
    snapshot: watch::Sender<Snapshot>,
    transitions: broadcast::Sender<PhaseTransition>,
    lifecycle: Mutex<Lifecycle>,
    /// Bumped at every initialize and cleanup; feed sinks from older sessions are ignored
    epoch: AtomicU64,
    /// The current session has been connected at least once
    was_connected: AtomicBool,
    /// Signalled when the feed comes back after a drop
    reconnected: Notify,
}

impl Core {
    fn new() -> Self {
        let (snapshot, _) = watch::channel(Snapshot::new());
        let (transitions, _) = broadcast::channel(TRANSITION_BUFFER);
        Self {
            snapshot,
            transitions,
            lifecycle: Mutex::new(Lifecycle::Uninitialized),
            epoch: AtomicU64::new(0),
            was_connected: AtomicBool::new(false),
            reconnected: Notify::new(),
        }
    }

    pub(crate) fn is_current(&self, session: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == session
    }

    fn next_session(&self) -> u64 {
        self.was_connected.store(false, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_lifecycle(&self, lifecycle: Lifecycle) {
        *self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()) = lifecycle;
    }

    /// Apply one mutation atomically. Watchers are only woken when `f` reports a change.
    pub(crate) fn mutate(&self, f: impl FnOnce(&mut Snapshot) -> bool) -> bool {
        self.snapshot.send_if_modified(|snapshot| {
            let modified = f(snapshot);
            assert_snapshot_invariants(snapshot);
            modified
        })
    }

    fn set_connectivity(&self, connectivity: Connectivity) {
        self.mutate(|s| {
            let changed = s.connectivity != connectivity;
            s.connectivity = connectivity;
            changed
        });
    }

    fn begin_load(&self) {
        self.mutate(|s| {
            s.is_loading = true;
            s.error = None;
            true
        });
    }

    /// Commit every part that loaded. Failed parts keep their previous contents.
    fn commit_load(&self, outcome: LoadOutcome) -> Option<Error> {
        let error = outcome.error();
        let message = error.as_ref().map(ToString::to_string);
        let LoadOutcome {
            participants,
            status,
            messages,
        } = outcome;

        self.mutate(|s| {
            if let Ok(participants) = participants {
                s.replace_participants(participants);
            }
            if let Ok(status) = status {
                s.replace_status(status);
            }
            if let Ok(messages) = messages {
                s.replace_messages(messages);
            }
            s.is_loading = false;
            s.error = message;
            true
        });
        error
    }
}

/// The single owner of one game's mirrored state
pub struct Engine<S, T> {
    core: Arc<Core>,
    gateway: Gateway<S>,
    subscriber: tokio::sync::Mutex<ChangeFeedSubscriber<T>>,
}

impl<S: RemoteStore, T: FeedTransport> Engine<S, T> {
    pub fn new(store: S, transport: T) -> Self {
        Self::with_channels(store, transport, ChannelNames::default())
    }

    pub fn with_channels(store: S, transport: T, names: ChannelNames) -> Self {
        Self {
            core: Arc::new(Core::new()),
            gateway: Gateway::new(store),
            subscriber: tokio::sync::Mutex::new(ChangeFeedSubscriber::new(transport, names)),
        }
    }

    pub fn gateway(&self) -> &Gateway<S> {
        &self.gateway
    }

    /// Load the snapshot, then open the feed.
    ///
    /// The feed is opened even when the load fails so the mirror can still
    /// converge; the load error is returned after both steps.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<()> {
        let mut subscriber = self.subscriber.lock().await;
        let session = self.core.next_session();
        self.core.set_lifecycle(Lifecycle::Loading);

        let loaded = self.load().await;
        self.core.set_lifecycle(if loaded.is_ok() {
            Lifecycle::Live
        } else {
            Lifecycle::LoadFailed
        });

        let sink = Arc::new(SessionSink::new(self.core.clone(), session));
        if let Err(e) = subscriber.open(sink).await {
            warn!(error = %e, "Change feed unavailable");
        }

        info!(session = session, lifecycle = ?self.core.lifecycle(), "Engine initialized");
        loaded
    }

    /// Reload the whole snapshot without touching the feed
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<()> {
        self.load().await
    }

    /// Close the feed. The snapshot contents are kept.
    #[instrument(skip(self))]
    pub async fn cleanup(&self) {
        let mut subscriber = self.subscriber.lock().await;
        self.core.next_session();
        subscriber.close().await;
        self.core.set_connectivity(Connectivity::Disconnected);
        self.core.set_lifecycle(Lifecycle::Disconnected);
        info!("Engine disconnected");
    }

    async fn load(&self) -> Result<()> {
        self.core.begin_load();
        let outcome = self.gateway.load_snapshot().await;
        match self.core.commit_load(outcome) {
            Some(e) => {
                warn!(error = %e, "Snapshot load incomplete");
                Err(e)
            }
            None => Ok(()),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.core.lifecycle()
    }

    /// Resolves when the feed reconnects after a drop.
    ///
    /// Changes made while the feed was down are not replayed, so callers
    /// should [`refresh`](Self::refresh) when this fires.
    pub async fn reconnected(&self) {
        self.core.reconnected.notified().await;
    }

    /// A copy of the current snapshot
    pub fn snapshot(&self) -> Snapshot {
        self.core.snapshot.borrow().clone()
    }

    /// Reactive handle on the snapshot
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.core.snapshot.subscribe()
    }

    pub fn views(&self) -> Views {
        Views::new(self.watch())
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<PhaseTransition> {
        self.core.transitions.subscribe()
    }

    pub fn participant(&self, id: Uuid) -> Option<Participant> {
        self.core.snapshot.borrow().participant(id).cloned()
    }

    pub fn is_game_active(&self) -> bool {
        views::is_game_active(self.core.snapshot.borrow().status.as_ref())
    }
}
