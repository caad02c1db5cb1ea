//! Derived views over the snapshot
//!
//! Everything here is a pure projection. [`Views`] recomputes the projections
//! whenever the engine publishes a new snapshot.

use std::collections::VecDeque;

use coven_core::{Affiliation, Connectivity, GamePhase, GameStatus, Message, Participant, Snapshot};
use tokio::sync::watch;
use uuid::Uuid;

/// Roster split by faction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Factions {
    pub cult: Vec<Participant>,
    pub townsfolk: Vec<Participant>,
    pub unassigned: Vec<Participant>,
}

/// Partition participants by affiliation, keeping roster order within each group
pub fn partition_by_affiliation(participants: &[Participant]) -> Factions {
    let mut factions = Factions::default();
    for p in participants {
        let group = match p.affiliation {
            Some(Affiliation::Cult) => &mut factions.cult,
            Some(Affiliation::Townsfolk) => &mut factions.townsfolk,
            None => &mut factions.unassigned,
        };
        group.push(p.clone());
    }
    factions
}

pub fn alive(participants: &[Participant]) -> Vec<Participant> {
    participants.iter().filter(|p| p.is_alive).cloned().collect()
}

/// Current status tag, lobby when the game has no status yet
pub fn current_phase(status: Option<&GameStatus>) -> GamePhase {
    status.map(|s| s.status).unwrap_or_default()
}

pub fn is_game_active(status: Option<&GameStatus>) -> bool {
    status.is_some_and(|s| s.status.is_active())
}

pub fn find_participant(participants: &[Participant], id: Uuid) -> Option<&Participant> {
    participants.iter().find(|p| p.id == id)
}

/// Projections of one snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Derived {
    pub factions: Factions,
    pub alive: Vec<Participant>,
    pub phase: GamePhase,
    pub active: bool,
}

impl Derived {
    pub fn of(snapshot: &Snapshot) -> Self {
        Self {
            factions: partition_by_affiliation(&snapshot.participants),
            alive: alive(&snapshot.participants),
            phase: current_phase(snapshot.status.as_ref()),
            active: is_game_active(snapshot.status.as_ref()),
        }
    }
}

/// Read-only handle on the live snapshot
pub struct Views {
    rx: watch::Receiver<Snapshot>,
    derived: Derived,
}

impl Views {
    pub fn new(rx: watch::Receiver<Snapshot>) -> Self {
        let derived = Derived::of(&rx.borrow());
        Self { rx, derived }
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.rx.borrow().participants.clone()
    }

    pub fn participant(&self, id: Uuid) -> Option<Participant> {
        find_participant(&self.rx.borrow().participants, id).cloned()
    }

    pub fn status(&self) -> Option<GameStatus> {
        self.rx.borrow().status.clone()
    }

    pub fn messages(&self) -> VecDeque<Message> {
        self.rx.borrow().messages.clone()
    }

    pub fn connectivity(&self) -> Connectivity {
        self.rx.borrow().connectivity
    }

    /// Projections as of the last [`Views::changed`]
    pub fn derived(&self) -> &Derived {
        &self.derived
    }

    /// Wait for the next snapshot and recompute the projections.
    ///
    /// Returns `false` once the engine is gone.
    pub async fn changed(&mut self) -> bool {
        if self.rx.changed().await.is_err() {
            return false;
        }
        self.derived = Derived::of(&self.rx.borrow_and_update());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(name: &str, affiliation: Option<Affiliation>, is_alive: bool) -> Participant {
        let mut p = Participant::new(name.to_string());
        p.affiliation = affiliation;
        p.is_alive = is_alive;
        p
    }

    #[test]
    fn test_partition_by_affiliation() {
        let roster = vec![
            participant("a", Some(Affiliation::Cult), true),
            participant("b", None, true),
            participant("c", Some(Affiliation::Townsfolk), false),
            participant("d", Some(Affiliation::Cult), true),
        ];

        let factions = partition_by_affiliation(&roster);
        let names = |ps: &[Participant]| ps.iter().map(|p| p.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(&factions.cult), vec!["a", "d"]);
        assert_eq!(names(&factions.townsfolk), vec!["c"]);
        assert_eq!(names(&factions.unassigned), vec!["b"]);
    }

    #[test]
    fn test_alive_filter() {
        let roster = vec![
            participant("a", None, true),
            participant("b", None, false),
        ];
        let alive = alive(&roster);
        assert_eq!(alive.len(), 1);
        assert_eq!(alive[0].name, "a");
    }

    #[test]
    fn test_phase_defaults_to_lobby() {
        assert_eq!(current_phase(None), GamePhase::Lobby);
        let status = GameStatus::new(GamePhase::Voting, "Day 2 Vote".to_string());
        assert_eq!(current_phase(Some(&status)), GamePhase::Voting);
    }

    #[test]
    fn test_active_game() {
        assert!(!is_game_active(None));
        for phase in GamePhase::all() {
            let status = GameStatus::new(*phase, phase.to_string());
            let expected = !matches!(phase, GamePhase::Lobby | GamePhase::Finished);
            assert_eq!(is_game_active(Some(&status)), expected, "{}", phase);
        }
    }

    #[tokio::test]
    async fn test_views_recompute_on_change() {
        let (tx, rx) = watch::channel(Snapshot::new());
        let mut views = Views::new(rx);
        assert!(!views.derived().active);

        tx.send_modify(|s| {
            s.status = Some(GameStatus::new(GamePhase::Night, "Night 1".to_string()));
            s.participants.push(participant("a", Some(Affiliation::Cult), true));
        });

        assert!(views.changed().await);
        assert!(views.derived().active);
        assert_eq!(views.derived().phase, GamePhase::Night);
        assert_eq!(views.derived().factions.cult.len(), 1);

        drop(tx);
        assert!(!views.changed().await);
    }
}
