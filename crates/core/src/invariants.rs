//! Developer guardrails and invariants
//!
//! Debug assertions for detecting impossible snapshot states during development.
//! These checks are compiled out in release builds.

use std::collections::HashSet;

use uuid::Uuid;

use crate::models::{Snapshot, MESSAGE_LOG_CAP};

/// Validate that a snapshot is structurally sound
pub fn assert_snapshot_invariants(snapshot: &Snapshot) {
    let mut seen = HashSet::new();
    for p in &snapshot.participants {
        assert_participant_id_valid(p.id, "roster");
        debug_assert!(
            seen.insert(p.id),
            "Participant {} appears more than once in the roster",
            p.id
        );
    }

    debug_assert!(
        snapshot.messages.len() <= MESSAGE_LOG_CAP,
        "Message log holds {} entries, cap is {}",
        snapshot.messages.len(),
        MESSAGE_LOG_CAP
    );

    let mut seen = HashSet::new();
    for m in &snapshot.messages {
        debug_assert!(seen.insert(m.id), "Message {} logged twice", m.id);
    }
}

/// Validate that a participant id is not nil
pub fn assert_participant_id_valid(participant_id: Uuid, context: &str) {
    debug_assert!(
        participant_id != Uuid::nil(),
        "Nil participant_id in context: {}",
        context
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Participant;

    #[test]
    fn test_empty_snapshot_valid() {
        assert_snapshot_invariants(&Snapshot::new());
    }

    #[test]
    #[should_panic(expected = "more than once")]
    fn test_duplicate_participant_detected() {
        let mut snapshot = Snapshot::new();
        let p = Participant::new("dup".to_string());
        snapshot.participants.push(p.clone());
        snapshot.participants.push(p);
        assert_snapshot_invariants(&snapshot);
    }

    #[test]
    #[should_panic(expected = "Nil participant_id")]
    fn test_nil_participant_id_detected() {
        assert_participant_id_valid(Uuid::nil(), "test");
    }

    #[test]
    #[should_panic(expected = "Nil participant_id in context: roster")]
    fn test_nil_participant_in_roster_detected() {
        let mut snapshot = Snapshot::new();
        let mut p = Participant::new("ghost".to_string());
        p.id = Uuid::nil();
        snapshot.participants.push(p);
        assert_snapshot_invariants(&snapshot);
    }
}
