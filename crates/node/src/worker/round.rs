//! Local per-oracle round bookkeeping for data feed submissions.

use alloy::primitives::Address;
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::jobs::WorkerSource;

#[derive(Debug, Default, Clone, Copy)]
struct RoundState {
    to_submit_round_id: u32,
    submitted_round_id: u32,
    submitter: Option<WorkerSource>,
}

/// Tracks which round each oracle is submitting, so that the event path and
/// the heartbeat path never submit the same round twice.
#[derive(Debug, Default)]
pub struct RoundTracker {
    oracles: Mutex<HashMap<Address, RoundState>>,
}

impl RoundTracker {
    /// Create a new [Self].
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `round` for `source`. Returns false when another source is
    /// submitting this round or a later one, or when the round was already
    /// submitted.
    pub fn claim(&self, oracle: Address, round: u32, source: WorkerSource) -> bool {
        let mut oracles = self.oracles.lock();
        let state = oracles.entry(oracle).or_default();

        if state.to_submit_round_id >= round && state.submitter != Some(source) {
            return false;
        }
        if state.submitted_round_id >= round {
            return false;
        }

        state.to_submit_round_id = round;
        state.submitter = Some(source);
        true
    }

    /// Record that `round` was handed to the reporter.
    pub fn mark_submitted(&self, oracle: Address, round: u32) {
        self.oracles.lock().entry(oracle).or_default().submitted_round_id = round;
    }

    /// Reopen `round` after its reporter job was dropped, so that any source
    /// may claim it again. Only the latest handed off round can be released.
    pub fn release(&self, oracle: Address, round: u32) -> bool {
        let mut oracles = self.oracles.lock();
        let Some(state) = oracles.get_mut(&oracle) else {
            return false;
        };
        if state.submitted_round_id != round || state.to_submit_round_id != round {
            return false;
        }

        state.to_submit_round_id = round.saturating_sub(1);
        state.submitted_round_id = round.saturating_sub(1);
        state.submitter = None;
        true
    }

    /// Forget `oracle`.
    pub fn remove(&self, oracle: Address) {
        self.oracles.lock().remove(&oracle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkerSource::{Deviation, Event, Heartbeat};

    #[test]
    fn claim_rules() {
        let tracker = RoundTracker::new();
        let oracle = Address::repeat_byte(0xaa);

        assert!(tracker.claim(oracle, 1, Event));
        // Same source may retry the round it claimed.
        assert!(tracker.claim(oracle, 1, Event));
        // Another source is mid-submission for this round.
        assert!(!tracker.claim(oracle, 1, Heartbeat));

        tracker.mark_submitted(oracle, 1);
        assert!(!tracker.claim(oracle, 1, Event));

        // A later round is open to anyone.
        assert!(tracker.claim(oracle, 2, Heartbeat));
        assert!(!tracker.claim(oracle, 2, Event));
        assert!(!tracker.claim(oracle, 1, Heartbeat));

        // Oracles are independent.
        assert!(tracker.claim(Address::repeat_byte(0xbb), 1, Heartbeat));
    }

    #[test]
    fn released_round_is_open_to_every_source() {
        let tracker = RoundTracker::new();
        let oracle = Address::repeat_byte(0xaa);

        // Nothing handed off yet.
        assert!(!tracker.release(oracle, 4));

        assert!(tracker.claim(oracle, 4, Event));
        tracker.mark_submitted(oracle, 4);
        assert!(!tracker.claim(oracle, 4, Heartbeat));
        assert!(!tracker.claim(oracle, 4, Deviation));

        // An older round is not reopened.
        assert!(!tracker.release(oracle, 3));
        assert!(tracker.release(oracle, 4));
        assert!(tracker.claim(oracle, 4, Heartbeat));
        assert!(!tracker.claim(oracle, 4, Event));
    }
}
