// Timer management
//
// No internal clock: the driver feeds elapsed milliseconds through
// tick(), ideally at a granularity well below the heartbeat interval.
// Election timeouts are re-randomized on every reset to keep split votes
// rare; leaders run the heartbeat timer instead.

use rand::Rng;

use crate::error::{RaftError, Result};
use crate::types::Role;
use crate::RaftNode;

impl RaftNode {
    /// Advance all timers. May start a PreVote round, restart a stalled
    /// election, or fire a round of heartbeats.
    pub fn tick(&mut self, elapsed_ms: u64) -> Result<()> {
        if !self.running {
            return Err(RaftError::Stopped);
        }
        self.leader_contact_ms = self.leader_contact_ms.saturating_add(elapsed_ms);
        self.tick_election(elapsed_ms)?;
        self.tick_heartbeat(elapsed_ms)
    }

    fn tick_election(&mut self, elapsed_ms: u64) -> Result<()> {
        if self.role == Role::Leader {
            return Ok(());
        }
        self.election_timer_ms += elapsed_ms;
        if self.election_timer_ms < self.election_timeout_ms {
            return Ok(());
        }

        match self.role {
            // a candidate's stalled election is retried directly; everyone
            // else probes with a PreVote round first
            Role::Candidate => self.start_election(),
            _ => self.start_prevote(),
        }
    }

    fn tick_heartbeat(&mut self, elapsed_ms: u64) -> Result<()> {
        if self.role != Role::Leader {
            return Ok(());
        }
        self.heartbeat_timer_ms += elapsed_ms;
        if self.heartbeat_timer_ms >= self.config.heartbeat_interval_ms {
            self.heartbeat_timer_ms = 0;
            self.replicate_all();
        }
        Ok(())
    }

    /// Re-arm the election timer with a fresh random timeout.
    pub(crate) fn reset_election_timer(&mut self) {
        self.election_timer_ms = 0;
        self.election_timeout_ms = rand::rng().random_range(
            self.config.election_timeout_min_ms..=self.config.election_timeout_max_ms,
        );
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::make_node;
    use crate::types::Role;

    #[test]
    fn timeout_is_within_configured_range() {
        let (mut node, _outbox) = make_node(0, 3);
        for _ in 0..50 {
            node.reset_election_timer();
            assert!(node.election_timeout_ms >= node.config.election_timeout_min_ms);
            assert!(node.election_timeout_ms <= node.config.election_timeout_max_ms);
        }
    }

    #[test]
    fn tick_before_timeout_changes_nothing() {
        let (mut node, _outbox) = make_node(0, 3);
        node.start().unwrap();
        node.tick(node.config.election_timeout_min_ms - 1).unwrap();
        assert_eq!(node.role(), Role::Follower);
    }

    #[test]
    fn tick_past_timeout_starts_prevote() {
        let (mut node, _outbox) = make_node(0, 3);
        node.start().unwrap();
        node.tick(node.config.election_timeout_max_ms).unwrap();
        assert_eq!(node.role(), Role::PreCandidate);
    }

    #[test]
    fn tick_on_stopped_node_errors() {
        let (mut node, _outbox) = make_node(0, 3);
        assert!(node.tick(10).is_err());
    }

    #[test]
    fn accumulated_small_ticks_trigger_timeout() {
        let (mut node, _outbox) = make_node(0, 3);
        node.start().unwrap();
        for _ in 0..(node.config.election_timeout_max_ms / 10) {
            node.tick(10).unwrap();
        }
        assert_eq!(node.role(), Role::PreCandidate);
    }
}
