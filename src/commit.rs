// Commit index advancement
//
// A leader may advance commit_index to the highest index replicated on a
// strict majority of the configuration, but only when the entry at that
// index carries the current term: an older-term entry is committed solely
// by committing a current-term entry above it.

use tracing::debug;

use crate::error::Result;
use crate::types::{LogIndex, Role};
use crate::RaftNode;

impl RaftNode {
    /// Highest index replicated on a majority of the configuration. The
    /// leader's own tail participates here; the peer maps never track self.
    pub(crate) fn majority_match_index(&self) -> LogIndex {
        let mut matches: Vec<LogIndex> = self
            .replication_targets()
            .iter()
            .map(|peer| self.match_index.get(peer).copied().unwrap_or(0))
            .collect();
        matches.push(self.log.last_index());
        matches.sort_unstable();

        // the largest index that a majority of the n participants has
        // replicated sits below the top majority-1 values
        let n = matches.len();
        matches[(n - 1) / 2]
    }

    /// Try to move commit_index forward and apply what became committed.
    pub(crate) fn advance_commit_index(&mut self) -> Result<()> {
        if self.role != Role::Leader {
            return Ok(());
        }

        let candidate = self.majority_match_index();
        if candidate <= self.commit_index {
            return Ok(());
        }

        // current-term safety rule; terms are non-decreasing along the
        // log, so no lower index can qualify either when this fails
        if self.log.term_at(candidate) != self.current_term {
            return Ok(());
        }

        debug!(
            node_id = self.id(),
            from = self.commit_index,
            to = candidate,
            "advancing commit index"
        );
        self.commit_index = candidate;
        self.apply_committed()
    }

    /// Whether `index` is covered by the committed prefix.
    pub fn is_committed(&self, index: LogIndex) -> bool {
        index > 0 && index <= self.commit_index
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::make_node;
    use crate::types::EntryKind;
    use crate::wire::RequestVoteResponse;

    fn elect(node: &mut crate::RaftNode) {
        node.start_election().unwrap();
        node.handle_request_vote_response(
            1,
            &RequestVoteResponse {
                term: node.current_term(),
                vote_granted: true,
            },
        )
        .unwrap();
        assert!(node.is_leader());
    }

    #[test]
    fn majority_counts_self_tail() {
        let (mut node, _outbox) = make_node(0, 3);
        node.start().unwrap();
        elect(&mut node);
        node.propose(b"a").unwrap();
        node.propose(b"b").unwrap();

        // no follower acks yet: only the leader holds the entries
        assert_eq!(node.majority_match_index(), 0);
        assert!(!node.is_committed(1));

        node.match_index.insert(1, 2);
        assert_eq!(node.majority_match_index(), 2);
        node.advance_commit_index().unwrap();
        assert!(node.is_committed(2));
    }

    #[test]
    fn five_node_majority_needs_three_copies() {
        let (mut node, _outbox) = make_node(0, 5);
        node.start().unwrap();
        elect(&mut node);
        for _ in 0..4 {
            node.propose(b"x").unwrap();
        }

        // two of five holding index 4 is not a majority
        node.match_index.insert(1, 4);
        assert_eq!(node.majority_match_index(), 0);

        node.match_index.insert(2, 4);
        assert_eq!(node.majority_match_index(), 4);

        node.match_index.insert(1, 2);
        node.match_index.insert(2, 1);
        // copies: self=4, p1=2, p2=1, p3=0, p4=0 -> 3 nodes hold >= 1
        assert_eq!(node.majority_match_index(), 1);
    }

    #[test]
    fn older_term_entries_are_not_committed_directly() {
        let (mut node, _outbox) = make_node(0, 3);
        node.start().unwrap();
        // an entry from term 1 sits uncommitted in the log
        node.log.append(1, EntryKind::Command, b"old".to_vec());
        node.current_term = 2;
        node.voted_for = Some(0);
        node.become_leader().unwrap();
        // become_leader appended a noop at term 2 (index 2)

        // a majority holds index 1 only
        node.match_index.insert(1, 1);
        node.advance_commit_index().unwrap();
        assert_eq!(node.commit_index(), 0);

        // once the majority reaches the term-2 noop, both commit
        node.match_index.insert(1, 2);
        node.advance_commit_index().unwrap();
        assert_eq!(node.commit_index(), 2);
    }
}
