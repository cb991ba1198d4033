// Linearizable reads via ReadIndex
//
// A read never touches the log. The leader pins the request to its
// current commit index, confirms it is still the leader with a round of
// heartbeats acknowledged by a majority, waits for the state machine to
// catch up to the pinned index, and only then lets the caller read.

use std::collections::HashSet;

use tracing::debug;

use crate::error::{RaftError, Result};
use crate::types::{LogIndex, NodeId, Role};
use crate::RaftNode;

/// Callback invoked when a linearizable read may be served (`Ok` carries
/// the pinned read index) or must be abandoned (`NotLeader` on step-down).
pub type ReadCallback = Box<dyn FnOnce(Result<LogIndex>)>;

pub(crate) struct ReadRequest {
    pub(crate) read_index: LogIndex,
    pub(crate) acked: HashSet<NodeId>,
    pub(crate) callback: ReadCallback,
}

impl RaftNode {
    /// Request a linearizable read barrier. The callback fires once the
    /// leadership is confirmed by a majority and `last_applied` has
    /// reached the commit index observed here.
    pub fn read_index(&mut self, callback: ReadCallback) -> Result<()> {
        if !self.running {
            return Err(RaftError::Stopped);
        }
        if self.role != Role::Leader {
            return Err(RaftError::NotLeader);
        }

        let read_index = self.commit_index;
        if self.cluster.size() == 1 {
            // sole member: leadership cannot be contested
            self.apply_committed()?;
            callback(Ok(read_index));
            return Ok(());
        }

        debug!(
            node_id = self.id(),
            read_index,
            "queued linearizable read"
        );
        self.pending_reads.push(ReadRequest {
            read_index,
            acked: HashSet::new(),
            callback,
        });
        // confirm leadership now instead of waiting out the heartbeat timer
        self.replicate_all();
        Ok(())
    }

    /// Record a heartbeat acknowledgment from `from` against every pending
    /// read; each peer counts at most once per request.
    pub(crate) fn process_read_acks(&mut self, from: NodeId) {
        if self.role != Role::Leader || self.pending_reads.is_empty() {
            return;
        }
        for request in &mut self.pending_reads {
            request.acked.insert(from);
        }
        self.complete_ready_reads();
    }

    /// Fire callbacks for reads whose quorum arrived and whose pinned
    /// index has been applied.
    pub(crate) fn complete_ready_reads(&mut self) {
        if self.pending_reads.is_empty() {
            return;
        }
        // peer acks needed so that, with this node, a majority confirms
        let needed = self.cluster.size() / 2;
        let last_applied = self.last_applied;

        let mut i = 0;
        while i < self.pending_reads.len() {
            let ready = self.pending_reads[i].acked.len() >= needed
                && last_applied >= self.pending_reads[i].read_index;
            if ready {
                let request = self.pending_reads.remove(i);
                (request.callback)(Ok(request.read_index));
            } else {
                i += 1;
            }
        }
    }

    /// Leadership is gone: every outstanding read fails with `NotLeader`.
    pub(crate) fn fail_pending_reads(&mut self) {
        if self.pending_reads.is_empty() {
            return;
        }
        debug!(
            node_id = self.id(),
            count = self.pending_reads.len(),
            "cancelling pending reads"
        );
        let cancelled: Vec<ReadRequest> = self.pending_reads.drain(..).collect();
        for request in cancelled {
            (request.callback)(Err(RaftError::NotLeader));
        }
    }

    /// Number of reads still waiting on quorum confirmation.
    pub fn pending_read_count(&self) -> usize {
        self.pending_reads.len()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::error::RaftError;
    use crate::testutil::make_node;
    use crate::types::LogIndex;
    use crate::wire::{AppendEntriesResponse, RequestVoteResponse};

    type Outcomes = Rc<RefCell<Vec<Result<LogIndex, String>>>>;

    fn recording_callback(outcomes: &Outcomes) -> crate::read::ReadCallback {
        let outcomes = Rc::clone(outcomes);
        Box::new(move |result| {
            outcomes
                .borrow_mut()
                .push(result.map_err(|e| e.to_string()));
        })
    }

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

    fn ack(node: &mut crate::RaftNode, from: u32) {
        let term = node.current_term();
        let match_index = node.log().last_index();
        node.handle_append_entries_response(
            from,
            &AppendEntriesResponse {
                term,
                success: true,
                match_index,
            },
        )
        .unwrap();
    }

    #[test]
    fn read_on_follower_is_refused() {
        let (mut node, _outbox) = make_node(1, 3);
        node.start().unwrap();
        let outcomes: Outcomes = Rc::new(RefCell::new(Vec::new()));
        let result = node.read_index(recording_callback(&outcomes));
        assert!(matches!(result, Err(RaftError::NotLeader)));
        assert!(outcomes.borrow().is_empty());
    }

    #[test]
    fn single_node_read_fires_immediately() {
        let (mut node, _outbox) = make_node(0, 1);
        node.start().unwrap();
        node.propose(b"x").unwrap();

        let outcomes: Outcomes = Rc::new(RefCell::new(Vec::new()));
        node.read_index(recording_callback(&outcomes)).unwrap();
        assert_eq!(*outcomes.borrow(), vec![Ok(1)]);
    }

    #[test]
    fn read_completes_after_majority_acks() {
        let (mut node, _outbox) = make_node(0, 5);
        node.start().unwrap();
        elect(&mut node);

        let outcomes: Outcomes = Rc::new(RefCell::new(Vec::new()));
        node.read_index(recording_callback(&outcomes)).unwrap();
        assert_eq!(node.pending_read_count(), 1);

        ack(&mut node, 1);
        assert_eq!(node.pending_read_count(), 1);
        ack(&mut node, 2);
        assert_eq!(node.pending_read_count(), 0);
        assert_eq!(*outcomes.borrow(), vec![Ok(0)]);
    }

    #[test]
    fn duplicate_acks_do_not_complete_a_read() {
        let (mut node, _outbox) = make_node(0, 5);
        node.start().unwrap();
        elect(&mut node);

        let outcomes: Outcomes = Rc::new(RefCell::new(Vec::new()));
        node.read_index(recording_callback(&outcomes)).unwrap();

        ack(&mut node, 1);
        ack(&mut node, 1);
        ack(&mut node, 1);
        assert_eq!(node.pending_read_count(), 1);
        assert!(outcomes.borrow().is_empty());
    }

    #[test]
    fn step_down_cancels_reads_with_not_leader() {
        let (mut node, _outbox) = make_node(0, 3);
        node.start().unwrap();
        elect(&mut node);

        let outcomes: Outcomes = Rc::new(RefCell::new(Vec::new()));
        node.read_index(recording_callback(&outcomes)).unwrap();
        node.read_index(recording_callback(&outcomes)).unwrap();
        assert_eq!(node.pending_read_count(), 2);

        node.step_down(node.current_term() + 1).unwrap();
        assert_eq!(node.pending_read_count(), 0);
        let outcomes = outcomes.borrow();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.is_err()));
    }
}
