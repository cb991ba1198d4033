// Leadership transfer
//
// The leader picks a target (the most caught-up follower by default),
// waits for its match_index to reach the log tail, then sends TimeoutNow.
// The target starts an election immediately, skipping PreVote, and wins
// it at term + 1 under normal conditions. Losing leadership or an explicit
// abort cancels the handover.

use tracing::{debug, info};

use crate::error::{RaftError, Result};
use crate::types::{NodeId, Role};
use crate::wire::{Message, TimeoutNow};
use crate::RaftNode;

#[derive(Debug, Clone, Copy)]
pub(crate) struct TransferState {
    pub(crate) target: NodeId,
    pub(crate) timeout_sent: bool,
}

impl RaftNode {
    /// Hand leadership to `target`, or to the most up-to-date follower
    /// when `None`.
    pub fn transfer_leadership(&mut self, target: Option<NodeId>) -> Result<()> {
        if !self.running {
            return Err(RaftError::Stopped);
        }
        if self.role != Role::Leader {
            return Err(RaftError::NotLeader);
        }

        let target = match target {
            Some(id) => {
                if id == self.id() {
                    return Err(RaftError::InvalidArgument(
                        "cannot transfer leadership to self".into(),
                    ));
                }
                if !self.cluster.is_member(id) {
                    return Err(RaftError::InvalidArgument(format!(
                        "node {id} is not a member"
                    )));
                }
                id
            }
            None => self
                .most_caught_up_peer()
                .ok_or_else(|| RaftError::InvalidArgument("no follower to transfer to".into()))?,
        };

        info!(
            node_id = self.id(),
            term = self.current_term,
            target,
            "starting leadership transfer"
        );
        self.transfer = Some(TransferState {
            target,
            timeout_sent: false,
        });
        self.transfer_check_progress();
        Ok(())
    }

    /// Cancel an in-flight transfer, if any.
    pub fn abort_transfer(&mut self) {
        if self.transfer.take().is_some() {
            debug!(node_id = self.id(), "leadership transfer aborted");
        }
    }

    pub fn transfer_in_progress(&self) -> bool {
        self.transfer.is_some()
    }

    pub fn transfer_target(&self) -> Option<NodeId> {
        self.transfer.map(|t| t.target)
    }

    /// Called as replication acknowledgments arrive: once the target holds
    /// the whole log, tell it to take over.
    pub(crate) fn transfer_check_progress(&mut self) {
        let Some(state) = self.transfer else {
            return;
        };
        if self.role != Role::Leader {
            self.abort_transfer();
            return;
        }
        if state.timeout_sent {
            return;
        }

        let target_match = self.match_index.get(&state.target).copied().unwrap_or(0);
        if target_match >= self.log.last_index() {
            info!(
                node_id = self.id(),
                term = self.current_term,
                target = state.target,
                "transfer target caught up, sending timeout-now"
            );
            let message = Message::TimeoutNow(TimeoutNow {
                term: self.current_term,
                leader_id: self.id(),
            });
            self.send_to(state.target, &message);
            self.transfer = Some(TransferState {
                timeout_sent: true,
                ..state
            });
        }
    }

    /// Transfer target path: the leader asked us to take over, so start an
    /// election right now, bypassing PreVote.
    pub(crate) fn handle_timeout_now(&mut self, from: NodeId, message: &TimeoutNow) -> Result<()> {
        if message.term < self.current_term {
            return Ok(());
        }
        if message.term > self.current_term {
            self.step_down(message.term)?;
        }
        info!(
            node_id = self.id(),
            term = self.current_term,
            from,
            "timeout-now received, starting immediate election"
        );
        self.start_election()
    }

    fn most_caught_up_peer(&self) -> Option<NodeId> {
        self.replication_targets()
            .into_iter()
            .filter(|peer| self.cluster.is_member(*peer))
            .max_by_key(|peer| self.match_index.get(peer).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::{drain, make_node};
    use crate::types::Role;
    use crate::wire::{AppendEntriesResponse, Message, RequestVoteResponse, TimeoutNow};

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
    fn transfer_requires_leadership() {
        let (mut node, _outbox) = make_node(0, 3);
        node.start().unwrap();
        assert!(node.transfer_leadership(Some(1)).is_err());
    }

    #[test]
    fn transfer_to_self_or_stranger_is_invalid() {
        let (mut node, _outbox) = make_node(0, 3);
        node.start().unwrap();
        elect(&mut node);
        assert!(node.transfer_leadership(Some(0)).is_err());
        assert!(node.transfer_leadership(Some(7)).is_err());
    }

    #[test]
    fn timeout_now_fires_once_target_catches_up() {
        let (mut node, outbox) = make_node(0, 3);
        node.start().unwrap();
        elect(&mut node);
        node.propose(b"x").unwrap();
        let last = node.log().last_index();
        drain(&outbox);

        node.transfer_leadership(Some(1)).unwrap();
        assert!(node.transfer_in_progress());
        // nothing sent while the target lags
        assert!(drain(&outbox)
            .iter()
            .all(|(_, f)| !matches!(Message::decode(f).unwrap(), Message::TimeoutNow(_))));

        let term = node.current_term();
        node.handle_append_entries_response(
            1,
            &AppendEntriesResponse {
                term,
                success: true,
                match_index: last,
            },
        )
        .unwrap();

        let sent = drain(&outbox);
        let timeout_now: Vec<_> = sent
            .iter()
            .filter(|(peer, f)| {
                *peer == 1 && matches!(Message::decode(f).unwrap(), Message::TimeoutNow(_))
            })
            .collect();
        assert_eq!(timeout_now.len(), 1);
    }

    #[test]
    fn unspecified_target_picks_most_caught_up() {
        let (mut node, _outbox) = make_node(0, 3);
        node.start().unwrap();
        elect(&mut node);
        node.propose(b"x").unwrap();
        let term = node.current_term();
        node.handle_append_entries_response(
            2,
            &AppendEntriesResponse {
                term,
                success: true,
                match_index: 1,
            },
        )
        .unwrap();

        node.transfer_leadership(None).unwrap();
        assert_eq!(node.transfer_target(), Some(2));
    }

    #[test]
    fn timeout_now_starts_immediate_election() {
        let (mut node, _outbox) = make_node(1, 3);
        node.start().unwrap();
        node.handle_timeout_now(
            0,
            &TimeoutNow {
                term: 0,
                leader_id: 0,
            },
        )
        .unwrap();
        assert_eq!(node.role(), Role::Candidate);
        assert_eq!(node.current_term(), 1);
    }

    #[test]
    fn stale_timeout_now_is_ignored() {
        let (mut node, _outbox) = make_node(1, 3);
        node.start().unwrap();
        node.step_down(5).unwrap();
        node.handle_timeout_now(
            0,
            &TimeoutNow {
                term: 2,
                leader_id: 0,
            },
        )
        .unwrap();
        assert_eq!(node.role(), Role::Follower);
        assert_eq!(node.current_term(), 5);
    }

    #[test]
    fn step_down_aborts_transfer() {
        let (mut node, _outbox) = make_node(0, 3);
        node.start().unwrap();
        elect(&mut node);
        node.transfer_leadership(Some(1)).unwrap();
        assert!(node.transfer_in_progress());

        node.step_down(node.current_term() + 1).unwrap();
        assert!(!node.transfer_in_progress());
    }
}
