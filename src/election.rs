// Leader election
//
// Election timeouts funnel followers through a PreVote round before any
// term is burned: a PreCandidate solicits hypothetical votes at term + 1
// and only a majority of grants starts a real election. Responders never
// change state for a PreVote, so a partitioned node rejoining cannot
// disrupt a stable leader.

use tracing::{debug, info};

use crate::error::Result;
use crate::types::{NodeId, Role, Term};
use crate::wire::{
    Message, PreVote, PreVoteResponse, RequestVote, RequestVoteResponse,
};
use crate::RaftNode;

impl RaftNode {
    /// Revert to follower at `new_term`, clearing the vote. Persists the
    /// new term before anything depending on it can be sent.
    pub(crate) fn step_down(&mut self, new_term: Term) -> Result<()> {
        info!(
            node_id = self.id(),
            old_term = self.current_term,
            new_term,
            "stepping down to follower"
        );
        self.role = Role::Follower;
        self.current_term = new_term;
        self.voted_for = None;
        self.current_leader = None;
        self.votes_granted.clear();
        self.prevotes_granted.clear();
        self.next_index.clear();
        self.match_index.clear();
        self.abort_transfer();
        self.fail_pending_reads();
        self.persist_state()?;
        self.reset_election_timer();
        Ok(())
    }

    /// Begin a PreVote round. No persistent state changes here; the term
    /// is only incremented once a majority says the real election would
    /// succeed.
    pub(crate) fn start_prevote(&mut self) -> Result<()> {
        self.role = Role::PreCandidate;
        self.current_leader = None;
        self.prevotes_granted.clear();
        self.prevotes_granted.insert(self.id());
        self.reset_election_timer();

        debug!(
            node_id = self.id(),
            term = self.current_term,
            "starting pre-vote round"
        );

        if self.prevotes_granted.len() >= self.quorum() {
            return self.start_election();
        }

        let request = Message::PreVote(PreVote {
            term: self.current_term + 1,
            candidate_id: self.id(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        });
        for peer in self.replication_targets() {
            self.send_to(peer, &request);
        }
        Ok(())
    }

    /// Begin a real election: bump the term, vote for self, persist, then
    /// solicit votes. A single-node cluster promotes immediately.
    pub(crate) fn start_election(&mut self) -> Result<()> {
        self.role = Role::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id());
        self.current_leader = None;
        self.votes_granted.clear();
        self.votes_granted.insert(self.id());
        self.persist_state()?;
        self.reset_election_timer();

        info!(
            node_id = self.id(),
            term = self.current_term,
            "starting election"
        );

        if self.votes_granted.len() >= self.quorum() {
            return self.become_leader();
        }

        let request = Message::RequestVote(RequestVote {
            term: self.current_term,
            candidate_id: self.id(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        });
        for peer in self.replication_targets() {
            self.send_to(peer, &request);
        }
        Ok(())
    }

    /// A candidate log is up-to-date if its last term beats ours, or ties
    /// with an index at least as large.
    fn log_up_to_date(&self, last_log_term: Term, last_log_index: u64) -> bool {
        let my_last_term = self.log.last_term();
        last_log_term > my_last_term
            || (last_log_term == my_last_term && last_log_index >= self.log.last_index())
    }

    pub(crate) fn handle_request_vote(
        &mut self,
        request: &RequestVote,
    ) -> Result<RequestVoteResponse> {
        if request.term > self.current_term {
            self.step_down(request.term)?;
        }
        if request.term < self.current_term {
            return Ok(RequestVoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        let can_vote = self
            .voted_for
            .map_or(true, |id| id == request.candidate_id);
        let granted =
            can_vote && self.log_up_to_date(request.last_log_term, request.last_log_index);

        if granted {
            self.voted_for = Some(request.candidate_id);
            // the vote must be durable before the reply leaves this node
            self.persist_state()?;
            self.reset_election_timer();
            info!(
                node_id = self.id(),
                term = self.current_term,
                candidate = request.candidate_id,
                "granted vote"
            );
        } else {
            debug!(
                node_id = self.id(),
                term = self.current_term,
                candidate = request.candidate_id,
                "rejected vote"
            );
        }

        Ok(RequestVoteResponse {
            term: self.current_term,
            vote_granted: granted,
        })
    }

    pub(crate) fn handle_request_vote_response(
        &mut self,
        from: NodeId,
        response: &RequestVoteResponse,
    ) -> Result<()> {
        if response.term > self.current_term {
            return self.step_down(response.term);
        }
        if self.role != Role::Candidate || response.term < self.current_term {
            return Ok(());
        }

        if response.vote_granted && self.votes_granted.insert(from) {
            debug!(
                node_id = self.id(),
                term = self.current_term,
                from,
                votes = self.votes_granted.len(),
                "vote received"
            );
            if self.votes_granted.len() >= self.quorum() {
                return self.become_leader();
            }
        }
        Ok(())
    }

    /// PreVote responder path: grants never touch current_term or
    /// voted_for, and a node that recently heard from a leader refuses.
    pub(crate) fn handle_pre_vote(&mut self, request: &PreVote) -> PreVoteResponse {
        let leader_is_stale = self.current_leader.is_none()
            || self.leader_contact_ms >= self.election_timeout_ms;
        let granted = request.term > self.current_term
            && leader_is_stale
            && self.log_up_to_date(request.last_log_term, request.last_log_index);

        debug!(
            node_id = self.id(),
            term = self.current_term,
            candidate = request.candidate_id,
            granted,
            "pre-vote request"
        );

        PreVoteResponse {
            term: self.current_term,
            vote_granted: granted,
        }
    }

    pub(crate) fn handle_pre_vote_response(
        &mut self,
        from: NodeId,
        response: &PreVoteResponse,
    ) -> Result<()> {
        if response.term > self.current_term {
            return self.step_down(response.term);
        }
        if self.role != Role::PreCandidate {
            return Ok(());
        }

        if response.vote_granted && self.prevotes_granted.insert(from) {
            if self.prevotes_granted.len() >= self.quorum() {
                debug!(
                    node_id = self.id(),
                    term = self.current_term,
                    "pre-vote majority reached"
                );
                return self.start_election();
            }
        }
        Ok(())
    }

    /// Take leadership of the cluster for the current term.
    pub(crate) fn become_leader(&mut self) -> Result<()> {
        info!(
            node_id = self.id(),
            term = self.current_term,
            "became leader"
        );
        self.role = Role::Leader;
        self.current_leader = Some(self.id());
        self.heartbeat_timer_ms = 0;

        let next = self.log.last_index() + 1;
        self.next_index.clear();
        self.match_index.clear();
        for peer in self.replication_targets() {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, 0);
        }

        if self.cluster.size() == 1 {
            self.commit_index = self.log.last_index();
            return self.apply_committed();
        }

        // Older-term entries cannot be committed directly; an entry at the
        // new term above them can. Append one when there is anything left
        // to drag forward.
        if self.log.last_index() > self.commit_index {
            self.append_and_persist(crate::types::EntryKind::Noop, Vec::new())?;
        }

        // assert leadership right away rather than waiting a heartbeat
        self.replicate_all();
        Ok(())
    }
}
