// Log replication
//
// The leader drives one code path for heartbeats and entry transfer: every
// heartbeat interval each peer gets an AppendEntries built from its
// next_index, carrying up to max_entries_per_append entries (or none when
// the peer is caught up). A peer whose next_index has fallen below the
// log's snapshot anchor is sent the snapshot instead.
//
// The follower side implements the consistency check and conflict
// truncation, persists accepted entries before acknowledging them, and
// takes the leader's commit index from every valid message, entries or
// not.

use tracing::{debug, warn};

use crate::error::Result;
use crate::types::{NodeId, Role};
use crate::wire::{AppendEntries, AppendEntriesResponse, EntryFrame, Message};
use crate::RaftNode;

impl RaftNode {
    /// Send AppendEntries (or a snapshot) to every peer. Leader only.
    pub(crate) fn replicate_all(&mut self) {
        for peer in self.replication_targets() {
            if let Err(e) = self.replicate_to_peer(peer) {
                warn!(
                    node_id = self.id(),
                    peer,
                    error = %e,
                    "replication to peer failed"
                );
            }
        }
    }

    pub(crate) fn replicate_to_peer(&mut self, peer: NodeId) -> Result<()> {
        if self.role != Role::Leader {
            return Ok(());
        }

        let next_index = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(self.log.last_index() + 1);

        // the entries this peer needs are gone; ship the snapshot
        if next_index <= self.log.base_index() && self.snapshot.is_some() {
            return self.send_snapshot(peer);
        }

        let prev_log_index = next_index - 1;
        let prev_log_term = self.log.term_at(prev_log_index);
        let last_index = self.log.last_index();

        let mut entries = Vec::new();
        if last_index >= next_index {
            let take = ((last_index - next_index + 1) as usize)
                .min(self.config.max_entries_per_append);
            for i in 0..take as u64 {
                if let Some(entry) = self.log.get(next_index + i) {
                    entries.push(EntryFrame {
                        term: entry.term,
                        kind: entry.kind,
                        data: entry.data.clone(),
                    });
                }
            }
        }

        let message = Message::AppendEntries(AppendEntries {
            term: self.current_term,
            leader_id: self.id(),
            prev_log_index,
            prev_log_term,
            leader_commit: self.commit_index,
            entries,
        });
        self.send_to(peer, &message);
        Ok(())
    }

    /// Follower path for AppendEntries; also the step-down path for
    /// candidates that discover a leader at their own term.
    pub(crate) fn handle_append_entries(
        &mut self,
        request: AppendEntries,
    ) -> Result<AppendEntriesResponse> {
        if request.term > self.current_term {
            self.step_down(request.term)?;
        }
        if request.term < self.current_term {
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                match_index: 0,
            });
        }

        // a live leader exists at this term
        self.reset_election_timer();
        self.leader_contact_ms = 0;
        self.current_leader = Some(request.leader_id);
        if self.role == Role::Candidate || self.role == Role::PreCandidate {
            debug!(
                node_id = self.id(),
                term = self.current_term,
                leader = request.leader_id,
                "yielding candidacy to leader"
            );
            self.role = Role::Follower;
            self.votes_granted.clear();
            self.prevotes_granted.clear();
        }

        // consistency check: our log must contain the leader's previous
        // entry at the same term
        if request.prev_log_index > 0 {
            let term_at_prev = self.log.term_at(request.prev_log_index);
            if term_at_prev != request.prev_log_term {
                debug!(
                    node_id = self.id(),
                    prev_log_index = request.prev_log_index,
                    expected = request.prev_log_term,
                    found = term_at_prev,
                    "consistency check failed"
                );
                return Ok(AppendEntriesResponse {
                    term: self.current_term,
                    success: false,
                    // back-off hint: everything past our tail is missing
                    match_index: self.log.last_index(),
                });
            }
        }

        let last_new_entry = request.prev_log_index + request.entries.len() as u64;
        for (i, frame) in request.entries.into_iter().enumerate() {
            let entry_index = request.prev_log_index + 1 + i as u64;

            let existing_term = self.log.term_at(entry_index);
            if existing_term != 0 && existing_term != frame.term {
                // conflicting suffix: drop it here and on disk
                self.log.truncate_after(entry_index - 1);
                if let Some(storage) = self.storage.as_mut() {
                    storage.truncate_log(entry_index - 1)?;
                }
            }

            if entry_index > self.log.last_index() {
                // a persistence failure here withholds the acknowledgment
                self.append_with_term(frame, entry_index)?;
            }
        }

        // the commit update runs for heartbeats too
        if request.leader_commit > self.commit_index {
            self.commit_index = request
                .leader_commit
                .min(last_new_entry)
                .min(self.log.last_index());
            self.apply_committed()?;
        }

        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            match_index: self.log.last_index(),
        })
    }

    /// Append one replicated entry at the follower, with the entry's own
    /// term rather than ours.
    fn append_with_term(&mut self, frame: EntryFrame, expected_index: u64) -> Result<()> {
        let index = self.log.append(frame.term, frame.kind, frame.data);
        debug_assert_eq!(index, expected_index);
        if let Some(storage) = self.storage.as_mut() {
            let entry = self
                .log
                .get(index)
                .expect("appended entry must be present");
            if let Err(e) = storage.append_entry(entry) {
                self.log.truncate_after(index - 1);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Leader bookkeeping for a follower's AppendEntries answer.
    pub(crate) fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        response: &AppendEntriesResponse,
    ) -> Result<()> {
        if response.term > self.current_term {
            return self.step_down(response.term);
        }
        if self.role != Role::Leader || response.term < self.current_term {
            return Ok(());
        }

        if response.success {
            let known = self.match_index.get(&from).copied().unwrap_or(0);
            if response.match_index > known {
                self.match_index.insert(from, response.match_index);
                self.next_index.insert(from, response.match_index + 1);
                self.advance_commit_index()?;
            }
            // a successful same-term response is also a leadership
            // confirmation for pending reads, and possibly the moment a
            // transfer target catches up
            self.process_read_acks(from);
            self.transfer_check_progress();
        } else {
            let next = self.next_index.get(&from).copied().unwrap_or(1);
            let backed_off = next.saturating_sub(1).max(1);
            // the follower's hint can fast-forward the walk, but never
            // raise next_index
            let hinted = response.match_index.saturating_add(1);
            let new_next = backed_off.min(hinted).max(1);
            debug!(
                node_id = self.id(),
                peer = from,
                next = new_next,
                "follower rejected append, backing off"
            );
            self.next_index.insert(from, new_next);
        }
        Ok(())
    }
}
