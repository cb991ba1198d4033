// Batched operations
//
// propose_batch appends a group of commands atomically: either every
// command lands in the log (memory and disk) or none do. apply_batch
// bounds how much state-machine work one call performs, for drivers that
// interleave applying with other duties.

use tracing::debug;

use crate::error::{RaftError, Result};
use crate::types::{EntryKind, LogIndex, Role};
use crate::RaftNode;

impl RaftNode {
    /// Append several commands as one atomic unit. Returns the index of
    /// the first entry; on any failure the log is exactly as it was.
    pub fn propose_batch(&mut self, commands: &[&[u8]]) -> Result<LogIndex> {
        if !self.running {
            return Err(RaftError::Stopped);
        }
        if self.role != Role::Leader {
            return Err(RaftError::NotLeader);
        }
        if commands.is_empty() {
            return Err(RaftError::InvalidArgument("empty batch".into()));
        }

        let first_index = self.log.last_index() + 1;
        for (i, command) in commands.iter().enumerate() {
            if command.len() > self.config.max_command_size {
                self.rollback_batch(first_index)?;
                return Err(RaftError::InvalidArgument(format!(
                    "batch command {} of {} bytes exceeds limit of {}",
                    i,
                    command.len(),
                    self.config.max_command_size
                )));
            }
            if let Err(e) = self.append_and_persist(EntryKind::Command, command.to_vec()) {
                // append_and_persist rolled back its own entry; drop the
                // rest of the batch from memory and disk too
                self.rollback_batch(first_index)?;
                return Err(e);
            }
        }

        debug!(
            node_id = self.id(),
            first_index,
            count = commands.len(),
            "proposed batch"
        );
        self.after_leader_append()?;
        Ok(first_index)
    }

    fn rollback_batch(&mut self, first_index: LogIndex) -> Result<()> {
        self.log.truncate_after(first_index - 1);
        if let Some(storage) = self.storage.as_mut() {
            storage.truncate_log(first_index - 1)?;
        }
        Ok(())
    }

    /// Apply up to `max_entries` committed-but-unapplied entries (0 means
    /// no limit). Returns how many were applied.
    pub fn apply_batch(&mut self, max_entries: usize) -> Result<usize> {
        let available = (self.commit_index - self.last_applied) as usize;
        let target = if max_entries == 0 {
            available
        } else {
            available.min(max_entries)
        };

        let stop_at = self.last_applied + target as u64;
        let mut applied = 0;
        while self.last_applied < stop_at {
            let next = self.last_applied + 1;
            let Some(entry) = self.log.get(next) else {
                break;
            };
            let config_payload =
                (entry.kind == EntryKind::Config).then(|| entry.data.clone());
            self.state_machine.apply(entry);
            self.last_applied = next;
            applied += 1;
            if let Some(payload) = config_payload {
                if self.apply_config_change(&payload)? {
                    self.become_follower_same_term();
                }
            }
        }
        if applied > 0 {
            self.complete_ready_reads();
            self.maybe_compact()?;
        }
        Ok(applied)
    }

    /// Entries committed but not yet handed to the state machine.
    pub fn pending_apply_count(&self) -> usize {
        (self.commit_index - self.last_applied) as usize
    }
}

#[cfg(test)]
mod tests {
    use crate::error::RaftError;
    use crate::testutil::{make_node, make_node_with};

    #[test]
    fn batch_commits_on_single_node() {
        let (mut node, _outbox) = make_node(0, 1);
        node.start().unwrap();

        let first = node
            .propose_batch(&[b"a".as_slice(), b"b".as_slice(), b"c".as_slice()])
            .unwrap();
        assert_eq!(first, 1);
        assert_eq!(node.log().last_index(), 3);
        assert_eq!(node.commit_index(), 3);
        assert_eq!(node.pending_apply_count(), 0);
    }

    #[test]
    fn empty_batch_is_invalid() {
        let (mut node, _outbox) = make_node(0, 1);
        node.start().unwrap();
        assert!(matches!(
            node.propose_batch(&[]),
            Err(RaftError::InvalidArgument(_))
        ));
    }

    #[test]
    fn batch_on_follower_is_refused() {
        let (mut node, _outbox) = make_node(1, 3);
        node.start().unwrap();
        assert!(matches!(
            node.propose_batch(&[b"x".as_slice()]),
            Err(RaftError::NotLeader)
        ));
    }

    #[test]
    fn failed_batch_leaves_log_untouched() {
        let (mut node, _outbox) = make_node_with(0, 1, |cfg| {
            cfg.max_command_size = 8;
        });
        node.start().unwrap();
        node.propose(b"seed").unwrap();
        let before = node.log().last_index();

        let oversized = vec![0u8; 64];
        let result = node.propose_batch(&[
            b"ok-1".as_slice(),
            b"ok-2".as_slice(),
            oversized.as_slice(),
            b"ok-4".as_slice(),
            b"ok-5".as_slice(),
        ]);
        assert!(matches!(result, Err(RaftError::InvalidArgument(_))));
        assert_eq!(node.log().last_index(), before);
        assert_eq!(node.commit_index(), before);
    }

    #[test]
    fn apply_batch_respects_limit() {
        let (mut node, _outbox) = make_node(1, 3);
        node.start().unwrap();

        // replicate five committed entries from a leader
        node.handle_append_entries(crate::wire::AppendEntries {
            term: 1,
            leader_id: 0,
            prev_log_index: 0,
            prev_log_term: 0,
            leader_commit: 0,
            entries: (0..5)
                .map(|i| crate::wire::EntryFrame {
                    term: 1,
                    kind: crate::types::EntryKind::Command,
                    data: vec![i],
                })
                .collect(),
        })
        .unwrap();
        // learn the commit without auto-applying everything at once
        node.commit_index = 5;

        assert_eq!(node.pending_apply_count(), 5);
        assert_eq!(node.apply_batch(2).unwrap(), 2);
        assert_eq!(node.last_applied(), 2);
        assert_eq!(node.pending_apply_count(), 3);
        assert_eq!(node.apply_batch(0).unwrap(), 3);
        assert_eq!(node.pending_apply_count(), 0);
    }
}
