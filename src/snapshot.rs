// Snapshots and log compaction
//
// A snapshot file captures the application state at an anchor
// (last_index, last_term); everything at or below the anchor is
// recoverable from the snapshot alone, which lets the log shed its
// prefix. Layout:
//
//   | magic(4) | version(4) | crc32(4) | pad(4) | last_index(8) | last_term(8) | state_len(4) | state |
//
// with the CRC covering last_index + last_term + state_len. The file is
// written whole and swapped in atomically; chunked transfer is
// deliberately unsupported.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{RaftError, Result};
use crate::storage::write_file_atomic;
use crate::types::{LogIndex, NodeId, Role, Term};
use crate::wire::{InstallSnapshot, InstallSnapshotResponse, Message};
use crate::RaftNode;

pub const SNAPSHOT_MAGIC: u32 = 0x5253_4E50; // "RSNP"
pub const SNAPSHOT_VERSION: u32 = 1;

pub const SNAPSHOT_FILE_NAME: &str = "raft_snapshot.dat";
const SNAPSHOT_HEADER_LEN: usize = 36;

/// Anchor of a snapshot: the last log entry it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_index: LogIndex,
    pub last_term: Term,
}

/// The most recent snapshot, kept on the node so a leader can stream it
/// to a lagging peer without re-reading disk.
#[derive(Debug, Clone)]
pub(crate) struct CachedSnapshot {
    pub(crate) meta: SnapshotMeta,
    pub(crate) data: Vec<u8>,
}

pub(crate) fn snapshot_path(dir: &Path) -> PathBuf {
    dir.join(SNAPSHOT_FILE_NAME)
}

pub(crate) fn snapshot_exists(dir: &Path) -> bool {
    snapshot_path(dir)
        .metadata()
        .map(|m| m.len() >= SNAPSHOT_HEADER_LEN as u64)
        .unwrap_or(false)
}

/// Atomically write a snapshot file.
pub(crate) fn save_snapshot(
    dir: &Path,
    meta: SnapshotMeta,
    state: &[u8],
    sync: bool,
) -> Result<()> {
    let mut covered = Vec::with_capacity(20);
    covered.put_u64_le(meta.last_index);
    covered.put_u64_le(meta.last_term);
    covered.put_u32_le(state.len() as u32);

    let mut buf = Vec::with_capacity(SNAPSHOT_HEADER_LEN + state.len());
    buf.put_u32_le(SNAPSHOT_MAGIC);
    buf.put_u32_le(SNAPSHOT_VERSION);
    buf.put_u32_le(crc32fast::hash(&covered));
    buf.put_u32_le(0); // padding
    buf.put_slice(&covered);
    buf.put_slice(state);

    write_file_atomic(&snapshot_path(dir), &buf, sync)
}

/// Load a snapshot's anchor and state bytes.
pub(crate) fn load_snapshot(dir: &Path) -> Result<(SnapshotMeta, Vec<u8>)> {
    let data = match fs::read(snapshot_path(dir)) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(RaftError::NotFound("no snapshot file".into()));
        }
        Err(e) => return Err(e.into()),
    };
    if data.len() < SNAPSHOT_HEADER_LEN {
        return Err(RaftError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "short snapshot file",
        )));
    }

    let mut buf = &data[..];
    if buf.get_u32_le() != SNAPSHOT_MAGIC {
        return Err(RaftError::Corruption("snapshot magic mismatch".into()));
    }
    if buf.get_u32_le() != SNAPSHOT_VERSION {
        return Err(RaftError::Corruption(
            "unsupported snapshot version".into(),
        ));
    }
    let crc = buf.get_u32_le();
    buf.get_u32_le(); // padding
    if crc32fast::hash(&data[16..36]) != crc {
        return Err(RaftError::Corruption("snapshot CRC mismatch".into()));
    }

    let meta = SnapshotMeta {
        last_index: buf.get_u64_le(),
        last_term: buf.get_u64_le(),
    };
    let state_len = buf.get_u32_le() as usize;
    if buf.remaining() < state_len {
        return Err(RaftError::Corruption("snapshot state truncated".into()));
    }
    let state = buf.copy_to_bytes(state_len).to_vec();
    Ok((meta, state))
}

/// Load only the anchor of a snapshot file.
pub(crate) fn load_snapshot_meta(dir: &Path) -> Result<SnapshotMeta> {
    load_snapshot(dir).map(|(meta, _)| meta)
}

impl RaftNode {
    /// Install a snapshot over the node's current state: persist it, drop
    /// the covered log prefix (the whole log if the local tail conflicts),
    /// raise commit/applied to the anchor, and hand the bytes to the
    /// application.
    pub fn install_snapshot(&mut self, meta: SnapshotMeta, state: Vec<u8>) -> Result<()> {
        if meta.last_index <= self.log.base_index() {
            debug!(
                node_id = self.id(),
                snapshot_index = meta.last_index,
                base_index = self.log.base_index(),
                "ignoring stale snapshot"
            );
            return Ok(());
        }

        if let Some(storage) = &self.storage {
            save_snapshot(storage.dir(), meta, &state, self.config.sync_writes)?;
        }

        // a local entry matching the anchor proves the suffix above it is
        // consistent with the snapshot; keep it. Anything else goes.
        if self.log.last_index() >= meta.last_index
            && self.log.term_at(meta.last_index) == meta.last_term
        {
            self.log.truncate_before(meta.last_index + 1);
        } else {
            self.log.reset_to(meta.last_index, meta.last_term);
        }
        if let Some(storage) = self.storage.as_mut() {
            storage.rewrite_log(
                self.log.base_index(),
                self.log.base_term(),
                self.log.entries(),
            )?;
        }

        self.commit_index = self.commit_index.max(meta.last_index);
        self.last_applied = self.last_applied.max(meta.last_index);
        self.state_machine.restore(&state);
        self.snapshot = Some(CachedSnapshot { meta, data: state });

        info!(
            node_id = self.id(),
            last_index = meta.last_index,
            last_term = meta.last_term,
            "installed snapshot"
        );
        Ok(())
    }

    /// Compact the log when enough entries have built up past the anchor
    /// and the application can produce a snapshot. Advisory; a no-op for
    /// applications that do not snapshot.
    pub fn maybe_compact(&mut self) -> Result<bool> {
        if (self.log.count() as u64) <= self.config.log_compaction_threshold {
            return Ok(false);
        }
        let upto = self.last_applied;
        if upto <= self.log.base_index() {
            return Ok(false);
        }
        let Some(state) = self.state_machine.snapshot() else {
            return Ok(false);
        };

        let meta = SnapshotMeta {
            last_index: upto,
            last_term: self.log.term_at(upto),
        };
        if let Some(storage) = &self.storage {
            save_snapshot(storage.dir(), meta, &state, self.config.sync_writes)?;
        }

        self.log.truncate_before(upto + 1);
        if let Some(storage) = self.storage.as_mut() {
            storage.rewrite_log(
                self.log.base_index(),
                self.log.base_term(),
                self.log.entries(),
            )?;
        }
        self.snapshot = Some(CachedSnapshot { meta, data: state });

        info!(
            node_id = self.id(),
            last_index = meta.last_index,
            last_term = meta.last_term,
            remaining = self.log.count(),
            "compacted log"
        );
        Ok(true)
    }

    /// Entries retained past the snapshot anchor.
    pub fn entries_since_snapshot(&self) -> u64 {
        self.log.count() as u64
    }

    /// Ship the cached snapshot to a peer whose next_index fell below the
    /// log base.
    pub(crate) fn send_snapshot(&mut self, peer: NodeId) -> Result<()> {
        let Some(snapshot) = &self.snapshot else {
            warn!(
                node_id = self.id(),
                peer,
                "peer lags behind log base but no snapshot is available"
            );
            return Ok(());
        };
        let meta = snapshot.meta;
        let message = Message::InstallSnapshot(InstallSnapshot {
            term: self.current_term,
            leader_id: self.id(),
            last_index: meta.last_index,
            last_term: meta.last_term,
            data: snapshot.data.clone(),
        });
        debug!(
            node_id = self.id(),
            peer,
            last_index = meta.last_index,
            "sending snapshot to lagging peer"
        );
        self.send_to(peer, &message);
        Ok(())
    }

    /// Follower path for a snapshot pushed by the leader.
    pub(crate) fn handle_install_snapshot(
        &mut self,
        request: InstallSnapshot,
    ) -> Result<InstallSnapshotResponse> {
        if request.term > self.current_term {
            self.step_down(request.term)?;
        }
        if request.term < self.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
                success: false,
            });
        }

        self.reset_election_timer();
        self.leader_contact_ms = 0;
        self.current_leader = Some(request.leader_id);
        if self.role != Role::Follower {
            self.role = Role::Follower;
            self.votes_granted.clear();
            self.prevotes_granted.clear();
        }

        let meta = SnapshotMeta {
            last_index: request.last_index,
            last_term: request.last_term,
        };
        self.install_snapshot(meta, request.data)?;

        Ok(InstallSnapshotResponse {
            term: self.current_term,
            success: true,
        })
    }

    /// Leader bookkeeping once a peer confirms a snapshot.
    pub(crate) fn handle_install_snapshot_response(
        &mut self,
        from: NodeId,
        response: &InstallSnapshotResponse,
    ) -> Result<()> {
        if response.term > self.current_term {
            return self.step_down(response.term);
        }
        if self.role != Role::Leader || response.term < self.current_term {
            return Ok(());
        }
        if !response.success {
            return Ok(());
        }

        let Some(snapshot) = &self.snapshot else {
            return Ok(());
        };
        let snapshot_index = snapshot.meta.last_index;
        let known = self.match_index.get(&from).copied().unwrap_or(0);
        if snapshot_index > known {
            self.match_index.insert(from, snapshot_index);
            self.next_index.insert(from, snapshot_index + 1);
            self.advance_commit_index()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{make_node, make_node_with, make_node_with_snapshots};
    use crate::types::EntryKind;
    use tempfile::TempDir;

    #[test]
    fn snapshot_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let meta = SnapshotMeta {
            last_index: 42,
            last_term: 3,
        };
        save_snapshot(dir.path(), meta, b"app-state", true).unwrap();
        assert!(snapshot_exists(dir.path()));

        let (loaded, state) = load_snapshot(dir.path()).unwrap();
        assert_eq!(loaded, meta);
        assert_eq!(state, b"app-state".to_vec());
        assert_eq!(load_snapshot_meta(dir.path()).unwrap(), meta);
    }

    #[test]
    fn missing_snapshot_is_not_found() {
        let dir = TempDir::new().unwrap();
        assert!(!snapshot_exists(dir.path()));
        assert!(matches!(
            load_snapshot(dir.path()),
            Err(RaftError::NotFound(_))
        ));
    }

    #[test]
    fn corrupted_snapshot_metadata_is_detected() {
        let dir = TempDir::new().unwrap();
        save_snapshot(
            dir.path(),
            SnapshotMeta {
                last_index: 5,
                last_term: 1,
            },
            b"s",
            true,
        )
        .unwrap();

        let path = snapshot_path(dir.path());
        let mut data = fs::read(&path).unwrap();
        data[16] ^= 0xFF; // inside last_index
        fs::write(&path, &data).unwrap();

        assert!(matches!(
            load_snapshot(dir.path()),
            Err(RaftError::Corruption(_))
        ));
    }

    #[test]
    fn install_keeps_matching_suffix() {
        let (mut node, _outbox) = make_node(0, 1);
        node.start().unwrap();
        for i in 1..=5u8 {
            node.propose(&[i]).unwrap();
        }

        node.install_snapshot(
            SnapshotMeta {
                last_index: 3,
                last_term: 1,
            },
            b"s".to_vec(),
        )
        .unwrap();

        assert_eq!(node.log().base_index(), 3);
        assert!(node.log().get(3).is_none());
        assert_eq!(node.log().get(4).unwrap().data, vec![4]);
        assert_eq!(node.log().get(5).unwrap().data, vec![5]);
        assert!(node.commit_index() >= 3);
        assert!(node.last_applied() >= 3);
    }

    #[test]
    fn install_resets_conflicting_log() {
        let (mut node, _outbox) = make_node(1, 3);
        node.start().unwrap();
        // local entries at term 1
        node.log.append(1, EntryKind::Command, b"a".to_vec());
        node.log.append(1, EntryKind::Command, b"b".to_vec());

        // snapshot anchored at a different term for index 2
        node.install_snapshot(
            SnapshotMeta {
                last_index: 2,
                last_term: 4,
            },
            b"s".to_vec(),
        )
        .unwrap();

        assert_eq!(node.log().count(), 0);
        assert_eq!(node.log().base_index(), 2);
        assert_eq!(node.log().base_term(), 4);
        assert_eq!(node.commit_index(), 2);
    }

    #[test]
    fn stale_snapshot_is_ignored() {
        let (mut node, _outbox) = make_node(1, 3);
        node.start().unwrap();
        node.install_snapshot(
            SnapshotMeta {
                last_index: 5,
                last_term: 1,
            },
            b"new".to_vec(),
        )
        .unwrap();

        node.install_snapshot(
            SnapshotMeta {
                last_index: 3,
                last_term: 1,
            },
            b"old".to_vec(),
        )
        .unwrap();
        assert_eq!(node.log().base_index(), 5);
    }

    #[test]
    fn compaction_triggers_past_threshold() {
        let (mut node, _outbox, restored) = make_node_with_snapshots(0, 1, 5);
        node.start().unwrap();
        for i in 0..6u8 {
            node.propose(&[i]).unwrap();
        }

        // six applied entries against a threshold of five
        assert!(node.log().count() <= 5);
        assert!(node.log().base_index() > 0);
        assert_eq!(node.commit_index(), 6);
        assert_eq!(node.last_applied(), 6);
        // compaction captures state, it does not restore it
        assert!(restored.borrow().is_empty());
    }

    #[test]
    fn compaction_skipped_without_app_support() {
        let (mut node, _outbox) = make_node_with(0, 1, |cfg| {
            cfg.log_compaction_threshold = 50;
        });
        node.start().unwrap();
        for i in 0..200u8 {
            node.propose(&[i]).unwrap();
        }
        // default test state machine opts out of snapshots
        assert_eq!(node.log().base_index(), 0);
        assert_eq!(node.entries_since_snapshot(), 200);
    }
}
