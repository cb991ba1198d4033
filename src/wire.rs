// Wire protocol for inter-node RPCs
//
// Every message starts with a u32 type tag; the tag values are fixed for
// on-wire stability. All integers are little-endian. Entries inside an
// AppendEntries frame are a contiguous stream of
// {term:u64, kind:u8, cmd_len:u32, payload[cmd_len]} records; their
// indices are implied by prev_log_index.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::types::{EntryKind, LogIndex, NodeId, Term};

pub const MSG_REQUEST_VOTE: u32 = 1;
pub const MSG_REQUEST_VOTE_RESPONSE: u32 = 2;
pub const MSG_APPEND_ENTRIES: u32 = 3;
pub const MSG_APPEND_ENTRIES_RESPONSE: u32 = 4;
pub const MSG_INSTALL_SNAPSHOT: u32 = 5;
pub const MSG_INSTALL_SNAPSHOT_RESPONSE: u32 = 6;
pub const MSG_PRE_VOTE: u32 = 7;
pub const MSG_PRE_VOTE_RESPONSE: u32 = 8;
pub const MSG_TIMEOUT_NOW: u32 = 9;

/// Fixed bytes of one entry record in an AppendEntries frame
/// (term + kind + cmd_len).
const ENTRY_FRAME_HEADER: usize = 8 + 1 + 4;

/// Vote request (real election)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVote {
    /// Candidate's term
    pub term: Term,
    /// Candidate requesting the vote
    pub candidate_id: NodeId,
    /// Index of the candidate's last log entry
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry
    pub last_log_term: Term,
}

/// Vote response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Current term, for the candidate to update itself
    pub term: Term,
    /// True if the candidate received the vote
    pub vote_granted: bool,
}

/// One replicated entry as carried on the wire; the index is implied by
/// the enclosing frame's prev_log_index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFrame {
    pub term: Term,
    pub kind: EntryKind,
    pub data: Vec<u8>,
}

/// Log replication request; a heartbeat when `entries` is empty
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntries {
    /// Leader's term
    pub term: Term,
    /// So followers can redirect clients
    pub leader_id: NodeId,
    /// Index of the entry immediately preceding the new ones
    pub prev_log_index: LogIndex,
    /// Term of the prev_log_index entry
    pub prev_log_term: Term,
    /// Leader's commit index
    pub leader_commit: LogIndex,
    /// Entries to replicate (empty for heartbeat)
    pub entries: Vec<EntryFrame>,
}

/// Log replication response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Current term, for the leader to update itself
    pub term: Term,
    /// True if the follower matched prev_log_index/prev_log_term
    pub success: bool,
    /// Follower's last log index; a conservative back-off hint on failure
    pub match_index: LogIndex,
}

/// Whole-snapshot transfer to a peer too far behind the log base
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshot {
    pub term: Term,
    pub leader_id: NodeId,
    /// Index of the last entry the snapshot covers
    pub last_index: LogIndex,
    /// Term of that entry
    pub last_term: Term,
    /// Serialized application state
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub success: bool,
}

/// Hypothetical vote solicitation; never mutates responder state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreVote {
    /// Candidate's term plus one (not yet incremented for real)
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// Leadership handover trigger: the target starts an election immediately
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutNow {
    pub term: Term,
    pub leader_id: NodeId,
}

/// A decoded RPC message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    RequestVote(RequestVote),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntries),
    AppendEntriesResponse(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshot),
    InstallSnapshotResponse(InstallSnapshotResponse),
    PreVote(PreVote),
    PreVoteResponse(PreVoteResponse),
    TimeoutNow(TimeoutNow),
}

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        match self {
            Message::RequestVote(m) => {
                buf.put_u32_le(MSG_REQUEST_VOTE);
                buf.put_u64_le(m.term);
                buf.put_u32_le(m.candidate_id);
                buf.put_u64_le(m.last_log_index);
                buf.put_u64_le(m.last_log_term);
            }
            Message::RequestVoteResponse(m) => {
                buf.put_u32_le(MSG_REQUEST_VOTE_RESPONSE);
                buf.put_u64_le(m.term);
                buf.put_u8(u8::from(m.vote_granted));
            }
            Message::AppendEntries(m) => {
                buf.put_u32_le(MSG_APPEND_ENTRIES);
                buf.put_u64_le(m.term);
                buf.put_u32_le(m.leader_id);
                buf.put_u64_le(m.prev_log_index);
                buf.put_u64_le(m.prev_log_term);
                buf.put_u64_le(m.leader_commit);
                buf.put_u32_le(m.entries.len() as u32);
                for entry in &m.entries {
                    buf.put_u64_le(entry.term);
                    buf.put_u8(entry.kind.as_u8());
                    buf.put_u32_le(entry.data.len() as u32);
                    buf.put_slice(&entry.data);
                }
            }
            Message::AppendEntriesResponse(m) => {
                buf.put_u32_le(MSG_APPEND_ENTRIES_RESPONSE);
                buf.put_u64_le(m.term);
                buf.put_u8(u8::from(m.success));
                buf.put_u64_le(m.match_index);
            }
            Message::InstallSnapshot(m) => {
                buf.put_u32_le(MSG_INSTALL_SNAPSHOT);
                buf.put_u64_le(m.term);
                buf.put_u32_le(m.leader_id);
                buf.put_u64_le(m.last_index);
                buf.put_u64_le(m.last_term);
                buf.put_u32_le(m.data.len() as u32);
                buf.put_slice(&m.data);
            }
            Message::InstallSnapshotResponse(m) => {
                buf.put_u32_le(MSG_INSTALL_SNAPSHOT_RESPONSE);
                buf.put_u64_le(m.term);
                buf.put_u8(u8::from(m.success));
            }
            Message::PreVote(m) => {
                buf.put_u32_le(MSG_PRE_VOTE);
                buf.put_u64_le(m.term);
                buf.put_u32_le(m.candidate_id);
                buf.put_u64_le(m.last_log_index);
                buf.put_u64_le(m.last_log_term);
            }
            Message::PreVoteResponse(m) => {
                buf.put_u32_le(MSG_PRE_VOTE_RESPONSE);
                buf.put_u64_le(m.term);
                buf.put_u8(u8::from(m.vote_granted));
            }
            Message::TimeoutNow(m) => {
                buf.put_u32_le(MSG_TIMEOUT_NOW);
                buf.put_u64_le(m.term);
                buf.put_u32_le(m.leader_id);
            }
        }
        buf
    }

    pub fn decode(frame: &[u8]) -> Result<Message> {
        let mut buf = frame;
        need(&buf, 4)?;
        let tag = buf.get_u32_le();
        match tag {
            MSG_REQUEST_VOTE => {
                need(&buf, 8 + 4 + 8 + 8)?;
                Ok(Message::RequestVote(RequestVote {
                    term: buf.get_u64_le(),
                    candidate_id: buf.get_u32_le(),
                    last_log_index: buf.get_u64_le(),
                    last_log_term: buf.get_u64_le(),
                }))
            }
            MSG_REQUEST_VOTE_RESPONSE => {
                need(&buf, 8 + 1)?;
                Ok(Message::RequestVoteResponse(RequestVoteResponse {
                    term: buf.get_u64_le(),
                    vote_granted: buf.get_u8() != 0,
                }))
            }
            MSG_APPEND_ENTRIES => {
                need(&buf, 8 + 4 + 8 + 8 + 8 + 4)?;
                let term = buf.get_u64_le();
                let leader_id = buf.get_u32_le();
                let prev_log_index = buf.get_u64_le();
                let prev_log_term = buf.get_u64_le();
                let leader_commit = buf.get_u64_le();
                let count = buf.get_u32_le() as usize;
                // each entry occupies at least its fixed header
                if buf.remaining() < count.saturating_mul(ENTRY_FRAME_HEADER) {
                    return Err(truncated());
                }
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    need(&buf, ENTRY_FRAME_HEADER)?;
                    let entry_term = buf.get_u64_le();
                    let kind = EntryKind::from_u8(buf.get_u8()).ok_or_else(|| {
                        RaftError::InvalidArgument("unknown entry kind on wire".into())
                    })?;
                    let len = buf.get_u32_le() as usize;
                    need(&buf, len)?;
                    let mut data = vec![0u8; len];
                    buf.copy_to_slice(&mut data);
                    entries.push(EntryFrame {
                        term: entry_term,
                        kind,
                        data,
                    });
                }
                Ok(Message::AppendEntries(AppendEntries {
                    term,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    leader_commit,
                    entries,
                }))
            }
            MSG_APPEND_ENTRIES_RESPONSE => {
                need(&buf, 8 + 1 + 8)?;
                Ok(Message::AppendEntriesResponse(AppendEntriesResponse {
                    term: buf.get_u64_le(),
                    success: buf.get_u8() != 0,
                    match_index: buf.get_u64_le(),
                }))
            }
            MSG_INSTALL_SNAPSHOT => {
                need(&buf, 8 + 4 + 8 + 8 + 4)?;
                let term = buf.get_u64_le();
                let leader_id = buf.get_u32_le();
                let last_index = buf.get_u64_le();
                let last_term = buf.get_u64_le();
                let len = buf.get_u32_le() as usize;
                need(&buf, len)?;
                let mut data = vec![0u8; len];
                buf.copy_to_slice(&mut data);
                Ok(Message::InstallSnapshot(InstallSnapshot {
                    term,
                    leader_id,
                    last_index,
                    last_term,
                    data,
                }))
            }
            MSG_INSTALL_SNAPSHOT_RESPONSE => {
                need(&buf, 8 + 1)?;
                Ok(Message::InstallSnapshotResponse(InstallSnapshotResponse {
                    term: buf.get_u64_le(),
                    success: buf.get_u8() != 0,
                }))
            }
            MSG_PRE_VOTE => {
                need(&buf, 8 + 4 + 8 + 8)?;
                Ok(Message::PreVote(PreVote {
                    term: buf.get_u64_le(),
                    candidate_id: buf.get_u32_le(),
                    last_log_index: buf.get_u64_le(),
                    last_log_term: buf.get_u64_le(),
                }))
            }
            MSG_PRE_VOTE_RESPONSE => {
                need(&buf, 8 + 1)?;
                Ok(Message::PreVoteResponse(PreVoteResponse {
                    term: buf.get_u64_le(),
                    vote_granted: buf.get_u8() != 0,
                }))
            }
            MSG_TIMEOUT_NOW => {
                need(&buf, 8 + 4)?;
                Ok(Message::TimeoutNow(TimeoutNow {
                    term: buf.get_u64_le(),
                    leader_id: buf.get_u32_le(),
                }))
            }
            other => Err(RaftError::InvalidArgument(format!(
                "unknown message tag {other}"
            ))),
        }
    }

    /// Short name for trace output
    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::RequestVote(_) => "request_vote",
            Message::RequestVoteResponse(_) => "request_vote_response",
            Message::AppendEntries(_) => "append_entries",
            Message::AppendEntriesResponse(_) => "append_entries_response",
            Message::InstallSnapshot(_) => "install_snapshot",
            Message::InstallSnapshotResponse(_) => "install_snapshot_response",
            Message::PreVote(_) => "pre_vote",
            Message::PreVoteResponse(_) => "pre_vote_response",
            Message::TimeoutNow(_) => "timeout_now",
        }
    }
}

fn need(buf: &&[u8], n: usize) -> Result<()> {
    if buf.remaining() < n {
        Err(truncated())
    } else {
        Ok(())
    }
}

fn truncated() -> RaftError {
    RaftError::InvalidArgument("truncated message".into())
}
