// Shared primitives for the Raft core
//
// Type aliases, the role and entry-kind enums, the log entry itself, and
// the two traits an embedding must provide (transport and state machine).

use serde::{Deserialize, Serialize};

/// Node identifier within the cluster
pub type NodeId = u32;

/// Raft term - logical clock for leader elections
pub type Term = u64;

/// Position of an entry in the replicated log (1-based)
pub type LogIndex = u64;

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Passively replicates entries from the leader
    Follower,
    /// Soliciting hypothetical votes before starting a real election
    PreCandidate,
    /// Requesting votes for leadership
    Candidate,
    /// Manages log replication and commit advancement
    Leader,
}

/// Kind of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Opaque application command
    Command,
    /// Cluster membership change
    Config,
    /// No-op appended by a fresh leader to commit older-term entries
    Noop,
}

impl EntryKind {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            EntryKind::Command => 0,
            EntryKind::Config => 1,
            EntryKind::Noop => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(EntryKind::Command),
            1 => Some(EntryKind::Config),
            2 => Some(EntryKind::Noop),
            _ => None,
        }
    }
}

/// Entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term when the entry was received by the leader
    pub term: Term,
    /// Index of this entry in the log
    pub index: LogIndex,
    /// Entry kind, fixed at append time
    pub kind: EntryKind,
    /// Opaque payload bytes, owned by the log
    pub data: Vec<u8>,
}

/// Outbound message sink provided by the embedding.
///
/// `send` is fire-and-forget: the transport may drop or reorder frames and
/// the core tolerates both. It is invoked synchronously from within the
/// node's entry points and must not call back into the node.
pub trait Transport {
    fn send(&mut self, peer: NodeId, frame: &[u8]);
}

/// Application state machine fed by the core.
///
/// `apply` is invoked exactly once per committed index, in index order.
/// `snapshot` and `restore` are only exercised when the application opts
/// into log compaction; the defaults disable it.
pub trait StateMachine {
    /// Apply a committed entry. Must not call back into the node.
    fn apply(&mut self, entry: &LogEntry);

    /// Serialize the application state at the current `last_applied`.
    /// Returning `None` disables automatic compaction.
    fn snapshot(&mut self) -> Option<Vec<u8>> {
        None
    }

    /// Replace the application state with a previously captured snapshot.
    fn restore(&mut self, snapshot: &[u8]) {
        let _ = snapshot;
    }
}
