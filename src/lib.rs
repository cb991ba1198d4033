// RustyRaft - embeddable Raft consensus core
//
// A single-threaded, synchronous implementation of the Raft consensus
// algorithm. The core owns roles, terms, votes, the replicated log,
// durable state and snapshots; the embedding supplies a transport, an
// application state machine, and a time source that feeds tick().
//
// The driver contract is small:
//   - call tick(elapsed_ms) at a granularity finer than the heartbeat
//   - route inbound frames to deliver(from, bytes)
//   - propose commands on the leader and consume apply() callbacks
//
// Everything a node mutates lives on the RaftNode instance; any number of
// nodes can share a process, which is how the test harnesses simulate
// whole clusters without threads or clocks.

pub mod config;
pub mod error;
pub mod log;
pub mod membership;
pub mod node;
pub mod read;
pub mod snapshot;
pub mod storage;
pub mod types;
pub mod wire;

mod batch;
mod commit;
mod election;
mod recovery;
mod replication;
mod timer;
mod transfer;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use log::RaftLog;
pub use membership::{ConfigChange, ConfigOp};
pub use node::RaftNode;
pub use read::ReadCallback;
pub use snapshot::SnapshotMeta;
pub use types::{EntryKind, LogEntry, LogIndex, NodeId, Role, StateMachine, Term, Transport};
pub use wire::Message;
