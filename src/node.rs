// Core Raft node
//
// RaftNode owns every piece of per-node state: role, terms, the log, the
// storage handles, peer progress, pending reads, transfer state and the
// cluster configuration. Nothing lives in module-level storage, so any
// number of nodes can coexist in one process.
//
// The node is single-threaded and exclusively owned by its driver: every
// mutating entry point takes &mut self, completes synchronously, and sends
// outbound RPCs fire-and-forget through the configured transport.
//
// Subsystem logic (elections, replication, commit advancement, membership,
// reads, transfer, recovery, snapshots, batching, timers) lives in sibling
// modules as further impl blocks on this type.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::log::RaftLog;
use crate::membership::ClusterConfig;
use crate::read::ReadRequest;
use crate::snapshot::CachedSnapshot;
use crate::storage::Storage;
use crate::transfer::TransferState;
use crate::types::{EntryKind, LogIndex, NodeId, Role, StateMachine, Term, Transport};
use crate::wire::Message;

/// A single Raft consensus node
pub struct RaftNode {
    pub(crate) config: RaftConfig,

    // Role and persistent state
    pub(crate) role: Role,
    pub(crate) current_term: Term,
    pub(crate) voted_for: Option<NodeId>,

    // Volatile state
    pub(crate) commit_index: LogIndex,
    pub(crate) last_applied: LogIndex,
    pub(crate) current_leader: Option<NodeId>,
    pub(crate) running: bool,

    // Replicated log and durability
    pub(crate) log: RaftLog,
    pub(crate) storage: Option<Storage>,
    pub(crate) snapshot: Option<CachedSnapshot>,

    // Cluster membership (changes one node at a time)
    pub(crate) cluster: ClusterConfig,

    // Leader-only progress tracking; keyed by peer, never contains self
    pub(crate) next_index: HashMap<NodeId, LogIndex>,
    pub(crate) match_index: HashMap<NodeId, LogIndex>,

    // Election state
    pub(crate) votes_granted: HashSet<NodeId>,
    pub(crate) prevotes_granted: HashSet<NodeId>,

    // Timers, all in milliseconds, driven solely by tick()
    pub(crate) election_timeout_ms: u64,
    pub(crate) election_timer_ms: u64,
    pub(crate) heartbeat_timer_ms: u64,
    pub(crate) leader_contact_ms: u64,

    // Outstanding linearizable reads and leadership transfer
    pub(crate) pending_reads: Vec<ReadRequest>,
    pub(crate) transfer: Option<TransferState>,

    // Embedding callbacks
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) state_machine: Box<dyn StateMachine>,
}

impl RaftNode {
    /// Create a node. When `config.data_dir` is set, previously persisted
    /// state is recovered; corruption in any persisted file aborts startup.
    /// The node always begins as a follower.
    pub fn new(
        config: RaftConfig,
        transport: Box<dyn Transport>,
        state_machine: Box<dyn StateMachine>,
    ) -> Result<Self> {
        config.validate()?;

        let storage = match &config.data_dir {
            Some(dir) => Some(Storage::open(dir, config.sync_writes)?),
            None => None,
        };

        let cluster = ClusterConfig::with_nodes(config.num_nodes);
        let mut node = Self {
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            commit_index: 0,
            last_applied: 0,
            current_leader: None,
            running: false,
            log: RaftLog::new(),
            storage,
            snapshot: None,
            cluster,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes_granted: HashSet::new(),
            prevotes_granted: HashSet::new(),
            election_timeout_ms: 0,
            election_timer_ms: 0,
            heartbeat_timer_ms: 0,
            // no leader has ever been heard from
            leader_contact_ms: u64::MAX,
            pending_reads: Vec::new(),
            transfer: None,
            transport,
            state_machine,
            config,
        };

        if node.storage.is_some() {
            node.recover()?;
        }
        node.reset_election_timer();
        Ok(node)
    }

    /// Start participating in the protocol. A single-node cluster promotes
    /// itself to leader immediately.
    pub fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        self.running = true;
        info!(node_id = self.id(), term = self.current_term, "node started");

        // a single-node cluster needs nobody's permission
        if self.cluster.size() == 1 {
            return self.start_election();
        }
        Ok(())
    }

    /// Stop processing. Subsequent mutating calls return `Stopped`.
    pub fn stop(&mut self) {
        self.running = false;
        info!(node_id = self.id(), "node stopped");
    }

    /// Propose a command for replication. Leader only; returns the log
    /// index the command will commit at.
    pub fn propose(&mut self, command: &[u8]) -> Result<LogIndex> {
        if !self.running {
            return Err(RaftError::Stopped);
        }
        if self.role != Role::Leader {
            return Err(RaftError::NotLeader);
        }
        if command.len() > self.config.max_command_size {
            return Err(RaftError::InvalidArgument(format!(
                "command of {} bytes exceeds limit of {}",
                command.len(),
                self.config.max_command_size
            )));
        }

        let index = self.append_and_persist(EntryKind::Command, command.to_vec())?;
        debug!(node_id = self.id(), index, "proposed command");
        self.after_leader_append()?;
        Ok(index)
    }

    /// Route an inbound frame from `from` to its handler. Responses to
    /// requests are sent back through the transport; persistence failures
    /// withhold the response entirely.
    pub fn deliver(&mut self, from: NodeId, frame: &[u8]) -> Result<()> {
        if !self.running {
            return Err(RaftError::Stopped);
        }
        let message = Message::decode(frame)?;
        debug!(
            node_id = self.id(),
            from,
            kind = message.kind_name(),
            "received message"
        );
        match message {
            Message::RequestVote(req) => {
                let resp = self.handle_request_vote(&req)?;
                self.send_to(from, &Message::RequestVoteResponse(resp));
                Ok(())
            }
            Message::RequestVoteResponse(resp) => {
                self.handle_request_vote_response(from, &resp)
            }
            Message::AppendEntries(req) => {
                let resp = self.handle_append_entries(req)?;
                self.send_to(from, &Message::AppendEntriesResponse(resp));
                Ok(())
            }
            Message::AppendEntriesResponse(resp) => {
                self.handle_append_entries_response(from, &resp)
            }
            Message::InstallSnapshot(req) => {
                let resp = self.handle_install_snapshot(req)?;
                self.send_to(from, &Message::InstallSnapshotResponse(resp));
                Ok(())
            }
            Message::InstallSnapshotResponse(resp) => {
                self.handle_install_snapshot_response(from, &resp)
            }
            Message::PreVote(req) => {
                let resp = self.handle_pre_vote(&req);
                self.send_to(from, &Message::PreVoteResponse(resp));
                Ok(())
            }
            Message::PreVoteResponse(resp) => self.handle_pre_vote_response(from, &resp),
            Message::TimeoutNow(msg) => self.handle_timeout_now(from, &msg),
        }
    }

    // --- inspection ---

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    /// The leader this node believes in, itself included.
    pub fn leader_id(&self) -> Option<NodeId> {
        if self.role == Role::Leader {
            Some(self.id())
        } else {
            self.current_leader
        }
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    pub fn node_id(&self) -> NodeId {
        self.id()
    }

    // --- internals shared across subsystem modules ---

    pub(crate) fn id(&self) -> NodeId {
        self.config.node_id
    }

    /// Peers this leader replicates to: every member except itself, plus a
    /// pending addition.
    pub(crate) fn replication_targets(&self) -> Vec<NodeId> {
        self.cluster.peers_of(self.id())
    }

    /// Votes needed for a majority of the current configuration.
    pub(crate) fn quorum(&self) -> usize {
        self.cluster.size() / 2 + 1
    }

    /// Durably record current_term/voted_for when persistence is on.
    pub(crate) fn persist_state(&mut self) -> Result<()> {
        if let Some(storage) = &self.storage {
            storage.save_state(self.current_term, self.voted_for)?;
        }
        Ok(())
    }

    /// Append one entry to the in-memory log and the durable log. A
    /// persistence failure rolls the in-memory append back.
    pub(crate) fn append_and_persist(
        &mut self,
        kind: EntryKind,
        data: Vec<u8>,
    ) -> Result<LogIndex> {
        let index = self.log.append(self.current_term, kind, data);
        if let Some(storage) = self.storage.as_mut() {
            // the entry we just appended is the tail
            let entry = self
                .log
                .get(index)
                .expect("appended entry must be present");
            if let Err(e) = storage.append_entry(entry) {
                self.log.truncate_after(index - 1);
                return Err(e);
            }
        }
        Ok(index)
    }

    /// Leader bookkeeping after a local append: single-node clusters commit
    /// immediately, everyone else starts replicating.
    pub(crate) fn after_leader_append(&mut self) -> Result<()> {
        if self.cluster.size() == 1 {
            self.commit_index = self.log.last_index();
            self.apply_committed()?;
        } else {
            self.replicate_all();
        }
        Ok(())
    }

    /// Feed newly committed entries to the state machine, in index order,
    /// exactly once each. Committed CONFIG entries take effect here.
    pub(crate) fn apply_committed(&mut self) -> Result<()> {
        let mut stepped_down = false;
        while self.last_applied < self.commit_index {
            let next = self.last_applied + 1;
            let Some(entry) = self.log.get(next) else {
                // truncate_before never removes unapplied entries, so this
                // would mean the log invariants were violated upstream
                warn!(node_id = self.config.node_id, index = next, "missing committed entry");
                break;
            };
            let config_payload =
                (entry.kind == EntryKind::Config).then(|| entry.data.clone());
            self.state_machine.apply(entry);
            self.last_applied = next;
            if let Some(payload) = config_payload {
                stepped_down |= self.apply_config_change(&payload)?;
            }
        }

        if stepped_down {
            self.become_follower_same_term();
        }
        self.complete_ready_reads();
        self.maybe_compact()?;
        Ok(())
    }

    /// Drop leadership without changing terms, as after a committed
    /// self-removal.
    pub(crate) fn become_follower_same_term(&mut self) {
        info!(
            node_id = self.id(),
            term = self.current_term,
            "relinquishing leadership"
        );
        self.role = Role::Follower;
        self.current_leader = None;
        self.next_index.clear();
        self.match_index.clear();
        self.heartbeat_timer_ms = 0;
        self.abort_transfer();
        self.fail_pending_reads();
        self.reset_election_timer();
    }

    /// Encode and send one message to a peer.
    pub(crate) fn send_to(&mut self, peer: NodeId, message: &Message) {
        debug!(
            node_id = self.config.node_id,
            peer,
            kind = message.kind_name(),
            "sending message"
        );
        let frame = message.encode();
        self.transport.send(peer, &frame);
    }
}
