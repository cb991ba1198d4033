// Cluster membership changes
//
// One change at a time, one node at a time. The leader appends a CONFIG
// entry carrying the encoded change and immediately counts a pending
// addition toward quorum, so availability does not regress across the
// change. Every node - leader included - updates its member set only when
// the committed entry is applied; a committed self-removal makes the
// leader step down once the apply loop finishes.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RaftError, Result};
use crate::types::{EntryKind, LogIndex, NodeId, Role};
use crate::RaftNode;

/// Direction of a membership change
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum ConfigOp {
    AddNode,
    RemoveNode,
}

/// Payload of a CONFIG log entry
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct ConfigChange {
    pub op: ConfigOp,
    pub node_id: NodeId,
}

/// A node's view of the cluster: the effective member set plus at most one
/// uncommitted change.
#[derive(Debug, Clone)]
pub(crate) struct ClusterConfig {
    pub(crate) members: Vec<NodeId>,
    pub(crate) pending: Option<ConfigChange>,
}

impl ClusterConfig {
    pub(crate) fn with_nodes(num_nodes: u32) -> Self {
        Self {
            members: (0..num_nodes).collect(),
            pending: None,
        }
    }

    /// Effective size for quorum purposes; a pending addition counts.
    pub(crate) fn size(&self) -> usize {
        let pending_add = matches!(
            self.pending,
            Some(ConfigChange {
                op: ConfigOp::AddNode,
                ..
            })
        );
        self.members.len() + usize::from(pending_add)
    }

    pub(crate) fn is_member(&self, id: NodeId) -> bool {
        self.members.contains(&id)
    }

    /// Everyone `id` talks to: members besides itself, plus a pending
    /// addition that must be caught up before its entry commits.
    pub(crate) fn peers_of(&self, id: NodeId) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self
            .members
            .iter()
            .copied()
            .filter(|&m| m != id)
            .collect();
        if let Some(ConfigChange {
            op: ConfigOp::AddNode,
            node_id,
        }) = self.pending
        {
            if node_id != id && !peers.contains(&node_id) {
                peers.push(node_id);
            }
        }
        peers
    }
}

impl RaftNode {
    /// Propose adding `new_node` to the cluster. Leader only; rejected
    /// while another change is in flight.
    pub fn add_node(&mut self, new_node: NodeId) -> Result<LogIndex> {
        self.propose_config_change(ConfigChange {
            op: ConfigOp::AddNode,
            node_id: new_node,
        })
    }

    /// Propose removing `node` from the cluster. Leader only.
    pub fn remove_node(&mut self, node: NodeId) -> Result<LogIndex> {
        self.propose_config_change(ConfigChange {
            op: ConfigOp::RemoveNode,
            node_id: node,
        })
    }

    fn propose_config_change(&mut self, change: ConfigChange) -> Result<LogIndex> {
        if !self.running {
            return Err(RaftError::Stopped);
        }
        if self.role != Role::Leader {
            return Err(RaftError::NotLeader);
        }
        if self.cluster.pending.is_some() {
            return Err(RaftError::InvalidArgument(
                "a membership change is already in progress".into(),
            ));
        }
        match change.op {
            ConfigOp::AddNode => {
                if self.cluster.is_member(change.node_id) {
                    return Err(RaftError::InvalidArgument(format!(
                        "node {} is already a member",
                        change.node_id
                    )));
                }
            }
            ConfigOp::RemoveNode => {
                if !self.cluster.is_member(change.node_id) {
                    return Err(RaftError::InvalidArgument(format!(
                        "node {} is not a member",
                        change.node_id
                    )));
                }
            }
        }

        let payload = bincode::encode_to_vec(change, bincode::config::standard())
            .map_err(|e| RaftError::InvalidArgument(format!("encoding config change: {e}")))?;
        let index = self.append_and_persist(EntryKind::Config, payload)?;
        self.cluster.pending = Some(change);

        info!(
            node_id = self.id(),
            term = self.current_term,
            target = change.node_id,
            op = ?change.op,
            index,
            "proposed membership change"
        );

        // a pending addition starts receiving entries right away
        if change.op == ConfigOp::AddNode {
            self.next_index
                .insert(change.node_id, self.log.last_index() + 1);
            self.match_index.insert(change.node_id, 0);
        }

        self.after_leader_append()?;
        Ok(index)
    }

    /// Take a committed CONFIG entry into effect. Returns true when the
    /// caller (a leader that removed itself) must step down afterwards.
    pub(crate) fn apply_config_change(&mut self, payload: &[u8]) -> Result<bool> {
        let (change, _): (ConfigChange, usize) =
            bincode::decode_from_slice(payload, bincode::config::standard())
                .map_err(|e| RaftError::Corruption(format!("config entry payload: {e}")))?;

        match change.op {
            ConfigOp::AddNode => {
                if !self.cluster.is_member(change.node_id) {
                    self.cluster.members.push(change.node_id);
                }
                if self.role == Role::Leader && change.node_id != self.id() {
                    self.next_index
                        .entry(change.node_id)
                        .or_insert(self.log.last_index() + 1);
                    self.match_index.entry(change.node_id).or_insert(0);
                }
            }
            ConfigOp::RemoveNode => {
                self.cluster.members.retain(|&m| m != change.node_id);
                self.next_index.remove(&change.node_id);
                self.match_index.remove(&change.node_id);
                if self.transfer_target() == Some(change.node_id) {
                    self.abort_transfer();
                }
            }
        }
        self.cluster.pending = None;

        info!(
            node_id = self.id(),
            target = change.node_id,
            op = ?change.op,
            members = self.cluster.members.len(),
            "membership change committed"
        );

        Ok(change.op == ConfigOp::RemoveNode
            && change.node_id == self.id()
            && self.role == Role::Leader)
    }

    /// Number of nodes counted toward quorum (pending addition included).
    pub fn cluster_size(&self) -> usize {
        self.cluster.size()
    }

    /// Whether `node` currently has a vote (a pending addition does).
    pub fn is_voting_member(&self, node: NodeId) -> bool {
        if self.cluster.is_member(node) {
            return true;
        }
        matches!(
            self.cluster.pending,
            Some(ConfigChange {
                op: ConfigOp::AddNode,
                node_id,
            }) if node_id == node
        )
    }

    /// Whether a membership change is waiting for its entry to commit.
    pub fn config_change_in_progress(&self) -> bool {
        self.cluster.pending.is_some()
    }
}
