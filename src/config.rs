// Raft node configuration
//
// All the knobs the core recognises, with the defaults the protocol was
// tuned for. Timing values are plain milliseconds to match the
// `tick(elapsed_ms)` contract.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::types::NodeId;

/// Configuration parameters for a Raft node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// This node's ID, in `[0, num_nodes)`
    pub node_id: NodeId,
    /// Initial cluster size; membership may change at runtime
    pub num_nodes: u32,
    /// Directory for persistent state; `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,
    /// Fsync each persistent write before the dependent reply is released
    pub sync_writes: bool,
    /// Minimum election timeout (randomized per reset)
    pub election_timeout_min_ms: u64,
    /// Maximum election timeout (randomized per reset)
    pub election_timeout_max_ms: u64,
    /// Leader heartbeat cadence; must be well below the election timeout
    pub heartbeat_interval_ms: u64,
    /// Cap on entries carried by one AppendEntries message
    pub max_entries_per_append: usize,
    /// Entries retained past the snapshot anchor before compaction triggers
    pub log_compaction_threshold: u64,
    /// Proposals larger than this are rejected
    pub max_command_size: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            num_nodes: 1,
            data_dir: None,
            sync_writes: false,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            max_entries_per_append: 100,
            log_compaction_threshold: 10_000,
            max_command_size: 1024 * 1024,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_nodes == 0 {
            return Err(RaftError::InvalidArgument(
                "cluster must have at least one node".into(),
            ));
        }
        if self.node_id >= self.num_nodes {
            return Err(RaftError::InvalidArgument(format!(
                "node_id {} outside cluster of {} nodes",
                self.node_id, self.num_nodes
            )));
        }
        if self.election_timeout_min_ms == 0
            || self.election_timeout_min_ms > self.election_timeout_max_ms
        {
            return Err(RaftError::InvalidArgument(format!(
                "invalid election timeout range [{}, {}]",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.election_timeout_min_ms
        {
            return Err(RaftError::InvalidArgument(format!(
                "heartbeat interval {}ms must be below the election timeout minimum {}ms",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        if self.max_entries_per_append == 0 {
            return Err(RaftError::InvalidArgument(
                "max_entries_per_append must be positive".into(),
            ));
        }
        if self.max_command_size == 0 {
            return Err(RaftError::InvalidArgument(
                "max_command_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(RaftConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_node_id_outside_cluster() {
        let config = RaftConfig {
            node_id: 3,
            num_nodes: 3,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_timeout_range() {
        let config = RaftConfig {
            election_timeout_min_ms: 300,
            election_timeout_max_ms: 150,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_heartbeat_at_or_above_election_minimum() {
        let config = RaftConfig {
            heartbeat_interval_ms: 150,
            election_timeout_min_ms: 150,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
