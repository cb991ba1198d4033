// Shared helpers for unit tests: a capturing transport and a recording
// state machine, both backed by Rc handles the test keeps.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use crate::config::RaftConfig;
use crate::node::RaftNode;
use crate::types::{LogEntry, NodeId, StateMachine, Transport};

pub(crate) type Outbox = Rc<RefCell<Vec<(NodeId, Vec<u8>)>>>;
pub(crate) type Applied = Rc<RefCell<Vec<LogEntry>>>;
pub(crate) type Restored = Rc<RefCell<Vec<Vec<u8>>>>;

pub(crate) struct TestTransport {
    outbox: Outbox,
}

impl Transport for TestTransport {
    fn send(&mut self, peer: NodeId, frame: &[u8]) {
        self.outbox.borrow_mut().push((peer, frame.to_vec()));
    }
}

pub(crate) struct TestStateMachine {
    applied: Applied,
    restored: Restored,
    /// `true` makes `snapshot()` return the concatenated applied payloads
    snapshots_enabled: bool,
}

impl StateMachine for TestStateMachine {
    fn apply(&mut self, entry: &LogEntry) {
        self.applied.borrow_mut().push(entry.clone());
    }

    fn snapshot(&mut self) -> Option<Vec<u8>> {
        if !self.snapshots_enabled {
            return None;
        }
        let state: Vec<u8> = self
            .applied
            .borrow()
            .iter()
            .flat_map(|e| e.data.clone())
            .collect();
        Some(state)
    }

    fn restore(&mut self, snapshot: &[u8]) {
        self.restored.borrow_mut().push(snapshot.to_vec());
    }
}

pub(crate) struct NodeHandles {
    pub(crate) outbox: Outbox,
    pub(crate) applied: Applied,
    pub(crate) restored: Restored,
}

pub(crate) fn build_node(config: RaftConfig, snapshots_enabled: bool) -> (RaftNode, NodeHandles) {
    let outbox: Outbox = Rc::new(RefCell::new(Vec::new()));
    let applied: Applied = Rc::new(RefCell::new(Vec::new()));
    let restored: Restored = Rc::new(RefCell::new(Vec::new()));

    let node = RaftNode::new(
        config,
        Box::new(TestTransport {
            outbox: Rc::clone(&outbox),
        }),
        Box::new(TestStateMachine {
            applied: Rc::clone(&applied),
            restored: Rc::clone(&restored),
            snapshots_enabled,
        }),
    )
    .expect("node construction");

    (
        node,
        NodeHandles {
            outbox,
            applied,
            restored,
        },
    )
}

pub(crate) fn make_node(node_id: NodeId, num_nodes: u32) -> (RaftNode, Outbox) {
    make_node_with(node_id, num_nodes, |_| {})
}

pub(crate) fn make_node_with(
    node_id: NodeId,
    num_nodes: u32,
    tweak: impl FnOnce(&mut RaftConfig),
) -> (RaftNode, Outbox) {
    let mut config = RaftConfig {
        node_id,
        num_nodes,
        ..Default::default()
    };
    tweak(&mut config);
    let (node, handles) = build_node(config, false);
    (node, handles.outbox)
}

pub(crate) fn make_node_applied(node_id: NodeId, num_nodes: u32) -> (RaftNode, Outbox, Applied) {
    let config = RaftConfig {
        node_id,
        num_nodes,
        ..Default::default()
    };
    let (node, handles) = build_node(config, false);
    (node, handles.outbox, handles.applied)
}

pub(crate) fn make_node_with_snapshots(
    node_id: NodeId,
    num_nodes: u32,
    compaction_threshold: u64,
) -> (RaftNode, Outbox, Restored) {
    let config = RaftConfig {
        node_id,
        num_nodes,
        log_compaction_threshold: compaction_threshold,
        ..Default::default()
    };
    let (node, handles) = build_node(config, true);
    (node, handles.outbox, handles.restored)
}

pub(crate) fn make_persistent_node(
    node_id: NodeId,
    num_nodes: u32,
    dir: &Path,
) -> (RaftNode, Outbox) {
    let config = RaftConfig {
        node_id,
        num_nodes,
        data_dir: Some(dir.to_path_buf()),
        sync_writes: true,
        ..Default::default()
    };
    let (node, handles) = build_node(config, false);
    (node, handles.outbox)
}

/// Snapshot of everything sent so far.
pub(crate) fn collected(outbox: &Outbox) -> Vec<(NodeId, Vec<u8>)> {
    outbox.borrow().clone()
}

/// Take and clear everything sent so far.
pub(crate) fn drain(outbox: &Outbox) -> Vec<(NodeId, Vec<u8>)> {
    outbox.borrow_mut().drain(..).collect()
}
