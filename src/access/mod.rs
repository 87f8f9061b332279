//! Access instrumentation
//!
//! Index traversals report every node they visit and the store reports every
//! record address it resolves to bytes. Observers are fire-and-forget: the
//! engine never reads anything back from them.

use ahash::AHashSet;
use serde::Serialize;

use crate::btree::{BPlusNode, NodeId};
use crate::record::{BlockId, RecordAddress};

/// Number of accesses kept verbatim for display
pub const SAMPLE_LIMIT: usize = 5;

/// Hook invoked by traversals and record reads
pub trait AccessObserver {
    /// Called once per node visited during a traversal
    fn visit_node(&mut self, id: NodeId, node: &BPlusNode);

    /// Called once per record address resolved to bytes
    fn read_block(&mut self, address: RecordAddress);
}

/// The no-op observer
impl AccessObserver for () {
    fn visit_node(&mut self, _id: NodeId, _node: &BPlusNode) {}

    fn read_block(&mut self, _address: RecordAddress) {}
}

/// Snapshot of a visited node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSample {
    pub id: NodeId,
    pub leaf: bool,
    /// Primary components of the node's keys
    pub keys: Vec<i32>,
}

/// Counts node visits and data block reads
#[derive(Debug, Default, Clone)]
pub struct AccessLog {
    node_visits: usize,
    block_reads: usize,
    nodes: Vec<NodeSample>,
    blocks: Vec<BlockId>,
    distinct: AHashSet<BlockId>,
}

impl AccessLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything recorded so far
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Total number of node visits
    pub fn node_visits(&self) -> usize {
        self.node_visits
    }

    /// Total number of block reads (one per resolved record)
    pub fn block_reads(&self) -> usize {
        self.block_reads
    }

    /// Number of different blocks read
    pub fn distinct_blocks(&self) -> usize {
        self.distinct.len()
    }

    /// The first visited nodes
    pub fn sampled_nodes(&self) -> &[NodeSample] {
        &self.nodes
    }

    /// The first blocks read
    pub fn sampled_blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    pub fn summary(&self) -> AccessSummary {
        AccessSummary {
            node_visits: self.node_visits,
            block_reads: self.block_reads,
            distinct_blocks: self.distinct.len(),
            nodes: self.nodes.clone(),
            blocks: self.blocks.clone(),
        }
    }
}

impl AccessObserver for AccessLog {
    fn visit_node(&mut self, id: NodeId, node: &BPlusNode) {
        self.node_visits += 1;
        if self.nodes.len() < SAMPLE_LIMIT {
            self.nodes.push(NodeSample {
                id,
                leaf: node.is_leaf(),
                keys: node.keys().map(|k| k.primary).collect(),
            });
        }
    }

    fn read_block(&mut self, address: RecordAddress) {
        self.block_reads += 1;
        self.distinct.insert(address.block_id);
        if self.blocks.len() < SAMPLE_LIMIT {
            self.blocks.push(address.block_id);
        }
    }
}

/// Serializable result of an [`AccessLog`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessSummary {
    pub node_visits: usize,
    pub block_reads: usize,
    pub distinct_blocks: usize,
    pub nodes: Vec<NodeSample>,
    pub blocks: Vec<BlockId>,
}
