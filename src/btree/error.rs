use thiserror::Error;

use super::node::NodeId;

/// Errors that can occur during B+ tree operations
#[derive(Debug, Clone, Error)]
pub enum BPlusTreeError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Invalid tree state: {0}")]
    InvalidState(String),

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Invalid order: {0} (must be >= 3)")]
    InvalidOrder(usize),
}

pub type BPlusTreeResult<T> = Result<T, BPlusTreeError>;
