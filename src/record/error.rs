use crate::btree::BPlusTreeError;
use thiserror::Error;

use super::record::RecordAddress;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Index error: {0}")]
    Index(#[from] BPlusTreeError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Record id {id:?} is longer than {max} bytes")]
    IdTooLong { id: String, max: usize },

    #[error("Record id {0:?} must be ASCII with no NUL bytes or trailing spaces")]
    InvalidId(String),

    #[error("Invalid slot: block_id={}, slot_id={}", .0.block_id, .0.slot_id)]
    InvalidSlot(RecordAddress),

    #[error("Block not found: block_id={0}")]
    BlockNotFound(usize),

    #[error("Storage arena exhausted: {capacity} bytes allocated")]
    ArenaExhausted { capacity: usize },

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

pub type RecordResult<T> = Result<T, RecordError>;
