pub mod access;
pub mod btree;
pub mod database;
pub mod record;

pub use access::{AccessLog, AccessObserver, AccessSummary};
pub use btree::{BPlusNode, BPlusTree, BPlusTreeError, BPlusTreeResult, DEFAULT_ORDER, IndexKey};
pub use database::{Database, DatabaseConfig, DatabaseError, DatabaseResult};
pub use record::{
    BLOCK_SIZE, Block, MEMORY_SIZE, RECORD_SIZE, Record, RecordAddress, RecordError, RecordResult,
    Storage, StorageConfig,
};
