mod block;
mod error;
mod record;
mod storage;

pub use block::Block;
pub use error::{RecordError, RecordResult};
pub use record::{BlockId, Record, RecordAddress, SLOT_EMPTY, SLOT_OCCUPIED, SlotId};
pub use storage::Storage;

use serde::Serialize;

/// Block size in bytes
pub const BLOCK_SIZE: usize = 100;

/// Width of the fixed-length record id field
pub const ID_LEN: usize = 10;

/// Encoded record size: validity flag + id + rating (f32) + votes (i32)
pub const RECORD_SIZE: usize = 1 + ID_LEN + 4 + 4;

/// Default arena ceiling (200 MiB)
pub const MEMORY_SIZE: usize = 200 << 20;

/// Storage layout configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StorageConfig {
    /// Size of one block in bytes
    pub block_size: usize,
    /// Maximum number of arena bytes
    pub capacity: usize,
}

impl StorageConfig {
    pub fn new(block_size: usize, capacity: usize) -> Self {
        Self {
            block_size,
            capacity,
        }
    }

    /// Number of record slots per block; trailing bytes are padding
    pub fn slots_per_block(&self) -> usize {
        self.block_size / RECORD_SIZE
    }

    /// Maximum number of blocks the arena can hold
    pub fn max_blocks(&self) -> usize {
        self.capacity.checked_div(self.block_size).unwrap_or(0)
    }

    /// Check that the layout can hold at least one record
    pub fn validate(&self) -> RecordResult<()> {
        if self.block_size < RECORD_SIZE {
            return Err(RecordError::InvalidConfig(format!(
                "block size {} is smaller than the record size {}",
                self.block_size, RECORD_SIZE
            )));
        }
        if self.capacity < self.block_size {
            return Err(RecordError::InvalidConfig(format!(
                "capacity {} cannot hold a single {} byte block",
                self.capacity, self.block_size
            )));
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::new(BLOCK_SIZE, MEMORY_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StorageConfig::default();
        assert_eq!(RECORD_SIZE, 19);
        assert_eq!(config.slots_per_block(), 5);
        assert_eq!(config.max_blocks(), (200 << 20) / 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        assert!(StorageConfig::new(18, 1000).validate().is_err());
        assert!(StorageConfig::new(100, 99).validate().is_err());
        assert!(StorageConfig::new(19, 19).validate().is_ok());
    }
}
