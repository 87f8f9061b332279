use std::collections::BTreeSet;
use std::ops::Range;

use crate::access::AccessObserver;
use crate::btree::{BPlusTree, IndexKey};

use super::block::Block;
use super::error::{RecordError, RecordResult};
use super::record::{BlockId, Record, RecordAddress};
use super::StorageConfig;

/// In-memory "disk": a flat byte arena divided into fixed-size blocks
///
/// The arena grows one block at a time up to `config.capacity` bytes and never
/// shrinks. Free slots are handed out lowest address first, so slots released
/// by [`Storage::delete_record`] are reused before later blocks are touched.
#[derive(Debug)]
pub struct Storage {
    config: StorageConfig,
    arena: Vec<u8>,
    block_count: usize,
    free_slots: BTreeSet<RecordAddress>,
}

impl Storage {
    /// Create an empty store
    pub fn new(config: StorageConfig) -> RecordResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            arena: Vec::new(),
            block_count: 0,
            free_slots: BTreeSet::new(),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Number of allocated blocks
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Number of slots in each block
    pub fn slots_per_block(&self) -> usize {
        self.config.slots_per_block()
    }

    /// Number of free slots across all allocated blocks
    pub fn free_slot_count(&self) -> usize {
        self.free_slots.len()
    }

    /// Number of occupied slots
    pub fn record_count(&self) -> usize {
        self.block_count * self.slots_per_block() - self.free_slots.len()
    }

    /// Bytes of the arena currently in use by allocated blocks
    pub fn used_bytes(&self) -> usize {
        self.block_count * self.config.block_size
    }

    fn block_range(&self, block_id: BlockId) -> RecordResult<Range<usize>> {
        if block_id >= self.block_count {
            return Err(RecordError::BlockNotFound(block_id));
        }
        let start = block_id * self.config.block_size;
        Ok(start..start + self.config.block_size)
    }

    /// Get a read-only view of a block
    pub fn read_block(&self, block_id: BlockId) -> RecordResult<Block<&[u8]>> {
        let range = self.block_range(block_id)?;
        Block::from_buffer(&self.arena[range])
    }

    fn block_mut(&mut self, block_id: BlockId) -> RecordResult<Block<&mut [u8]>> {
        let range = self.block_range(block_id)?;
        Block::from_buffer(&mut self.arena[range])
    }

    /// Overwrite a whole block and resynchronize its free slots
    pub fn update_block(&mut self, block_id: BlockId, data: &[u8]) -> RecordResult<()> {
        let range = self.block_range(block_id)?;
        if data.len() != range.len() {
            return Err(RecordError::Deserialization(format!(
                "Block size mismatch: expected {}, got {}",
                range.len(),
                data.len()
            )));
        }
        self.arena[range].copy_from_slice(data);

        let used: Vec<bool> = {
            let block = self.read_block(block_id)?;
            (0..block.slot_count())
                .map(|slot| block.is_slot_used(slot))
                .collect()
        };
        for (slot_id, is_used) in used.into_iter().enumerate() {
            let address = RecordAddress::new(block_id, slot_id);
            if is_used {
                self.free_slots.remove(&address);
            } else {
                self.free_slots.insert(address);
            }
        }
        Ok(())
    }

    /// Append a new block to the arena and register all of its slots as free
    pub fn create_block(&mut self) -> RecordResult<BlockId> {
        if self.block_count >= self.config.max_blocks() {
            return Err(RecordError::ArenaExhausted {
                capacity: self.config.capacity,
            });
        }

        let block_size = self.config.block_size;
        let block_id = self.block_count;
        let end = (block_id + 1) * block_size;
        self.arena.resize(end, 0);
        self.block_count += 1;

        let slot_count = Block::new(&mut self.arena[end - block_size..end])?.slot_count();
        self.free_slots
            .extend((0..slot_count).map(|slot| RecordAddress::new(block_id, slot)));

        tracing::debug!(block_id, slot_count, "allocated block");
        Ok(block_id)
    }

    /// Store a new record, allocating a block if no free slot exists
    pub fn create_record(&mut self, id: &str, rating: f32, votes: i32) -> RecordResult<RecordAddress> {
        let record = Record::new(id, rating, votes);
        // Reject before touching the arena
        record.encode()?;

        if self.free_slots.is_empty() {
            self.create_block()?;
        }
        let address = self
            .free_slots
            .pop_first()
            .ok_or(RecordError::ArenaExhausted {
                capacity: self.config.capacity,
            })?;

        let mut block = self.block_mut(address.block_id)?;
        if !block.update_record(address.slot_id, &record)? {
            return Err(RecordError::InvalidSlot(address));
        }
        Ok(address)
    }

    /// Read a record given its address
    pub fn read_record(&self, address: RecordAddress) -> RecordResult<Record> {
        self.read_record_with(address, &mut ())
    }

    /// Read a record, reporting the block access to an observer
    pub fn read_record_with<O: AccessObserver + ?Sized>(
        &self,
        address: RecordAddress,
        observer: &mut O,
    ) -> RecordResult<Record> {
        observer.read_block(address);
        self.read_block(address.block_id)?
            .read_record(address.slot_id)
            .ok_or(RecordError::InvalidSlot(address))?
    }

    /// Delete a record and release its slot for reuse
    pub fn delete_record(&mut self, address: RecordAddress) -> RecordResult<()> {
        let mut block = self.block_mut(address.block_id)?;
        let was_used = block.is_slot_used(address.slot_id);
        if !block.delete_record(address.slot_id) {
            return Err(RecordError::InvalidSlot(address));
        }
        if was_used {
            self.free_slots.insert(address);
        }
        Ok(())
    }

    /// Iterate over every valid record in block order, then slot order
    pub fn scan(&self) -> impl Iterator<Item = RecordResult<(RecordAddress, Record)>> + '_ {
        (0..self.block_count).flat_map(move |block_id| {
            let slots: Vec<RecordResult<(RecordAddress, Record)>> = match self.read_block(block_id) {
                Ok(block) => block
                    .records()
                    .filter_map(|(slot_id, record)| match record {
                        Ok(r) if r.valid => Some(Ok((RecordAddress::new(block_id, slot_id), r))),
                        Ok(_) => None,
                        Err(e) => Some(Err(e)),
                    })
                    .collect(),
                Err(e) => vec![Err(e)],
            };
            slots
        })
    }

    /// Build a B+ tree over every valid record, keyed by (votes, id)
    pub fn build_index(&self, order: usize) -> RecordResult<BPlusTree> {
        let mut tree = BPlusTree::new(order)?;
        for item in self.scan() {
            let (address, record) = item?;
            tree.insert_entry(IndexKey::from_record(&record)?, address)?;
        }
        tracing::debug!(
            order,
            entries = tree.len(),
            height = tree.height(),
            "built index"
        );
        Ok(tree)
    }
}
