use super::error::{RecordError, RecordResult};
use super::record::{Record, SLOT_EMPTY, SLOT_OCCUPIED, SlotId};
use super::RECORD_SIZE;

/// Zero-copy block wrapper that operates directly on arena memory
///
/// A block is `block_size` bytes split into `block_size / RECORD_SIZE`
/// fixed-width slots; record `i` occupies `[i * RECORD_SIZE, (i + 1) * RECORD_SIZE)`.
/// Bytes past the last whole slot are padding. `B` is `&[u8]` for reads and
/// `&mut [u8]` for updates.
pub struct Block<B> {
    buffer: B,
}

impl<B: AsRef<[u8]>> Block<B> {
    /// Calculate the number of slots for a given block size
    pub fn calculate_slot_count(block_size: usize) -> usize {
        block_size / RECORD_SIZE
    }

    /// Wrap an existing block buffer
    pub fn from_buffer(buffer: B) -> RecordResult<Self> {
        if buffer.as_ref().len() < RECORD_SIZE {
            return Err(RecordError::Deserialization(format!(
                "Block of {} bytes cannot hold a {} byte record",
                buffer.as_ref().len(),
                RECORD_SIZE
            )));
        }
        Ok(Self { buffer })
    }

    /// Get the number of slots in this block
    pub fn slot_count(&self) -> usize {
        Self::calculate_slot_count(self.buffer.as_ref().len())
    }

    fn slot_range(&self, slot_id: SlotId) -> Option<std::ops::Range<usize>> {
        (slot_id < self.slot_count())
            .then(|| slot_id * RECORD_SIZE..(slot_id + 1) * RECORD_SIZE)
    }

    /// Raw bytes of one slot
    pub fn slot_bytes(&self, slot_id: SlotId) -> Option<&[u8]> {
        let range = self.slot_range(slot_id)?;
        Some(&self.buffer.as_ref()[range])
    }

    /// Check if a slot holds a record
    pub fn is_slot_used(&self, slot_id: SlotId) -> bool {
        self.slot_bytes(slot_id)
            .is_some_and(|bytes| bytes[0] == SLOT_OCCUPIED)
    }

    /// Decode the record in a slot (empty slots decode to [`Record::empty`])
    pub fn read_record(&self, slot_id: SlotId) -> Option<RecordResult<Record>> {
        self.slot_bytes(slot_id).map(Record::decode)
    }

    /// Iterate over every slot in ascending order
    pub fn records(&self) -> impl Iterator<Item = (SlotId, RecordResult<Record>)> + '_ {
        (0..self.slot_count()).filter_map(move |slot| Some((slot, self.read_record(slot)?)))
    }

    /// Number of occupied slots
    pub fn used_slot_count(&self) -> usize {
        (0..self.slot_count())
            .filter(|&slot| self.is_slot_used(slot))
            .count()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Block<B> {
    /// Format a fresh block in the provided buffer: every slot is marked empty
    pub fn new(mut buffer: B) -> RecordResult<Self> {
        buffer.as_mut().fill(0);
        let mut block = Self::from_buffer(buffer)?;
        let empty = Record::empty().encode()?;
        for slot in 0..block.slot_count() {
            block.write_slot(slot, &empty);
        }
        Ok(block)
    }

    fn write_slot(&mut self, slot_id: SlotId, data: &[u8; RECORD_SIZE]) {
        if let Some(range) = self.slot_range(slot_id) {
            self.buffer.as_mut()[range].copy_from_slice(data);
        }
    }

    /// Encode a record into a slot
    ///
    /// Returns `false` if the slot does not exist in this block.
    pub fn update_record(&mut self, slot_id: SlotId, record: &Record) -> RecordResult<bool> {
        if slot_id >= self.slot_count() {
            return Ok(false);
        }
        let data = record.encode()?;
        self.write_slot(slot_id, &data);
        Ok(true)
    }

    /// Mark a slot as empty, leaving the rest of its bytes untouched
    pub fn delete_record(&mut self, slot_id: SlotId) -> bool {
        match self.slot_range(slot_id) {
            Some(range) => {
                self.buffer.as_mut()[range.start] = SLOT_EMPTY;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_slot_count() {
        assert_eq!(Block::<&[u8]>::calculate_slot_count(100), 5);
        assert_eq!(Block::<&[u8]>::calculate_slot_count(19), 1);
        assert_eq!(Block::<&[u8]>::calculate_slot_count(500), 26);
    }

    #[test]
    fn test_block_creation() {
        let mut buffer = vec![0u8; 100];
        let block = Block::new(&mut buffer[..]).unwrap();
        assert_eq!(block.slot_count(), 5);
        assert_eq!(block.used_slot_count(), 0);
        for slot in 0..5 {
            assert!(!block.is_slot_used(slot));
        }
        // Padding after the fifth slot stays zero
        assert!(buffer[95..].iter().all(|&b| b == 0));
        assert_eq!(buffer[0], SLOT_EMPTY);
    }

    #[test]
    fn test_block_too_small() {
        let mut buffer = vec![0u8; 10];
        assert!(Block::new(&mut buffer[..]).is_err());
    }

    #[test]
    fn test_record_operations() {
        let mut buffer = vec![0u8; 100];
        let mut block = Block::new(&mut buffer[..]).unwrap();

        let record = Record::new("tt0000002", 6.1, 198);
        assert!(block.update_record(2, &record).unwrap());
        assert!(block.is_slot_used(2));
        assert_eq!(block.read_record(2).unwrap().unwrap(), record);

        assert!(block.delete_record(2));
        assert!(!block.is_slot_used(2));
        assert_eq!(block.read_record(2).unwrap().unwrap(), Record::empty());

        // Out of range slots
        assert!(!block.update_record(5, &record).unwrap());
        assert!(!block.delete_record(5));
        assert!(block.read_record(5).is_none());
    }

    #[test]
    fn test_restore_from_buffer() {
        let mut buffer = vec![0u8; 100];
        {
            let mut block = Block::new(&mut buffer[..]).unwrap();
            block
                .update_record(0, &Record::new("tt0000001", 5.6, 1645))
                .unwrap();
            block
                .update_record(4, &Record::new("tt0000005", 6.2, 2581))
                .unwrap();
        }

        let restored = Block::from_buffer(&buffer[..]).unwrap();
        let used: Vec<_> = restored
            .records()
            .filter_map(|(slot, r)| r.unwrap().valid.then_some(slot))
            .collect();
        assert_eq!(used, vec![0, 4]);
        assert_eq!(restored.used_slot_count(), 2);
    }
}
