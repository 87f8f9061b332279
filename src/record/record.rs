use std::fmt;

use serde::Serialize;

use super::error::{RecordError, RecordResult};
use super::{ID_LEN, RECORD_SIZE};

/// Block identifier (index of the block inside the storage arena)
pub type BlockId = usize;

/// Slot identifier within a block
pub type SlotId = usize;

/// Validity byte of an occupied slot.
///
/// The polarity is inverted (`0` = occupied, `1` = empty) to stay
/// byte-compatible with blocks written by earlier versions of the format.
pub const SLOT_OCCUPIED: u8 = 0;

/// Validity byte of an empty slot
pub const SLOT_EMPTY: u8 = 1;

const ID_OFFSET: usize = 1;
const RATING_OFFSET: usize = ID_OFFSET + ID_LEN;
const VOTES_OFFSET: usize = RATING_OFFSET + 4;

/// Logical identifier for a record (block + slot)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RecordAddress {
    pub block_id: BlockId,
    pub slot_id: SlotId,
}

impl RecordAddress {
    pub fn new(block_id: BlockId, slot_id: SlotId) -> Self {
        Self { block_id, slot_id }
    }
}

impl fmt::Display for RecordAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.block_id, self.slot_id)
    }
}

/// A single fixed-width record
///
/// Layout (19 bytes):
/// ```text
/// [valid: u8][id: 10 x ASCII, zero padded][rating: f32 BE][votes: i32 BE]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub valid: bool,
    pub id: String,
    pub rating: f32,
    pub votes: i32,
}

impl Record {
    /// Create an occupied record
    pub fn new(id: impl Into<String>, rating: f32, votes: i32) -> Self {
        Self {
            valid: true,
            id: id.into(),
            rating,
            votes,
        }
    }

    /// The record stored in a free slot
    pub fn empty() -> Self {
        Self {
            valid: false,
            id: String::new(),
            rating: 0.0,
            votes: 0,
        }
    }

    /// Check that an id fits the fixed-width id field
    pub fn validate_id(id: &str) -> RecordResult<()> {
        if !id.is_ascii() || id.bytes().any(|b| b == 0) || id.ends_with(' ') {
            return Err(RecordError::InvalidId(id.to_string()));
        }
        if id.len() > ID_LEN {
            return Err(RecordError::IdTooLong {
                id: id.to_string(),
                max: ID_LEN,
            });
        }
        Ok(())
    }

    /// The id as a zero-padded fixed-width byte array
    pub fn id_bytes(&self) -> RecordResult<[u8; ID_LEN]> {
        Self::validate_id(&self.id)?;
        let mut bytes = [0u8; ID_LEN];
        bytes[..self.id.len()].copy_from_slice(self.id.as_bytes());
        Ok(bytes)
    }

    /// Encode the record into its fixed-width slot representation
    pub fn encode(&self) -> RecordResult<[u8; RECORD_SIZE]> {
        let mut result = [0u8; RECORD_SIZE];

        if !self.valid {
            result[0] = SLOT_EMPTY;
            return Ok(result);
        }

        result[0] = SLOT_OCCUPIED;
        result[ID_OFFSET..RATING_OFFSET].copy_from_slice(&self.id_bytes()?);
        result[RATING_OFFSET..VOTES_OFFSET].copy_from_slice(&self.rating.to_be_bytes());
        result[VOTES_OFFSET..RECORD_SIZE].copy_from_slice(&self.votes.to_be_bytes());

        Ok(result)
    }

    /// Decode a record from a slot
    pub fn decode(data: &[u8]) -> RecordResult<Self> {
        if data.len() != RECORD_SIZE {
            return Err(RecordError::Deserialization(format!(
                "Expected {} bytes, got {}",
                RECORD_SIZE,
                data.len()
            )));
        }

        match data[0] {
            SLOT_EMPTY => return Ok(Self::empty()),
            SLOT_OCCUPIED => {}
            flag => {
                return Err(RecordError::Deserialization(format!(
                    "Invalid validity flag: {flag}"
                )));
            }
        }

        // Padding may be NULs or spaces
        let id = std::str::from_utf8(&data[ID_OFFSET..RATING_OFFSET])
            .ok()
            .filter(|s| s.is_ascii())
            .ok_or_else(|| RecordError::Deserialization("Record id is not ASCII".to_string()))?
            .trim_end_matches(['\0', ' ']);

        let rating = f32::from_be_bytes([
            data[RATING_OFFSET],
            data[RATING_OFFSET + 1],
            data[RATING_OFFSET + 2],
            data[RATING_OFFSET + 3],
        ]);
        let votes = i32::from_be_bytes([
            data[VOTES_OFFSET],
            data[VOTES_OFFSET + 1],
            data[VOTES_OFFSET + 2],
            data[VOTES_OFFSET + 3],
        ]);

        Ok(Self::new(id, rating, votes))
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.valid {
            write!(f, "{} {:.1} {}", self.id, self.rating, self.votes)
        } else {
            write!(f, "<empty>")
        }
    }
}
