//! Database facade: a block store plus the (votes, id) index built over it

use std::io::Read;
use std::path::Path;

use ahash::AHashSet;
use csv::{ReaderBuilder, Trim};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::access::{AccessLog, AccessSummary};
use crate::btree::{BPlusTree, BPlusTreeError, DEFAULT_ORDER, IndexKey, TreeEvents};
use crate::record::{RECORD_SIZE, Record, RecordAddress, RecordError, Storage, StorageConfig};

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Record error: {0}")]
    RecordError(#[from] RecordError),

    #[error("Index error: {0}")]
    IndexError(#[from] BPlusTreeError),

    #[error("Cannot parse input: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Cannot read/write file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Record {0} is already indexed")]
    DuplicateRecord(String),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Storage layout plus index order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DatabaseConfig {
    pub storage: StorageConfig,
    pub order: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            order: DEFAULT_ORDER,
        }
    }
}

/// One row of the ratings file
#[derive(Debug, Deserialize)]
struct TsvRow {
    tconst: String,
    #[serde(rename = "averageRating")]
    average_rating: f32,
    #[serde(rename = "numVotes")]
    num_votes: i32,
}

/// Outcome of a bulk load
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub rows: usize,
    pub loaded: usize,
    pub skipped: usize,
    pub blocks: usize,
}

/// A record together with the address it was read from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FoundRecord {
    pub address: RecordAddress,
    pub record: Record,
}

/// Records matched by a query and the accesses needed to fetch them
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub records: Vec<FoundRecord>,
    pub access: AccessSummary,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Mean rating of the matched records, `None` when nothing matched
    pub fn average_rating(&self) -> Option<f64> {
        if self.records.is_empty() {
            return None;
        }
        let total: f64 = self.records.iter().map(|r| f64::from(r.record.rating)).sum();
        Some(total / self.records.len() as f64)
    }
}

/// Outcome of deleting every record with a vote count
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeleteReport {
    pub votes: i32,
    pub removed: usize,
    pub index: IndexReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageReport {
    pub block_size: usize,
    pub record_size: usize,
    pub slots_per_block: usize,
    pub blocks: usize,
    pub records: usize,
    pub free_slots: usize,
    pub used_bytes: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub order: usize,
    pub entries: usize,
    pub height: usize,
    pub nodes: usize,
    /// Primary keys held by the root
    pub root_keys: Vec<i32>,
    pub events: TreeEvents,
}

pub struct Database {
    config: DatabaseConfig,
    storage: Storage,
    index: BPlusTree,
}

impl Database {
    /// Create an empty database
    pub fn new(config: DatabaseConfig) -> DatabaseResult<Self> {
        let storage = Storage::new(config.storage)?;
        let index = BPlusTree::new(config.order)?;
        Ok(Self {
            config,
            storage,
            index,
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn index(&self) -> &BPlusTree {
        &self.index
    }

    /// Load a tab separated ratings file and rebuild the index
    ///
    /// The file needs a header naming `tconst`, `averageRating` and
    /// `numVotes`. Rows that cannot be parsed, carry an unusable id, or repeat
    /// an indexed (votes, id) pair are skipped with a warning.
    ///
    /// The index is rebuilt even when the load stops early, so every record
    /// stored before the failure stays reachable.
    pub fn load_tsv(&mut self, path: impl AsRef<Path>) -> DatabaseResult<LoadReport> {
        let path = path.as_ref();
        let mut reader = ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .quoting(false)
            .trim(Trim::All)
            .from_path(path)?;

        let mut report = LoadReport {
            rows: 0,
            loaded: 0,
            skipped: 0,
            blocks: 0,
        };
        let stored = self.store_rows(&mut reader, &mut report);

        self.index = self.storage.build_index(self.config.order)?;
        report.blocks = self.storage.block_count();

        if let Err(err) = stored {
            tracing::warn!(
                path = %path.display(),
                loaded = report.loaded,
                %err,
                "load stopped early"
            );
            return Err(err);
        }

        tracing::info!(
            path = %path.display(),
            loaded = report.loaded,
            skipped = report.skipped,
            blocks = report.blocks,
            height = self.index.height(),
            "loaded ratings"
        );
        Ok(report)
    }

    /// Write every usable row to the store without touching the index
    fn store_rows<R: Read>(
        &mut self,
        reader: &mut csv::Reader<R>,
        report: &mut LoadReport,
    ) -> DatabaseResult<()> {
        let mut seen: AHashSet<IndexKey> = self.index.iter().map(|entry| entry.key).collect();

        for result in reader.deserialize::<TsvRow>() {
            report.rows += 1;
            let row = match result {
                Ok(row) => row,
                Err(err) if err.is_io_error() => return Err(err.into()),
                Err(err) => {
                    tracing::warn!(row = report.rows, %err, "skipping malformed row");
                    report.skipped += 1;
                    continue;
                }
            };

            let record = Record::new(row.tconst, row.average_rating, row.num_votes);
            let key = match IndexKey::from_record(&record) {
                Ok(key) => key,
                Err(err) => {
                    tracing::warn!(row = report.rows, %err, "skipping row with invalid id");
                    report.skipped += 1;
                    continue;
                }
            };
            if !seen.insert(key) {
                tracing::warn!(row = report.rows, id = %record.id, "skipping duplicate row");
                report.skipped += 1;
                continue;
            }

            self.storage
                .create_record(&record.id, record.rating, record.votes)?;
            report.loaded += 1;
        }

        Ok(())
    }

    /// Store a record and index it
    pub fn insert(&mut self, id: &str, rating: f32, votes: i32) -> DatabaseResult<RecordAddress> {
        Record::validate_id(id)?;
        let key = IndexKey::from_record(&Record::new(id, rating, votes))?;
        if self.index.contains_key(&key) {
            return Err(DatabaseError::DuplicateRecord(id.to_string()));
        }

        let address = self.storage.create_record(id, rating, votes)?;
        if let Err(err) = self.index.insert_entry(key, address) {
            self.storage.delete_record(address)?;
            return Err(err.into());
        }
        Ok(address)
    }

    /// All records with exactly `votes` votes
    pub fn find(&self, votes: i32) -> DatabaseResult<QueryResult> {
        self.find_range(votes, votes)
    }

    /// All records with `lower <= votes <= upper`, in (votes, id) order
    pub fn find_range(&self, lower: i32, upper: i32) -> DatabaseResult<QueryResult> {
        let mut log = AccessLog::new();
        let addresses = self.index.range_search_with(lower, upper, &mut log);

        let records = addresses
            .into_iter()
            .map(|address| -> DatabaseResult<FoundRecord> {
                let record = self.storage.read_record_with(address, &mut log)?;
                Ok(FoundRecord { address, record })
            })
            .collect::<DatabaseResult<Vec<_>>>()?;

        Ok(QueryResult {
            records,
            access: log.summary(),
        })
    }

    /// Delete every record with `votes` votes from the index and the store
    pub fn delete(&mut self, votes: i32) -> DatabaseResult<DeleteReport> {
        let addresses = self.index.search(votes);
        let removed = self.index.delete(votes)?;
        for address in addresses {
            self.storage.delete_record(address)?;
        }

        tracing::debug!(votes, removed, height = self.index.height(), "deleted records");
        Ok(DeleteReport {
            votes,
            removed,
            index: self.index_report(),
        })
    }

    pub fn storage_report(&self) -> StorageReport {
        let config = self.storage.config();
        StorageReport {
            block_size: config.block_size,
            record_size: RECORD_SIZE,
            slots_per_block: self.storage.slots_per_block(),
            blocks: self.storage.block_count(),
            records: self.storage.record_count(),
            free_slots: self.storage.free_slot_count(),
            used_bytes: self.storage.used_bytes(),
            capacity: config.capacity,
        }
    }

    pub fn index_report(&self) -> IndexReport {
        IndexReport {
            order: self.index.order(),
            entries: self.index.len(),
            height: self.index.height(),
            nodes: self.index.node_count(),
            root_keys: self.index.root_keys().iter().map(|k| k.primary).collect(),
            events: self.index.events(),
        }
    }
}

#[cfg(test)]
mod tests;
