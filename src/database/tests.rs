use std::collections::BTreeMap;
use std::io::Write;

use super::*;
use tempfile::NamedTempFile;

const HEADER: &str = "tconst\taverageRating\tnumVotes";

fn write_tsv(rows: &[String]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "{HEADER}").unwrap();
    for row in rows {
        writeln!(file, "{row}").unwrap();
    }
    file.flush().unwrap();
    file
}

fn row(n: usize, rating: f32, votes: i32) -> String {
    format!("tt{n:07}\t{rating}\t{votes}")
}

fn setup_test_db(config: DatabaseConfig) -> Database {
    Database::new(config).unwrap()
}

fn small_config() -> DatabaseConfig {
    DatabaseConfig {
        storage: StorageConfig::new(100, 1 << 20),
        order: 3,
    }
}

/// Rows with vote counts 10, 20, ..., 200; count `k` appears `k / 10 % 3 + 1` times
fn sample_rows() -> Vec<String> {
    let mut rows = Vec::new();
    let mut n = 0;
    for votes in (10..=200).step_by(10) {
        for copy in 0..(votes / 10 % 3 + 1) {
            rows.push(row(n, 5.0 + copy as f32, votes));
            n += 1;
        }
    }
    rows
}

#[test]
fn test_load_tsv() {
    let rows: Vec<String> = (0..12).map(|i| row(i, 7.5, i as i32 * 3)).collect();
    let file = write_tsv(&rows);
    let mut db = setup_test_db(small_config());

    let report = db.load_tsv(file.path()).unwrap();
    assert_eq!(
        report,
        LoadReport {
            rows: 12,
            loaded: 12,
            skipped: 0,
            blocks: 3,
        }
    );

    let storage = db.storage_report();
    assert_eq!(storage.slots_per_block, 5);
    assert_eq!(storage.records, 12);
    assert_eq!(storage.free_slots, 3);
    assert_eq!(storage.used_bytes, 300);

    let index = db.index_report();
    assert_eq!(index.entries, 12);
    assert_eq!(index.order, 3);
    assert!(index.height >= 2);
    db.index().validate().unwrap();
}

#[test]
fn test_load_skips_bad_rows() {
    let rows = vec![
        row(1, 6.1, 100),
        "tt0000002\tnot-a-number\t5".to_string(),
        "tt0000003\t5.5".to_string(),
        "tt000000000004\t5.5\t10".to_string(),
        row(5, 7.0, 100),
        row(5, 7.0, 100),
        "tt0000006\t8.0\t\\N".to_string(),
        row(7, 4.2, 3),
    ];
    let file = write_tsv(&rows);
    let mut db = setup_test_db(small_config());

    let report = db.load_tsv(file.path()).unwrap();
    assert_eq!(report.rows, 8);
    assert_eq!(report.loaded, 3);
    assert_eq!(report.skipped, 5);

    assert_eq!(db.find(100).unwrap().len(), 2);
    assert_eq!(db.find(3).unwrap().len(), 1);
    assert!(db.find(10).unwrap().is_empty());
}

#[test]
fn test_load_missing_file() {
    let mut db = setup_test_db(small_config());
    let result = db.load_tsv("/nonexistent/ratings.tsv");
    assert!(result.is_err());
    assert_eq!(db.index().len(), 0);
}

#[test]
fn test_find_matches_file_counts() {
    let rows = sample_rows();
    let file = write_tsv(&rows);
    let mut db = setup_test_db(small_config());
    db.load_tsv(file.path()).unwrap();

    let mut expected: BTreeMap<i32, usize> = BTreeMap::new();
    for votes in (10..=200).step_by(10) {
        *expected.entry(votes).or_default() += (votes / 10 % 3 + 1) as usize;
    }

    for (&votes, &count) in &expected {
        let result = db.find(votes).unwrap();
        assert_eq!(result.len(), count, "votes {votes}");
        assert!(result.records.iter().all(|r| r.record.votes == votes));
        // Records come back in id order within one vote count
        let ids: Vec<&str> = result.records.iter().map(|r| r.record.id.as_str()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    assert!(db.find(15).unwrap().is_empty());
    assert!(db.find(0).unwrap().is_empty());
}

#[test]
fn test_find_range() {
    let rows = sample_rows();
    let file = write_tsv(&rows);
    let mut db = setup_test_db(small_config());
    db.load_tsv(file.path()).unwrap();

    let result = db.find_range(50, 80).unwrap();
    let votes: Vec<i32> = result.records.iter().map(|r| r.record.votes).collect();
    // 50 -> 3 copies, 60 -> 1, 70 -> 2, 80 -> 3
    assert_eq!(votes, vec![50, 50, 50, 60, 70, 70, 80, 80, 80]);

    assert!(db.find_range(80, 50).unwrap().is_empty());
    assert_eq!(db.find_range(i32::MIN, i32::MAX).unwrap().len(), rows.len());
}

#[test]
fn test_query_access_summary() {
    let rows = sample_rows();
    let file = write_tsv(&rows);
    let mut db = setup_test_db(small_config());
    db.load_tsv(file.path()).unwrap();

    let result = db.find_range(100, 150).unwrap();
    let access = &result.access;
    assert!(access.node_visits >= db.index().height());
    assert_eq!(access.block_reads, result.len());
    assert!(access.distinct_blocks <= access.block_reads);
    assert!(access.nodes.len() <= crate::access::SAMPLE_LIMIT);
    assert!(access.blocks.len() <= crate::access::SAMPLE_LIMIT);

    let empty = db.find(12345).unwrap();
    assert_eq!(empty.access.block_reads, 0);
    assert!(empty.access.node_visits >= 1);
}

#[test]
fn test_average_rating() {
    let mut db = setup_test_db(small_config());
    db.insert("tt0000001", 6.0, 10).unwrap();
    db.insert("tt0000002", 8.0, 10).unwrap();
    db.insert("tt0000003", 1.0, 11).unwrap();

    let result = db.find(10).unwrap();
    assert_eq!(result.average_rating(), Some(7.0));
    assert_eq!(db.find(99).unwrap().average_rating(), None);
}

#[test]
fn test_delete_empties_searches() {
    let rows = sample_rows();
    let file = write_tsv(&rows);
    let mut db = setup_test_db(small_config());
    db.load_tsv(file.path()).unwrap();

    for votes in (10..=200).step_by(10) {
        let expected = (votes / 10 % 3 + 1) as usize;
        let report = db.delete(votes).unwrap();
        assert_eq!(report.removed, expected, "votes {votes}");
        assert!(db.find(votes).unwrap().is_empty());
        db.index().validate().unwrap();
    }

    let storage = db.storage_report();
    assert_eq!(storage.records, 0);
    assert_eq!(storage.free_slots, storage.blocks * storage.slots_per_block);

    let index = db.index_report();
    assert_eq!(index.entries, 0);
    assert_eq!(index.height, 1);
    assert!(index.events.merges > 0);
}

#[test]
fn test_delete_missing_votes() {
    let mut db = setup_test_db(small_config());
    db.insert("tt0000001", 6.0, 10).unwrap();

    let report = db.delete(11).unwrap();
    assert_eq!(report.removed, 0);
    assert_eq!(report.index.entries, 1);
    assert_eq!(db.storage_report().records, 1);
}

#[test]
fn test_insert_reuses_deleted_slot() {
    let mut db = setup_test_db(small_config());
    let addresses: Vec<RecordAddress> = (0..12)
        .map(|i| db.insert(&format!("tt{i:07}"), 5.0, i).unwrap())
        .collect();
    assert_eq!(addresses[2], RecordAddress::new(0, 2));
    assert_eq!(db.storage_report().blocks, 3);

    db.delete(2).unwrap();
    let address = db.insert("tt9999999", 9.0, 500).unwrap();
    assert_eq!(address, RecordAddress::new(0, 2));

    let result = db.find(500).unwrap();
    assert_eq!(result.records[0].address, address);
    assert_eq!(result.records[0].record.id, "tt9999999");
    assert_eq!(db.storage_report().blocks, 3);
}

#[test]
fn test_insert_rejects_bad_records() {
    let mut db = setup_test_db(small_config());
    db.insert("tt0000001", 6.0, 10).unwrap();

    assert!(matches!(
        db.insert("tt0000001", 7.0, 10),
        Err(DatabaseError::DuplicateRecord(_))
    ));
    assert!(matches!(
        db.insert("tt000000000001", 7.0, 10),
        Err(DatabaseError::RecordError(RecordError::IdTooLong { .. }))
    ));

    // Nothing was written for the rejected records
    assert_eq!(db.storage_report().records, 1);
    assert_eq!(db.index().len(), 1);
}

#[test]
fn test_load_exhausts_arena() {
    let config = DatabaseConfig {
        storage: StorageConfig::new(100, 200),
        order: 3,
    };
    let rows: Vec<String> = (0..12).map(|i| row(i, 5.0, i as i32)).collect();
    let file = write_tsv(&rows);
    let mut db = setup_test_db(config);

    let result = db.load_tsv(file.path());
    assert!(matches!(
        result,
        Err(DatabaseError::RecordError(RecordError::ArenaExhausted { .. }))
    ));
    assert_eq!(db.storage_report().blocks, 2);

    // Records stored before the failure are indexed and searchable
    assert_eq!(db.storage_report().records, 10);
    assert_eq!(db.index().len(), db.storage_report().records);
    db.index().validate().unwrap();
    let found = db.find(3).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found.records[0].record.id, "tt0000003");
    assert!(db.find(11).unwrap().is_empty());
}

#[test]
fn test_invalid_config() {
    let bad_order = DatabaseConfig {
        order: 2,
        ..DatabaseConfig::default()
    };
    assert!(matches!(
        Database::new(bad_order),
        Err(DatabaseError::IndexError(BPlusTreeError::InvalidOrder(2)))
    ));

    let bad_block = DatabaseConfig {
        storage: StorageConfig::new(10, 1000),
        order: 3,
    };
    assert!(matches!(
        Database::new(bad_block),
        Err(DatabaseError::RecordError(RecordError::InvalidConfig(_)))
    ));
}

#[test]
fn test_reports_serialize() {
    let mut db = setup_test_db(small_config());
    db.insert("tt0000001", 6.0, 10).unwrap();

    let json = serde_json::to_value(db.index_report()).unwrap();
    assert_eq!(json["entries"], 1);
    assert_eq!(json["root_keys"], serde_json::json!([10]));

    let json = serde_json::to_value(db.find(10).unwrap()).unwrap();
    assert_eq!(json["records"][0]["record"]["id"], "tt0000001");
    assert_eq!(json["records"][0]["address"]["slot_id"], 0);
}
