//! End-to-end scenarios through the public session API.

use blockhashdb::{create_hashdb, hashdb_settings, is_valid_hashdb, ImportSession, ScanSession};
use blockhashdb::{Error, Result};
use crc::{Crc, CRC_32_ISO_HDLC};
use std::path::{Path, PathBuf};
use tempfile::tempdir;

const HASH_A: [u8; 16] = [0u8; 16];
const HASH_B: [u8; 16] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];

const FILE_HASH_1: [u8; 16] = [0xa1; 16];
const FILE_HASH_2: [u8; 16] = [0xa2; 16];

// sector_size 512, max_id_offset_pairs 2
fn new_db(parent: &Path) -> Result<PathBuf> {
    let db_dir = parent.join("db");
    create_hashdb(&db_dir, 512, 512, 2, 28, 3, "test create")?;
    Ok(db_dir)
}

fn register_source(import: &mut ImportSession, file_hash: &[u8], name: &str) -> Result<u64> {
    let (_, source_id) = import.insert_source_id(file_hash)?;
    import.insert_source_data(source_id, file_hash, 800, "E01", 0)?;
    import.insert_source_name(source_id, "repo", name)?;
    Ok(source_id)
}

#[test]
fn single_source_round_trip_with_duplicates() -> Result<()> {
    let dir = tempdir()?;
    let db_dir = new_db(dir.path())?;

    {
        let mut import = ImportSession::open(&db_dir, "test import")?;
        let s1 = register_source(&mut import, &FILE_HASH_1, "one.E01")?;

        // first sighting
        assert_eq!(import.insert_hash(&HASH_A, 1.0, "bl", s1, 512)?, 1);
        // the same offset again is a sighting, not a new offset
        assert_eq!(import.insert_hash(&HASH_A, 1.0, "bl", s1, 512)?, 2);
        assert_eq!(import.changes().duplicate_offset_detected, 1);
        assert_eq!(import.changes().offset_inserted, 1);
    }

    let scan = ScanSession::open(&db_dir)?;
    assert_eq!(scan.find_hash_count(&HASH_A)?, 2);
    let record = scan.find_hash(&HASH_A)?.unwrap();
    assert_eq!(record.count, 2);
    assert_eq!(record.sources.len(), 1);
    assert_eq!(record.sources[0].sub_count, 2);
    assert_eq!(record.sources[0].file_offsets, vec![512]);
    Ok(())
}

#[test]
fn changed_entropy_is_stored_and_counted() -> Result<()> {
    let dir = tempdir()?;
    let db_dir = new_db(dir.path())?;

    {
        let mut import = ImportSession::open(&db_dir, "test import")?;
        let s1 = register_source(&mut import, &FILE_HASH_1, "one.E01")?;
        import.insert_hash(&HASH_A, 1.0, "bl", s1, 512)?;
        import.insert_hash(&HASH_A, 1.0, "bl", s1, 512)?;
        assert_eq!(import.changes().data_changed, 0);

        import.insert_hash(&HASH_A, 2.0, "bl", s1, 512)?;
        assert_eq!(import.changes().data_changed, 1);
    }

    let scan = ScanSession::open(&db_dir)?;
    let record = scan.find_hash(&HASH_A)?.unwrap();
    assert!((record.entropy - 2.0).abs() < 1e-9);
    assert_eq!(record.block_label, "bl");
    Ok(())
}

#[test]
fn promotion_and_source_cap() -> Result<()> {
    let dir = tempdir()?;
    let db_dir = new_db(dir.path())?;

    {
        let mut import = ImportSession::open(&db_dir, "test import")?;
        let s1 = register_source(&mut import, &FILE_HASH_1, "one.E01")?;
        let s2 = register_source(&mut import, &FILE_HASH_2, "two.E01")?;

        import.insert_hash(&HASH_A, 1.0, "bl", s1, 512)?;
        import.insert_hash(&HASH_A, 1.0, "bl", s1, 512)?;

        // second source promotes the record
        assert_eq!(import.insert_hash(&HASH_A, 1.0, "bl", s2, 1024)?, 3);
        assert_eq!(import.changes().source_inserted, 2);

        // a third source is over max_id_offset_pairs: counted, not stored
        assert_eq!(import.insert_hash(&HASH_A, 1.0, "bl", 3, 1536)?, 4);
        assert_eq!(import.changes().source_inserted, 2);
    }

    let scan = ScanSession::open(&db_dir)?;
    let record = scan.find_hash(&HASH_A)?.unwrap();
    assert_eq!(record.count, 4);
    assert_eq!(record.sources.len(), 2);
    assert_eq!(record.sources[0].source_id, 1);
    assert_eq!(record.sources[0].file_offsets, vec![512]);
    assert_eq!(record.sources[1].source_id, 2);
    assert_eq!(record.sources[1].file_offsets, vec![1024]);
    Ok(())
}

#[test]
fn misaligned_offset_is_rejected_without_state_change() -> Result<()> {
    let dir = tempdir()?;
    let db_dir = new_db(dir.path())?;

    {
        let mut import = ImportSession::open(&db_dir, "test import")?;
        let s1 = register_source(&mut import, &FILE_HASH_1, "one.E01")?;
        assert_eq!(import.insert_hash(&HASH_A, 1.0, "bl", s1, 513)?, 0);
        assert_eq!(import.changes().source_inserted, 0);
        assert_eq!(import.changes().offset_inserted, 0);
    }

    let scan = ScanSession::open(&db_dir)?;
    assert_eq!(scan.find_hash(&HASH_A)?, None);
    assert_eq!(scan.size()?, 0);
    Ok(())
}

#[test]
fn expanded_hash_document_and_memoization() -> Result<()> {
    let dir = tempdir()?;
    let db_dir = new_db(dir.path())?;

    {
        let mut import = ImportSession::open(&db_dir, "test import")?;
        let s1 = register_source(&mut import, &FILE_HASH_1, "one.E01")?;
        let s2 = register_source(&mut import, &FILE_HASH_2, "two.E01")?;

        import.insert_hash(&HASH_A, 1.0, "bl", s1, 512)?;
        import.insert_hash(&HASH_A, 1.0, "bl", s2, 1024)?;
        // a second hash seen only in source 1
        import.insert_hash(&HASH_B, 1.0, "bl", s1, 2048)?;
    }

    let mut scan = ScanSession::open(&db_dir)?;
    let text = scan.find_expanded_hash(&HASH_A)?;
    let doc: serde_json::Value = serde_json::from_str(&text).expect("valid json");

    // source_list_id is a CRC-32 over the emitted little-endian source ids
    let crc32 = Crc::<u32>::new(&CRC_32_ISO_HDLC);
    let mut digest = crc32.digest();
    digest.update(&1u64.to_le_bytes());
    digest.update(&2u64.to_le_bytes());
    assert_eq!(doc[0]["source_list_id"], digest.finalize());

    let sources = doc[1]["sources"].as_array().unwrap();
    assert_eq!(sources.len(), 2);
    assert_eq!(sources[0]["source_id"], 1);
    assert_eq!(sources[0]["file_hash"], hex::encode(FILE_HASH_1));
    assert_eq!(sources[0]["filesize"], 800);
    assert_eq!(sources[0]["names"][0]["repository_name"], "repo");
    assert_eq!(sources[0]["names"][0]["filename"], "one.E01");

    assert_eq!(
        doc[2]["id_offset_pairs"],
        serde_json::json!([1, 512, 2, 1024])
    );

    // the same hash expands to empty text the second time
    assert_eq!(scan.find_expanded_hash(&HASH_A)?, "");

    // source 1 was already expanded, so the second hash omits it
    let text = scan.find_expanded_hash(&HASH_B)?;
    let doc: serde_json::Value = serde_json::from_str(&text).expect("valid json");
    assert_eq!(doc[1]["sources"].as_array().unwrap().len(), 0);
    assert_eq!(doc[2]["id_offset_pairs"], serde_json::json!([1, 2048]));

    // an unknown hash expands to empty text
    assert_eq!(scan.find_expanded_hash(&[0x42; 16])?, "");
    Ok(())
}

#[test]
fn hash_and_source_iteration() -> Result<()> {
    let dir = tempdir()?;
    let db_dir = new_db(dir.path())?;

    {
        let mut import = ImportSession::open(&db_dir, "test import")?;
        let s1 = register_source(&mut import, &FILE_HASH_1, "one.E01")?;
        let s2 = register_source(&mut import, &FILE_HASH_2, "two.E01")?;
        import.insert_hash(&HASH_B, 0.0, "", s2, 0)?;
        import.insert_hash(&HASH_A, 0.0, "", s1, 0)?;
        import.insert_hash(&HASH_A, 0.0, "", s2, 512)?;
    }

    let scan = ScanSession::open(&db_dir)?;

    // hashes come back in byte order, continuation rows skipped
    assert_eq!(scan.hash_begin()?, Some(HASH_A.to_vec()));
    assert_eq!(scan.hash_next(&HASH_A)?, Some(HASH_B.to_vec()));
    assert_eq!(scan.hash_next(&HASH_B)?, None);

    assert_eq!(scan.source_begin()?, Some(1));
    assert_eq!(scan.source_next(1)?, Some(2));
    assert_eq!(scan.source_next(2)?, None);
    Ok(())
}

#[test]
fn settings_surface_and_validity() -> Result<()> {
    let dir = tempdir()?;
    let db_dir = new_db(dir.path())?;

    is_valid_hashdb(&db_dir)?;
    let settings = hashdb_settings(&db_dir)?;
    assert_eq!(settings.sector_size, 512);
    assert_eq!(settings.max_id_offset_pairs, 2);

    // an arbitrary directory is not a database
    assert!(matches!(
        is_valid_hashdb(dir.path()),
        Err(Error::Invalid(_))
    ));
    Ok(())
}

#[test]
fn merge_carries_foreign_source_entries() -> Result<()> {
    let dir = tempdir()?;
    let db_dir = new_db(dir.path())?;

    {
        let mut import = ImportSession::open(&db_dir, "test merge")?;
        let s1 = register_source(&mut import, &FILE_HASH_1, "one.E01")?;
        assert_eq!(
            import.merge_hash(&HASH_A, 1.0, "bl", s1, 3, &[512, 1024])?,
            3
        );
        // replaying the same entry doubles the sighting count but not the offsets
        assert_eq!(
            import.merge_hash(&HASH_A, 1.0, "bl", s1, 3, &[512, 1024])?,
            6
        );
        assert_eq!(import.changes().duplicate_offset_detected, 2);
        assert_eq!(import.changes().mismatched_sub_count_detected, 0);
    }

    let scan = ScanSession::open(&db_dir)?;
    let record = scan.find_hash(&HASH_A)?.unwrap();
    assert_eq!(record.count, 6);
    assert_eq!(record.sources[0].file_offsets, vec![512, 1024]);
    Ok(())
}
