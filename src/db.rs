use crate::changes::Changes;
use crate::error::{Error, Result};
use crate::filter::HashFilterManager;
use crate::hash_data::{HashDataManager, HashRecord};
use crate::logger::Logger;
use crate::schema;
use crate::settings::{self, Settings};
use crate::source_data::{SourceData, SourceDataManager};
use crate::source_id::SourceIdManager;
use crate::source_name::SourceNameManager;
use crate::store::{Mode, Store, STORE_FILE};
use crc::{Crc, CRC_32_ISO_HDLC};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Entry counts of the five stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreSizes {
    pub hash_data_store: u64,
    pub hash_store: u64,
    pub source_data_store: u64,
    pub source_id_store: u64,
    pub source_name_store: u64,
}

/// Check that the directory holds a usable database: readable,
/// version-compatible settings and the store file itself.
pub fn is_valid_hashdb(dir: &Path) -> Result<()> {
    settings::read_settings(dir)?;
    if !dir.join(STORE_FILE).is_file() {
        return Err(Error::Invalid(format!(
            "path '{}' is missing its store file",
            dir.display()
        )));
    }
    Ok(())
}

/// Read the settings of an existing database.
pub fn hashdb_settings(dir: &Path) -> Result<Settings> {
    settings::read_settings(dir)
}

fn value_or(value: u32, default: u32) -> u32 {
    if value == 0 {
        default
    } else {
        value
    }
}

/// Create a new database directory. The path must not exist yet. Zero
/// parameters fall back to the defaults.
pub fn create_hashdb(
    dir: &Path,
    sector_size: u32,
    block_size: u32,
    max_id_offset_pairs: u32,
    hash_prefix_bits: u32,
    hash_suffix_bytes: u32,
    command: &str,
) -> Result<()> {
    if dir.exists() {
        return Err(Error::Invalid(format!(
            "path '{}' already exists",
            dir.display()
        )));
    }
    fs::create_dir(dir)?;

    let new_settings = Settings {
        data_store_version: settings::CURRENT_DATA_STORE_VERSION,
        sector_size: value_or(sector_size, settings::DEFAULT_SECTOR_SIZE),
        block_size: value_or(block_size, settings::DEFAULT_BLOCK_SIZE),
        max_id_offset_pairs: value_or(max_id_offset_pairs, settings::DEFAULT_MAX_ID_OFFSET_PAIRS),
        max_sub_count: settings::DEFAULT_MAX_SUB_COUNT,
        hash_manager_key_bits: value_or(hash_prefix_bits, settings::DEFAULT_HASH_MANAGER_KEY_BITS),
        hash_manager_hash_bytes: value_or(
            hash_suffix_bytes,
            settings::DEFAULT_HASH_MANAGER_HASH_BYTES,
        ),
    };
    settings::write_settings(dir, &new_settings)?;

    // Create the store and all tables, then release the writer lock.
    drop(Store::open(dir, Mode::RwNew)?);

    drop(Logger::open(dir, command)?);
    Ok(())
}

// The managers of one open environment, shared by both session kinds.
struct Managers {
    settings: Settings,
    store: Arc<Store>,
    source_ids: SourceIdManager,
    source_data: SourceDataManager,
    source_names: SourceNameManager,
    hash_data: HashDataManager,
}

impl Managers {
    fn open(dir: &Path, mode: Mode) -> Result<Managers> {
        let settings = settings::read_settings(dir)?;
        let store = Arc::new(Store::open(dir, mode)?);

        let filter = HashFilterManager::new(
            store.clone(),
            settings.hash_manager_key_bits,
            settings.hash_manager_hash_bytes,
        );
        let hash_data = HashDataManager::new(
            store.clone(),
            filter,
            settings.sector_size as u64,
            settings.max_sub_count as u64,
            settings.max_id_offset_pairs as u64,
        );

        Ok(Managers {
            settings,
            source_ids: SourceIdManager::new(store.clone()),
            source_data: SourceDataManager::new(store.clone()),
            source_names: SourceNameManager::new(store.clone()),
            hash_data,
            store,
        })
    }

    fn sizes(&self) -> Result<StoreSizes> {
        Ok(StoreSizes {
            hash_data_store: self.store.table_len(schema::HASH_DATA)?,
            hash_store: self.store.table_len(schema::HASH_FILTER)?,
            source_data_store: self.store.table_len(schema::SOURCE_DATA)?,
            source_id_store: self.store.table_len(schema::SOURCE_ID)?,
            source_name_store: self.store.table_len(schema::SOURCE_NAME)?,
        })
    }
}

/// Writing session over an existing database.
///
/// Accumulates change counters across all insert calls and appends them
/// to log.json when the session is dropped.
pub struct ImportSession {
    managers: Managers,
    logger: Logger,
    changes: Changes,
}

impl ImportSession {
    pub fn open(dir: &Path, command: &str) -> Result<ImportSession> {
        let managers = Managers::open(dir, Mode::RwModify)?;
        let logger = Logger::open(dir, command)?;
        Ok(ImportSession {
            managers,
            logger,
            changes: Changes::default(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.managers.settings
    }

    pub fn changes(&self) -> &Changes {
        &self.changes
    }

    /// Return the source id for the file hash, allocating one on first
    /// sighting.
    pub fn insert_source_id(&mut self, file_binary_hash: &[u8]) -> Result<(bool, u64)> {
        self.managers
            .source_ids
            .insert(file_binary_hash, &mut self.changes)
    }

    pub fn insert_source_data(
        &mut self,
        source_id: u64,
        file_binary_hash: &[u8],
        filesize: u64,
        file_type: &str,
        low_entropy_count: u64,
    ) -> Result<bool> {
        let data = SourceData {
            file_binary_hash: file_binary_hash.to_vec(),
            filesize,
            file_type: file_type.to_string(),
            low_entropy_count,
        };
        self.managers
            .source_data
            .insert(source_id, &data, &mut self.changes)
    }

    pub fn insert_source_name(
        &mut self,
        source_id: u64,
        repository_name: &str,
        filename: &str,
    ) -> Result<bool> {
        self.managers
            .source_names
            .insert(source_id, repository_name, filename, &mut self.changes)
    }

    /// Record one sighting of the block hash. Returns the new aggregate
    /// count, or 0 when the input was rejected.
    pub fn insert_hash(
        &mut self,
        hash: &[u8],
        entropy: f64,
        block_label: &str,
        source_id: u64,
        file_offset: u64,
    ) -> Result<u64> {
        self.managers.hash_data.insert(
            hash,
            entropy,
            block_label,
            source_id,
            file_offset,
            &mut self.changes,
        )
    }

    /// Fold a whole SourceEntry from another database into this one.
    pub fn merge_hash(
        &mut self,
        hash: &[u8],
        entropy: f64,
        block_label: &str,
        source_id: u64,
        sub_count: u64,
        file_offsets: &[u64],
    ) -> Result<u64> {
        self.managers.hash_data.merge(
            hash,
            entropy,
            block_label,
            source_id,
            sub_count,
            file_offsets,
            &mut self.changes,
        )
    }

    pub fn sizes(&self) -> Result<StoreSizes> {
        self.managers.sizes()
    }
}

impl Drop for ImportSession {
    fn drop(&mut self) {
        if let Err(e) = self.logger.add_changes(&self.changes) {
            tracing::warn!(error = %e, "unable to flush change counters to log");
        }
    }
}

#[derive(Serialize)]
struct ExpandedName {
    repository_name: String,
    filename: String,
}

#[derive(Serialize)]
struct ExpandedSource {
    source_id: u64,
    file_hash: String,
    filesize: u64,
    file_type: String,
    low_entropy_count: u64,
    names: Vec<ExpandedName>,
}

#[derive(Serialize)]
struct SourceListIdObject {
    source_list_id: u32,
}

#[derive(Serialize)]
struct SourcesObject {
    sources: Vec<ExpandedSource>,
}

#[derive(Serialize)]
struct PairsObject {
    id_offset_pairs: Vec<u64>,
}

/// Read-only probing session over an existing database.
pub struct ScanSession {
    managers: Managers,
    // Memoization for expanded scans: a hash or source already expanded
    // in this session is not expanded again.
    expanded_hashes: HashSet<Vec<u8>>,
    expanded_sources: HashSet<u64>,
}

impl ScanSession {
    pub fn open(dir: &Path) -> Result<ScanSession> {
        Ok(ScanSession {
            managers: Managers::open(dir, Mode::ReadOnly)?,
            expanded_hashes: HashSet::new(),
            expanded_sources: HashSet::new(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.managers.settings
    }

    pub fn find_hash(&self, hash: &[u8]) -> Result<Option<HashRecord>> {
        self.managers.hash_data.find(hash)
    }

    pub fn find_hash_count(&self, hash: &[u8]) -> Result<u64> {
        self.managers.hash_data.find_count(hash)
    }

    /// Resolve a hash to the full JSON evidence document:
    ///
    /// `[{"source_list_id":…}, {"sources":[…]}, {"id_offset_pairs":[…]}]`
    ///
    /// Returns empty text when the hash is absent or was already expanded
    /// in this session; sources already expanded for an earlier hash are
    /// omitted from the sources list.
    pub fn find_expanded_hash(&mut self, hash: &[u8]) -> Result<String> {
        let Some(record) = self.managers.hash_data.find(hash)? else {
            return Ok(String::new());
        };
        if !self.expanded_hashes.insert(hash.to_vec()) {
            return Ok(String::new());
        }

        // id_offset_pairs in ascending source then offset order; the
        // list id is a CRC-32 over the source ids as emitted.
        let mut pairs = Vec::new();
        let mut digest = CRC32.digest();
        for entry in &record.sources {
            for &offset in &entry.file_offsets {
                digest.update(&entry.source_id.to_le_bytes());
                pairs.push(entry.source_id);
                pairs.push(offset);
            }
        }

        let mut sources = Vec::new();
        for entry in &record.sources {
            if !self.expanded_sources.insert(entry.source_id) {
                continue;
            }
            sources.push(self.expand_source(entry.source_id)?);
        }

        let document = (
            SourceListIdObject {
                source_list_id: digest.finalize(),
            },
            SourcesObject { sources },
            PairsObject {
                id_offset_pairs: pairs,
            },
        );
        Ok(serde_json::to_string(&document)?)
    }

    fn expand_source(&self, source_id: u64) -> Result<ExpandedSource> {
        let data = self.managers.source_data.find(source_id)?;
        let names = self.managers.source_names.find(source_id)?;
        Ok(ExpandedSource {
            source_id,
            file_hash: hex::encode(&data.file_binary_hash),
            filesize: data.filesize,
            file_type: data.file_type,
            low_entropy_count: data.low_entropy_count,
            names: names
                .into_iter()
                .map(|(repository_name, filename)| ExpandedName {
                    repository_name,
                    filename,
                })
                .collect(),
        })
    }

    pub fn find_source_data(&self, source_id: u64) -> Result<SourceData> {
        self.managers.source_data.find(source_id)
    }

    pub fn find_source_names(&self, source_id: u64) -> Result<Vec<(String, String)>> {
        self.managers.source_names.find(source_id)
    }

    pub fn find_source_id(&self, file_binary_hash: &[u8]) -> Result<Option<u64>> {
        self.managers.source_ids.find(file_binary_hash)
    }

    pub fn hash_begin(&self) -> Result<Option<Vec<u8>>> {
        self.managers.hash_data.first_hash()
    }

    pub fn hash_next(&self, prev: &[u8]) -> Result<Option<Vec<u8>>> {
        self.managers.hash_data.next_hash(prev)
    }

    pub fn source_begin(&self) -> Result<Option<u64>> {
        self.managers.source_data.first_source()
    }

    pub fn source_next(&self, prev: u64) -> Result<Option<u64>> {
        self.managers.source_data.next_source(prev)
    }

    pub fn sizes(&self) -> Result<StoreSizes> {
        self.managers.sizes()
    }

    /// Number of entries in the hash-data store.
    pub fn size(&self) -> Result<u64> {
        self.managers.hash_data.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_refuses_existing_path() -> Result<()> {
        let dir = tempdir()?;
        assert!(matches!(
            create_hashdb(dir.path(), 512, 512, 2, 28, 3, "test"),
            Err(Error::Invalid(_))
        ));
        Ok(())
    }

    #[test]
    fn create_applies_defaults_for_zero_parameters() -> Result<()> {
        let dir = tempdir()?;
        let db_dir = dir.path().join("db");
        create_hashdb(&db_dir, 0, 0, 0, 0, 0, "test")?;

        let s = hashdb_settings(&db_dir)?;
        assert_eq!(s, Settings::default());
        is_valid_hashdb(&db_dir)?;
        Ok(())
    }

    #[test]
    fn missing_directory_is_not_valid() {
        let dir = tempdir().unwrap();
        assert!(is_valid_hashdb(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn import_session_requires_existing_database() {
        let dir = tempdir().unwrap();
        assert!(ImportSession::open(&dir.path().join("nope"), "test").is_err());
    }

    #[test]
    fn scan_session_sees_import_results() -> Result<()> {
        let dir = tempdir()?;
        let db_dir = dir.path().join("db");
        create_hashdb(&db_dir, 512, 512, 2, 28, 3, "create")?;

        {
            let mut import = ImportSession::open(&db_dir, "import")?;
            let (was_new, source_id) = import.insert_source_id(&[0xaa; 16])?;
            assert!(was_new);
            import.insert_source_data(source_id, &[0xaa; 16], 800, "E01", 0)?;
            import.insert_source_name(source_id, "repo", "image.E01")?;
            assert_eq!(import.insert_hash(&[1u8; 16], 1.0, "bl", source_id, 512)?, 1);

            let sizes = import.sizes()?;
            assert_eq!(sizes.hash_data_store, 1);
            assert_eq!(sizes.source_data_store, 1);
            assert_eq!(sizes.source_id_store, 1);
            assert_eq!(sizes.source_name_store, 1);
        }

        let scan = ScanSession::open(&db_dir)?;
        let record = scan.find_hash(&[1u8; 16])?.unwrap();
        assert_eq!(record.count, 1);
        assert_eq!(scan.find_source_id(&[0xaa; 16])?, Some(1));
        assert_eq!(scan.find_source_data(1)?.filesize, 800);
        assert_eq!(
            scan.find_source_names(1)?,
            vec![("repo".to_string(), "image.E01".to_string())]
        );
        assert_eq!(scan.size()?, 1);
        Ok(())
    }

    #[test]
    fn closing_an_import_session_logs_changes() -> Result<()> {
        let dir = tempdir()?;
        let db_dir = dir.path().join("db");
        create_hashdb(&db_dir, 512, 512, 2, 28, 3, "create")?;

        {
            let mut import = ImportSession::open(&db_dir, "import run")?;
            import.insert_hash(&[1u8; 16], 0.0, "", 1, 0)?;
        }

        let contents = std::fs::read_to_string(db_dir.join(crate::logger::LOG_FILE))?;
        let last: serde_json::Value =
            serde_json::from_str(contents.lines().last().unwrap())?;
        assert_eq!(last["changes"]["source_inserted"], 1);
        assert_eq!(last["changes"]["offset_inserted"], 1);
        Ok(())
    }
}
