use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

pub const SETTINGS_FILE: &str = "settings.json";
pub const OLD_SETTINGS_FILE: &str = "_old_settings.json";

/// Version of the on-disk data store format.
pub const CURRENT_DATA_STORE_VERSION: u32 = 3;

pub const DEFAULT_SECTOR_SIZE: u32 = 512;
pub const DEFAULT_BLOCK_SIZE: u32 = 512;
pub const DEFAULT_MAX_ID_OFFSET_PAIRS: u32 = 60;
pub const DEFAULT_MAX_SUB_COUNT: u32 = 55;
pub const DEFAULT_HASH_MANAGER_KEY_BITS: u32 = 28;
pub const DEFAULT_HASH_MANAGER_HASH_BYTES: u32 = 3;

/// Database tuning settings, written once at creation and read-only
/// afterward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub data_store_version: u32,
    pub sector_size: u32,
    pub block_size: u32,
    pub max_id_offset_pairs: u32,
    pub max_sub_count: u32,
    pub hash_manager_key_bits: u32,
    pub hash_manager_hash_bytes: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            data_store_version: CURRENT_DATA_STORE_VERSION,
            sector_size: DEFAULT_SECTOR_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            max_id_offset_pairs: DEFAULT_MAX_ID_OFFSET_PAIRS,
            max_sub_count: DEFAULT_MAX_SUB_COUNT,
            hash_manager_key_bits: DEFAULT_HASH_MANAGER_KEY_BITS,
            hash_manager_hash_bytes: DEFAULT_HASH_MANAGER_HASH_BYTES,
        }
    }
}

/// Read settings from `settings.json` in the database directory.
///
/// The file holds one JSON object on the first non-comment line; lines
/// beginning with `#` are skipped. A missing or unparseable file and a
/// data store version older than the current one are all reject causes.
pub fn read_settings(dir: &Path) -> Result<Settings> {
    if !dir.is_dir() {
        return Err(Error::Invalid(format!(
            "no database at path '{}'",
            dir.display()
        )));
    }

    let path = dir.join(SETTINGS_FILE);
    if !path.is_file() {
        return Err(Error::Invalid(format!(
            "path '{}' is not a hash database",
            dir.display()
        )));
    }

    let reader = BufReader::new(File::open(&path)?);
    let mut json_line = String::new();
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        json_line = line;
        break;
    }

    if json_line.is_empty() {
        return Err(Error::Invalid(format!(
            "empty settings file at path '{}'",
            dir.display()
        )));
    }

    let settings: Settings = serde_json::from_str(&json_line).map_err(|e| {
        Error::Invalid(format!(
            "invalid settings file at path '{}': {}",
            dir.display(),
            e
        ))
    })?;

    if settings.data_store_version < CURRENT_DATA_STORE_VERSION {
        return Err(Error::Version {
            found: settings.data_store_version,
            expected: CURRENT_DATA_STORE_VERSION,
        });
    }

    Ok(settings)
}

/// Write settings to `settings.json`, preserving any existing file as
/// `_old_settings.json` first.
pub fn write_settings(dir: &Path, settings: &Settings) -> Result<()> {
    let path = dir.join(SETTINGS_FILE);
    let old_path = dir.join(OLD_SETTINGS_FILE);

    if path.exists() {
        let _ = fs::remove_file(&old_path);
        if let Err(e) = fs::rename(&path, &old_path) {
            tracing::warn!(
                from = %path.display(),
                to = %old_path.display(),
                error = %e,
                "unable to back up settings file"
            );
        }
    }

    let mut f = File::create(&path)?;
    writeln!(f, "# block hash database settings")?;
    writeln!(f, "{}", serde_json::to_string(settings)?)?;
    f.sync_all()?;
    Ok(())
}
