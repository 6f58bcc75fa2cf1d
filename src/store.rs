use crate::error::{Error, Result};
use crate::schema;
use fs2::FileExt;
use redb::{Database, ReadTransaction, WriteTransaction};
use std::fs::{File, OpenOptions};
use std::path::Path;

pub const STORE_FILE: &str = "store.redb";
pub const LOCK_FILE: &str = "LOCK";

/// File mode a database environment is opened under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Open existing tables for reading; any write call fails.
    ReadOnly,
    /// Create a new store. Fails if one is already present.
    RwNew,
    /// Open an existing store for reading and writing.
    RwModify,
}

/// One KV environment holding all tables of a database directory.
///
/// Writers take an exclusive lock on a LOCK file so only one writing
/// process can have the directory open; readers take no lock.
pub struct Store {
    db: Database,
    mode: Mode,
    // Keep the lock file open for the lifetime of the store, so the lock is held.
    _lock_file: Option<File>,
}

impl Store {
    pub fn open(dir: &Path, mode: Mode) -> Result<Store> {
        let db_path = dir.join(STORE_FILE);

        let lock_file = match mode {
            Mode::ReadOnly => None,
            Mode::RwNew | Mode::RwModify => Some(open_and_lock(dir)?),
        };

        let db = match mode {
            Mode::RwNew => {
                if db_path.exists() {
                    return Err(Error::Invalid(format!(
                        "store file already exists at {}",
                        db_path.display()
                    )));
                }
                Database::create(&db_path)?
            }
            Mode::RwModify | Mode::ReadOnly => {
                if !db_path.is_file() {
                    return Err(Error::Invalid(format!(
                        "no store file at {}",
                        db_path.display()
                    )));
                }
                Database::open(&db_path)?
            }
        };

        let store = Store {
            db,
            mode,
            _lock_file: lock_file,
        };

        if mode != Mode::ReadOnly {
            store.ensure_schema()?;
        }

        Ok(store)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn begin_read(&self) -> Result<ReadTransaction> {
        Ok(self.db.begin_read()?)
    }

    /// Start a write transaction, or fail with a distinct error when the
    /// store was opened read-only.
    pub fn begin_write(&self) -> Result<WriteTransaction> {
        if self.mode == Mode::ReadOnly {
            return Err(Error::ReadOnly);
        }
        Ok(self.db.begin_write()?)
    }

    pub fn table_len<K, V>(&self, def: redb::TableDefinition<'static, K, V>) -> Result<u64>
    where
        K: redb::Key + 'static,
        V: redb::Value + 'static,
    {
        use redb::ReadableTableMetadata;
        let tx = self.begin_read()?;
        let table = tx.open_table(def)?;
        Ok(table.len()?)
    }

    fn ensure_schema(&self) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let _ = tx.open_table(schema::HASH_DATA)?;
            let _ = tx.open_table(schema::HASH_FILTER)?;
            let _ = tx.open_table(schema::SOURCE_ID)?;
            let _ = tx.open_table(schema::SOURCE_DATA)?;
            let _ = tx.open_table(schema::SOURCE_NAME)?;
            let _ = tx.open_table(schema::KV_U64)?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn open_and_lock(dir: &Path) -> Result<File> {
    let lock_path = dir.join(LOCK_FILE);
    let f = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&lock_path)?;

    // Exclusive lock: one writer process at a time.
    f.try_lock_exclusive().map_err(|_| {
        Error::Invalid(format!("database is locked (in use?): {}", dir.display()))
    })?;

    Ok(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn new_store_creates_tables() -> Result<()> {
        let dir = tempdir()?;
        let store = Store::open(dir.path(), Mode::RwNew)?;
        assert_eq!(store.table_len(schema::HASH_DATA)?, 0);
        assert_eq!(store.table_len(schema::SOURCE_ID)?, 0);
        Ok(())
    }

    #[test]
    fn rw_new_refuses_existing_store() -> Result<()> {
        let dir = tempdir()?;
        drop(Store::open(dir.path(), Mode::RwNew)?);
        assert!(matches!(
            Store::open(dir.path(), Mode::RwNew),
            Err(Error::Invalid(_))
        ));
        Ok(())
    }

    #[test]
    fn read_only_store_rejects_writes() -> Result<()> {
        let dir = tempdir()?;
        drop(Store::open(dir.path(), Mode::RwNew)?);
        let store = Store::open(dir.path(), Mode::ReadOnly)?;
        assert!(matches!(store.begin_write(), Err(Error::ReadOnly)));
        Ok(())
    }

    #[test]
    fn modify_requires_existing_store() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            Store::open(dir.path(), Mode::RwModify),
            Err(Error::Invalid(_))
        ));
    }
}
