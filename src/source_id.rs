use crate::changes::Changes;
use crate::error::Result;
use crate::schema;
use crate::store::Store;
use redb::ReadableTable;
use std::sync::Arc;

/// Translates file binary hashes into dense source ids.
///
/// Ids are assigned monotonically starting at 1 and never reused; 0 means
/// "absent". The hash index row and the allocator row are written in the
/// same transaction.
pub struct SourceIdManager {
    store: Arc<Store>,
}

impl SourceIdManager {
    pub fn new(store: Arc<Store>) -> Self {
        SourceIdManager { store }
    }

    /// Return the id for the file hash, allocating one on first sighting.
    pub fn insert(&self, file_binary_hash: &[u8], changes: &mut Changes) -> Result<(bool, u64)> {
        if file_binary_hash.is_empty() {
            tracing::warn!("insert_source_id: empty file binary hash");
            return Ok((false, 0));
        }

        let tx = self.store.begin_write()?;
        let (is_new, source_id) = {
            let mut ids = tx.open_table(schema::SOURCE_ID)?;
            let mut kv = tx.open_table(schema::KV_U64)?;

            let existing = ids.get(file_binary_hash)?.map(|v| v.value());
            if let Some(v) = existing {
                (false, v)
            } else {
                let next_id = match kv.get(schema::KEY_NEXT_SOURCE_ID)? {
                    Some(v) => v.value(),
                    None => 1, // start at 1
                };
                kv.insert(schema::KEY_NEXT_SOURCE_ID, next_id + 1)?;
                ids.insert(file_binary_hash, next_id)?;
                (true, next_id)
            }
        };
        tx.commit()?;

        if is_new {
            changes.source_id_inserted += 1;
        } else {
            changes.source_id_already_present += 1;
        }
        Ok((is_new, source_id))
    }

    pub fn find(&self, file_binary_hash: &[u8]) -> Result<Option<u64>> {
        if file_binary_hash.is_empty() {
            return Ok(None);
        }
        let tx = self.store.begin_read()?;
        let ids = tx.open_table(schema::SOURCE_ID)?;
        Ok(ids.get(file_binary_hash)?.map(|v| v.value()))
    }

    pub fn size(&self) -> Result<u64> {
        self.store.table_len(schema::SOURCE_ID)
    }
}
