use crate::changes::Changes;
use crate::codec;
use crate::error::Result;
use crate::schema;
use crate::store::Store;
use redb::ReadableTable;
use std::ops::Bound;
use std::sync::Arc;

/// Set of (repository name, filename) pairs per source id.
///
/// The whole pair is the table key (empty value), so uniqueness falls out
/// of the key space. Varints are prefix-free, which makes the
/// varint(source_id) range scan safe: no other source's rows can start
/// with the same bytes.
pub struct SourceNameManager {
    store: Arc<Store>,
}

fn name_key(source_id: u64, repository_name: &str, filename: &str) -> Vec<u8> {
    let mut key = Vec::new();
    codec::put_varint(&mut key, source_id);
    codec::put_str(&mut key, repository_name);
    codec::put_str(&mut key, filename);
    key
}

impl SourceNameManager {
    pub fn new(store: Arc<Store>) -> Self {
        SourceNameManager { store }
    }

    /// Put-if-absent. Returns true when the pair was new.
    pub fn insert(
        &self,
        source_id: u64,
        repository_name: &str,
        filename: &str,
        changes: &mut Changes,
    ) -> Result<bool> {
        if source_id == 0 {
            tracing::warn!("insert_source_name: source id 0 is reserved");
            return Ok(false);
        }

        let key = name_key(source_id, repository_name, filename);
        let tx = self.store.begin_write()?;
        let was_new = {
            let mut table = tx.open_table(schema::SOURCE_NAME)?;
            if table.get(key.as_slice())?.is_some() {
                false
            } else {
                table.insert(key.as_slice(), ())?;
                true
            }
        };
        tx.commit()?;

        if was_new {
            changes.source_name_inserted += 1;
        } else {
            changes.source_name_already_present += 1;
        }
        Ok(was_new)
    }

    /// All name pairs recorded for the source id, in key order.
    pub fn find(&self, source_id: u64) -> Result<Vec<(String, String)>> {
        let mut prefix = Vec::new();
        codec::put_varint(&mut prefix, source_id);

        let tx = self.store.begin_read()?;
        let table = tx.open_table(schema::SOURCE_NAME)?;

        let mut names = Vec::new();
        let range =
            table.range::<&[u8]>((Bound::Included(prefix.as_slice()), Bound::Unbounded))?;
        for entry in range {
            let (key, _) = entry?;
            let key = key.value();
            if !key.starts_with(prefix.as_slice()) {
                break;
            }
            let mut at = prefix.len();
            let repository_name = codec::get_str(key, &mut at)?;
            let filename = codec::get_str(key, &mut at)?;
            names.push((repository_name, filename));
        }
        Ok(names)
    }

    pub fn size(&self) -> Result<u64> {
        self.store.table_len(schema::SOURCE_NAME)
    }
}
