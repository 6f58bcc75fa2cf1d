use crate::changes::Changes;
use crate::codec;
use crate::error::Result;
use crate::schema;
use crate::store::Store;
use redb::ReadableTable;
use std::ops::Bound;
use std::sync::Arc;

/// Per-source metadata: the file's own hash, its size, a type string and
/// the count of low-entropy blocks seen in it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceData {
    pub file_binary_hash: Vec<u8>,
    pub filesize: u64,
    pub file_type: String,
    pub low_entropy_count: u64,
}

fn encode(data: &SourceData) -> Vec<u8> {
    let mut out = Vec::new();
    codec::put_varint(&mut out, data.filesize);
    codec::put_bytes(&mut out, &data.file_binary_hash);
    codec::put_str(&mut out, &data.file_type);
    codec::put_varint(&mut out, data.low_entropy_count);
    out
}

fn decode(buf: &[u8]) -> Result<SourceData> {
    let mut at = 0;
    let filesize = codec::get_varint(buf, &mut at)?;
    let file_binary_hash = codec::get_bytes(buf, &mut at)?.to_vec();
    let file_type = codec::get_str(buf, &mut at)?;
    let low_entropy_count = codec::get_varint(buf, &mut at)?;
    Ok(SourceData {
        file_binary_hash,
        filesize,
        file_type,
        low_entropy_count,
    })
}

/// Stores one metadata record per source id.
pub struct SourceDataManager {
    store: Arc<Store>,
}

impl SourceDataManager {
    pub fn new(store: Arc<Store>) -> Self {
        SourceDataManager { store }
    }

    /// Write-through insert. Returns true when a record was written:
    /// missing counts as inserted, a differing stored tuple is
    /// overwritten and counted as changed, an identical one is left
    /// alone.
    pub fn insert(
        &self,
        source_id: u64,
        data: &SourceData,
        changes: &mut Changes,
    ) -> Result<bool> {
        if source_id == 0 {
            tracing::warn!("insert_source_data: source id 0 is reserved");
            return Ok(false);
        }
        if data.file_binary_hash.is_empty() {
            tracing::warn!(source_id, "insert_source_data: empty file binary hash");
            return Ok(false);
        }

        let encoded = encode(data);
        let tx = self.store.begin_write()?;
        let outcome = {
            let mut table = tx.open_table(schema::SOURCE_DATA)?;
            let existing = table.get(source_id)?.map(|v| v.value().to_vec());
            match existing {
                Some(old) if old == encoded => None,
                Some(_) => {
                    table.insert(source_id, encoded.as_slice())?;
                    Some(false)
                }
                None => {
                    table.insert(source_id, encoded.as_slice())?;
                    Some(true)
                }
            }
        };
        tx.commit()?;

        match outcome {
            Some(true) => changes.source_data_inserted += 1,
            Some(false) => changes.source_data_changed += 1,
            None => changes.source_data_same += 1,
        }
        Ok(outcome.is_some())
    }

    /// Read the record for the source id; a zero-valued tuple if absent.
    pub fn find(&self, source_id: u64) -> Result<SourceData> {
        let tx = self.store.begin_read()?;
        let table = tx.open_table(schema::SOURCE_DATA)?;
        match table.get(source_id)? {
            Some(v) => decode(v.value()),
            None => Ok(SourceData::default()),
        }
    }

    pub fn first_source(&self) -> Result<Option<u64>> {
        let tx = self.store.begin_read()?;
        let table = tx.open_table(schema::SOURCE_DATA)?;
        let mut range = table.range::<u64>(..)?;
        match range.next() {
            Some(entry) => Ok(Some(entry?.0.value())),
            None => Ok(None),
        }
    }

    pub fn next_source(&self, prev: u64) -> Result<Option<u64>> {
        let tx = self.store.begin_read()?;
        let table = tx.open_table(schema::SOURCE_DATA)?;
        let mut range = table.range::<u64>((Bound::Excluded(prev), Bound::Unbounded))?;
        match range.next() {
            Some(entry) => Ok(Some(entry?.0.value())),
            None => Ok(None),
        }
    }

    pub fn size(&self) -> Result<u64> {
        self.store.table_len(schema::SOURCE_DATA)
    }
}
