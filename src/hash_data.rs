use crate::changes::Changes;
use crate::codec;
use crate::error::{Error, Result};
use crate::filter::HashFilterManager;
use crate::schema;
use crate::store::Store;
use redb::ReadableTable;
use std::ops::Bound;
use std::sync::Arc;

/// Block labels are truncated to this many bytes before storage.
pub const MAX_BLOCK_LABEL_LEN: usize = 10;

const TYPE1_TAG: u8 = 1;
const TYPE2_TAG: u8 = 2;

/// Per-source occurrence record: how often the hash was sighted in the
/// source and a bounded sample of the byte offsets it was sighted at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub source_id: u64,
    pub sub_count: u64,
    /// Ascending, duplicate-free, each a multiple of the sector size.
    pub file_offsets: Vec<u64>,
}

/// The logical hash-data record all three on-disk tiers decode to.
#[derive(Debug, Clone, PartialEq)]
pub struct HashRecord {
    pub entropy: f64,
    pub block_label: String,
    pub count: u64,
    /// Ascending source-id order.
    pub sources: Vec<SourceEntry>,
}

// Decoded primary row. Type 1 carries the single source entry inline and
// implies count == sub_count. Type 2 carries the aggregate header plus the
// first entry; remaining entries live in continuation rows under
// hash || be64(source_id).
enum Primary {
    Type1 {
        entropy_k: u64,
        block_label: String,
        entry: SourceEntry,
    },
    Type2 {
        entropy_k: u64,
        block_label: String,
        count: u64,
        n_sources: u64,
        first: SourceEntry,
    },
}

/// Hash-data store: block hash -> entropy, label, and per-source
/// occurrence evidence, encoded as Type 1/2/3 rows.
///
/// The presence filter fronts every probe and records every accepted
/// insert. The filter write commits before the record write, which keeps
/// the filter a superset of the stored keys even if the process dies
/// between the two.
pub struct HashDataManager {
    store: Arc<Store>,
    filter: HashFilterManager,
    sector_size: u64,
    max_sub_count: u64,
    max_id_offset_pairs: u64,
}

fn entropy_to_k(entropy: f64) -> u64 {
    (entropy.max(0.0) * 1000.0).round() as u64
}

fn truncate_label(label: &str) -> &str {
    if label.len() <= MAX_BLOCK_LABEL_LEN {
        return label;
    }
    let mut end = MAX_BLOCK_LABEL_LEN;
    while !label.is_char_boundary(end) {
        end -= 1;
    }
    &label[..end]
}

fn continuation_key(hash: &[u8], source_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(hash.len() + 8);
    key.extend_from_slice(hash);
    key.extend_from_slice(&source_id.to_be_bytes());
    key
}

impl HashDataManager {
    pub fn new(
        store: Arc<Store>,
        filter: HashFilterManager,
        sector_size: u64,
        max_sub_count: u64,
        max_id_offset_pairs: u64,
    ) -> Self {
        HashDataManager {
            store,
            filter,
            sector_size: sector_size.max(1),
            max_sub_count,
            max_id_offset_pairs,
        }
    }

    // ---- codec ----------------------------------------------------------

    fn encode_entry(&self, out: &mut Vec<u8>, entry: &SourceEntry) {
        codec::put_varint(out, entry.source_id);
        codec::put_varint(out, entry.sub_count);
        codec::put_varint(out, entry.file_offsets.len() as u64);
        for &offset in &entry.file_offsets {
            codec::put_varint(out, offset / self.sector_size);
        }
    }

    fn decode_entry(&self, buf: &[u8], at: &mut usize) -> Result<SourceEntry> {
        let source_id = codec::get_varint(buf, at)?;
        let sub_count = codec::get_varint(buf, at)?;
        let n = codec::get_varint(buf, at)? as usize;
        let mut file_offsets = Vec::with_capacity(n);
        for _ in 0..n {
            let offset = codec::get_varint(buf, at)? * self.sector_size;
            if let Some(&last) = file_offsets.last() {
                if offset <= last {
                    return Err(Error::Corrupt(
                        "source entry offsets out of order".to_string(),
                    ));
                }
            }
            file_offsets.push(offset);
        }
        Ok(SourceEntry {
            source_id,
            sub_count,
            file_offsets,
        })
    }

    fn encode_type1(&self, entropy_k: u64, block_label: &str, entry: &SourceEntry) -> Vec<u8> {
        let mut out = vec![TYPE1_TAG];
        codec::put_varint(&mut out, entropy_k);
        codec::put_str(&mut out, block_label);
        self.encode_entry(&mut out, entry);
        out
    }

    fn encode_type2(
        &self,
        entropy_k: u64,
        block_label: &str,
        count: u64,
        n_sources: u64,
        first: &SourceEntry,
    ) -> Vec<u8> {
        let mut out = vec![TYPE2_TAG];
        codec::put_varint(&mut out, entropy_k);
        codec::put_str(&mut out, block_label);
        codec::put_varint(&mut out, count);
        codec::put_varint(&mut out, n_sources);
        self.encode_entry(&mut out, first);
        out
    }

    fn decode_primary(&self, buf: &[u8]) -> Result<Primary> {
        let mut at = 0;
        let tag = *buf
            .get(at)
            .ok_or_else(|| Error::Corrupt("empty hash data record".to_string()))?;
        at += 1;
        let entropy_k = codec::get_varint(buf, &mut at)?;
        let block_label = codec::get_str(buf, &mut at)?;
        match tag {
            TYPE1_TAG => {
                let entry = self.decode_entry(buf, &mut at)?;
                Ok(Primary::Type1 {
                    entropy_k,
                    block_label,
                    entry,
                })
            }
            TYPE2_TAG => {
                let count = codec::get_varint(buf, &mut at)?;
                let n_sources = codec::get_varint(buf, &mut at)?;
                let first = self.decode_entry(buf, &mut at)?;
                Ok(Primary::Type2 {
                    entropy_k,
                    block_label,
                    count,
                    n_sources,
                    first,
                })
            }
            other => Err(Error::Corrupt(format!(
                "unknown hash data record tag {other}"
            ))),
        }
    }

    // ---- write path ------------------------------------------------------

    /// Record one sighting of the hash in the source at the file offset.
    /// Returns the new aggregate count for the hash, or 0 when the input
    /// was rejected.
    pub fn insert(
        &self,
        hash: &[u8],
        entropy: f64,
        block_label: &str,
        source_id: u64,
        file_offset: u64,
        changes: &mut Changes,
    ) -> Result<u64> {
        self.apply(
            hash,
            entropy,
            block_label,
            source_id,
            1,
            &[file_offset],
            false,
            changes,
        )
    }

    /// Bulk/merge form: fold a caller-held SourceEntry into the record.
    /// `sub_count` is the contribution (applied additively); each offset
    /// is applied with the single-offset cap and duplicate rules. A
    /// stored sub_count differing from the claimed one is counted as a
    /// mismatch but the update still applies.
    pub fn merge(
        &self,
        hash: &[u8],
        entropy: f64,
        block_label: &str,
        source_id: u64,
        sub_count: u64,
        file_offsets: &[u64],
        changes: &mut Changes,
    ) -> Result<u64> {
        if sub_count == 0 || sub_count < file_offsets.len() as u64 {
            tracing::warn!(
                source_id,
                sub_count,
                offsets = file_offsets.len(),
                "merge: sub_count cannot cover the offset set"
            );
            return Ok(0);
        }
        self.apply(
            hash,
            entropy,
            block_label,
            source_id,
            sub_count,
            file_offsets,
            true,
            changes,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn apply(
        &self,
        hash: &[u8],
        entropy: f64,
        block_label: &str,
        source_id: u64,
        delta_sub: u64,
        file_offsets: &[u64],
        check_mismatch: bool,
        changes: &mut Changes,
    ) -> Result<u64> {
        if hash.is_empty() {
            tracing::warn!("insert_hash: empty block hash");
            return Ok(0);
        }
        if source_id == 0 {
            tracing::warn!("insert_hash: source id 0 is reserved");
            return Ok(0);
        }
        for &offset in file_offsets {
            if offset % self.sector_size != 0 {
                tracing::warn!(
                    offset,
                    sector_size = self.sector_size,
                    "insert_hash: file offset is not sector-aligned"
                );
                return Ok(0);
            }
        }

        let entropy_k = entropy_to_k(entropy);
        let block_label = truncate_label(block_label);
        let mut offsets = file_offsets.to_vec();
        offsets.sort_unstable();
        offsets.dedup();

        self.filter.insert(hash)?;

        let tx = self.store.begin_write()?;
        let new_count = {
            let mut table = tx.open_table(schema::HASH_DATA)?;
            let existing = table.get(hash)?.map(|v| v.value().to_vec());

            match existing {
                None => {
                    let mut entry = SourceEntry {
                        source_id,
                        sub_count: delta_sub,
                        file_offsets: Vec::new(),
                    };
                    self.apply_offsets(&mut entry, &offsets, changes);
                    changes.source_inserted += 1;
                    self.write_single_source(&mut table, hash, entropy_k, block_label, &entry)?;
                    delta_sub
                }
                Some(buf) => match self.decode_primary(&buf)? {
                    Primary::Type1 {
                        entropy_k: stored_k,
                        block_label: stored_label,
                        entry,
                    } => {
                        if stored_k != entropy_k || stored_label != block_label {
                            changes.data_changed += 1;
                        }
                        if entry.source_id == source_id {
                            let mut entry = entry;
                            if check_mismatch && entry.sub_count != delta_sub {
                                changes.mismatched_sub_count_detected += 1;
                            }
                            self.apply_offsets(&mut entry, &offsets, changes);
                            entry.sub_count += delta_sub;
                            let count = entry.sub_count;
                            self.write_single_source(
                                &mut table,
                                hash,
                                entropy_k,
                                block_label,
                                &entry,
                            )?;
                            count
                        } else {
                            // Second source: promote to Type 2 with the
                            // stored entry inline, unless the entry cap
                            // already forbids another source.
                            let count = entry.sub_count + delta_sub;
                            if self.max_id_offset_pairs <= 1 {
                                table.insert(
                                    hash,
                                    self.encode_type2(entropy_k, block_label, count, 1, &entry)
                                        .as_slice(),
                                )?;
                            } else {
                                let mut new_entry = SourceEntry {
                                    source_id,
                                    sub_count: delta_sub,
                                    file_offsets: Vec::new(),
                                };
                                self.apply_offsets(&mut new_entry, &offsets, changes);
                                changes.source_inserted += 1;
                                table.insert(
                                    hash,
                                    self.encode_type2(entropy_k, block_label, count, 2, &entry)
                                        .as_slice(),
                                )?;
                                let mut value = Vec::new();
                                self.encode_entry(&mut value, &new_entry);
                                table.insert(
                                    continuation_key(hash, source_id).as_slice(),
                                    value.as_slice(),
                                )?;
                            }
                            count
                        }
                    }
                    Primary::Type2 {
                        entropy_k: stored_k,
                        block_label: stored_label,
                        count,
                        n_sources,
                        first,
                    } => {
                        if stored_k != entropy_k || stored_label != block_label {
                            changes.data_changed += 1;
                        }
                        let count = count + delta_sub;

                        if first.source_id == source_id {
                            let mut first = first;
                            if check_mismatch && first.sub_count != delta_sub {
                                changes.mismatched_sub_count_detected += 1;
                            }
                            self.apply_offsets(&mut first, &offsets, changes);
                            first.sub_count += delta_sub;
                            table.insert(
                                hash,
                                self.encode_type2(
                                    entropy_k,
                                    block_label,
                                    count,
                                    n_sources,
                                    &first,
                                )
                                .as_slice(),
                            )?;
                            count
                        } else {
                            let cont_key = continuation_key(hash, source_id);
                            let stored_entry = table
                                .get(cont_key.as_slice())?
                                .map(|v| v.value().to_vec());

                            let n_sources = match stored_entry {
                                Some(value) => {
                                    let mut at = 0;
                                    let mut entry = self.decode_entry(&value, &mut at)?;
                                    if entry.source_id != source_id {
                                        return Err(Error::Corrupt(format!(
                                            "continuation row source id {} does not match key {}",
                                            entry.source_id, source_id
                                        )));
                                    }
                                    if check_mismatch && entry.sub_count != delta_sub {
                                        changes.mismatched_sub_count_detected += 1;
                                    }
                                    self.apply_offsets(&mut entry, &offsets, changes);
                                    entry.sub_count += delta_sub;
                                    let mut value = Vec::new();
                                    self.encode_entry(&mut value, &entry);
                                    table.insert(cont_key.as_slice(), value.as_slice())?;
                                    n_sources
                                }
                                None if n_sources >= self.max_id_offset_pairs => {
                                    // Entry cap reached: the sighting only
                                    // grows the aggregate count.
                                    n_sources
                                }
                                None => {
                                    let mut entry = SourceEntry {
                                        source_id,
                                        sub_count: delta_sub,
                                        file_offsets: Vec::new(),
                                    };
                                    self.apply_offsets(&mut entry, &offsets, changes);
                                    changes.source_inserted += 1;
                                    let mut value = Vec::new();
                                    self.encode_entry(&mut value, &entry);
                                    table.insert(cont_key.as_slice(), value.as_slice())?;
                                    n_sources + 1
                                }
                            };

                            table.insert(
                                hash,
                                self.encode_type2(
                                    entropy_k,
                                    block_label,
                                    count,
                                    n_sources,
                                    &first,
                                )
                                .as_slice(),
                            )?;
                            count
                        }
                    }
                },
            }
        };
        tx.commit()?;
        Ok(new_count)
    }

    // Offsets must arrive sorted and deduplicated. A known offset counts
    // as a duplicate sighting; a new one is stored while the per-source
    // cap allows, and silently dropped past it.
    fn apply_offsets(&self, entry: &mut SourceEntry, offsets: &[u64], changes: &mut Changes) {
        for &offset in offsets {
            match entry.file_offsets.binary_search(&offset) {
                Ok(_) => changes.duplicate_offset_detected += 1,
                Err(idx) => {
                    if (entry.file_offsets.len() as u64) < self.max_sub_count {
                        entry.file_offsets.insert(idx, offset);
                        changes.offset_inserted += 1;
                    }
                }
            }
        }
    }

    // A single-source record stays Type 1 while sub_count fits the cap,
    // and becomes a Type 2 with one inline entry the moment it does not.
    fn write_single_source(
        &self,
        table: &mut redb::Table<'_, &[u8], &[u8]>,
        hash: &[u8],
        entropy_k: u64,
        block_label: &str,
        entry: &SourceEntry,
    ) -> Result<()> {
        let value = if entry.sub_count <= self.max_sub_count {
            self.encode_type1(entropy_k, block_label, entry)
        } else {
            self.encode_type2(entropy_k, block_label, entry.sub_count, 1, entry)
        };
        table.insert(hash, value.as_slice())?;
        Ok(())
    }

    // ---- read path -------------------------------------------------------

    pub fn find(&self, hash: &[u8]) -> Result<Option<HashRecord>> {
        if hash.is_empty() {
            return Ok(None);
        }
        // Negative filter result short-circuits the probe; a false
        // positive just falls through to the authoritative lookup.
        if !self.filter.maybe_contains(hash)? {
            return Ok(None);
        }
        let tx = self.store.begin_read()?;
        let table = tx.open_table(schema::HASH_DATA)?;

        let Some(primary) = table.get(hash)? else {
            return Ok(None);
        };
        let primary = self.decode_primary(primary.value())?;

        let record = match primary {
            Primary::Type1 {
                entropy_k,
                block_label,
                entry,
            } => HashRecord {
                entropy: entropy_k as f64 / 1000.0,
                block_label,
                count: entry.sub_count,
                sources: vec![entry],
            },
            Primary::Type2 {
                entropy_k,
                block_label,
                count,
                n_sources,
                first,
            } => {
                let mut sources = vec![first];
                let range =
                    table.range::<&[u8]>((Bound::Excluded(hash), Bound::Unbounded))?;
                for entry in range {
                    let (key, value) = entry?;
                    let key = key.value();
                    if !key.starts_with(hash) {
                        break;
                    }
                    if key.len() != hash.len() + 8 {
                        return Err(Error::Corrupt(
                            "continuation key has unexpected length".to_string(),
                        ));
                    }
                    let key_source_id =
                        u64::from_be_bytes(key[hash.len()..].try_into().expect("8-byte suffix"));
                    let mut at = 0;
                    let entry = self.decode_entry(value.value(), &mut at)?;
                    if entry.source_id != key_source_id {
                        return Err(Error::Corrupt(format!(
                            "continuation row source id {} does not match key {}",
                            entry.source_id, key_source_id
                        )));
                    }
                    sources.push(entry);
                }
                if sources.len() as u64 != n_sources {
                    return Err(Error::Corrupt(format!(
                        "record names {} sources but {} are stored",
                        n_sources,
                        sources.len()
                    )));
                }
                sources.sort_by_key(|e| e.source_id);
                HashRecord {
                    entropy: entropy_k as f64 / 1000.0,
                    block_label,
                    count,
                    sources,
                }
            }
        };
        Ok(Some(record))
    }

    /// Aggregate count for the hash without expanding the source list.
    pub fn find_count(&self, hash: &[u8]) -> Result<u64> {
        if hash.is_empty() {
            return Ok(0);
        }
        if !self.filter.maybe_contains(hash)? {
            return Ok(0);
        }
        let tx = self.store.begin_read()?;
        let table = tx.open_table(schema::HASH_DATA)?;
        let Some(primary) = table.get(hash)? else {
            return Ok(0);
        };
        Ok(match self.decode_primary(primary.value())? {
            Primary::Type1 { entry, .. } => entry.sub_count,
            Primary::Type2 { count, .. } => count,
        })
    }

    pub fn first_hash(&self) -> Result<Option<Vec<u8>>> {
        let tx = self.store.begin_read()?;
        let table = tx.open_table(schema::HASH_DATA)?;
        let mut range = table.range::<&[u8]>(..)?;
        // The smallest key is always a primary row: continuation keys
        // extend their hash and so sort after it.
        match range.next() {
            Some(entry) => Ok(Some(entry?.0.value().to_vec())),
            None => Ok(None),
        }
    }

    pub fn next_hash(&self, prev: &[u8]) -> Result<Option<Vec<u8>>> {
        if prev.is_empty() {
            tracing::warn!("next_hash: empty previous hash");
            return Ok(None);
        }
        let tx = self.store.begin_read()?;
        let table = tx.open_table(schema::HASH_DATA)?;
        let range = table.range::<&[u8]>((Bound::Excluded(prev), Bound::Unbounded))?;
        for entry in range {
            let (key, _) = entry?;
            let key = key.value();
            // Skip prev's own continuation rows; all hashes are the same
            // width, so no other primary key can extend prev.
            if !key.starts_with(prev) {
                return Ok(Some(key.to_vec()));
            }
        }
        Ok(None)
    }

    pub fn size(&self) -> Result<u64> {
        self.store.table_len(schema::HASH_DATA)
    }
}
