use crate::error::Result;
use crate::schema;
use crate::store::Store;
use redb::ReadableTable;
use std::sync::Arc;

/// Presence filter in front of the hash-data table.
///
/// Keyed by the first `key_bits` bits of a hash; the value is the
/// concatenation of `suffix_bytes`-wide fragments taken from the tail of
/// every inserted hash. Lookups can produce false positives (two hashes
/// agreeing on prefix and suffix) but never false negatives, and inserts
/// only ever add fragments, so the filter stays a conservative
/// over-approximation of the hash-data key set.
pub struct HashFilterManager {
    store: Arc<Store>,
    prefix_bytes: usize,
    prefix_mask: u8,
    suffix_bytes: usize,
}

impl HashFilterManager {
    pub fn new(store: Arc<Store>, key_bits: u32, suffix_bytes: u32) -> Self {
        let key_bits = key_bits.max(1);
        let prefix_bytes = key_bits.div_ceil(8) as usize;
        let prefix_mask = match key_bits % 8 {
            0 => 0xff,
            rem => 0xffu8 << (8 - rem),
        };
        HashFilterManager {
            store,
            prefix_bytes,
            prefix_mask,
            suffix_bytes: suffix_bytes.max(1) as usize,
        }
    }

    fn key_of(&self, hash: &[u8]) -> Vec<u8> {
        let take = self.prefix_bytes.min(hash.len());
        let mut key = hash[..take].to_vec();
        if take == self.prefix_bytes {
            if let Some(last) = key.last_mut() {
                *last &= self.prefix_mask;
            }
        }
        key
    }

    fn suffix_of(&self, hash: &[u8]) -> Vec<u8> {
        let take = self.suffix_bytes.min(hash.len());
        hash[hash.len() - take..].to_vec()
    }

    /// Record the hash. Idempotent; returns true when a new fragment was
    /// actually added.
    pub fn insert(&self, hash: &[u8]) -> Result<bool> {
        if hash.is_empty() {
            return Ok(false);
        }
        let key = self.key_of(hash);
        let suffix = self.suffix_of(hash);

        let tx = self.store.begin_write()?;
        let added = {
            let mut table = tx.open_table(schema::HASH_FILTER)?;
            let mut fragments = match table.get(key.as_slice())? {
                Some(v) => v.value().to_vec(),
                None => Vec::new(),
            };
            if fragments
                .chunks(self.suffix_bytes)
                .any(|frag| frag == suffix.as_slice())
            {
                false
            } else {
                fragments.extend_from_slice(&suffix);
                table.insert(key.as_slice(), fragments.as_slice())?;
                true
            }
        };
        tx.commit()?;
        Ok(added)
    }

    /// True for every hash ever inserted; false only if the hash was
    /// never inserted.
    pub fn maybe_contains(&self, hash: &[u8]) -> Result<bool> {
        if hash.is_empty() {
            return Ok(false);
        }
        let key = self.key_of(hash);
        let suffix = self.suffix_of(hash);

        let tx = self.store.begin_read()?;
        let table = tx.open_table(schema::HASH_FILTER)?;
        Ok(match table.get(key.as_slice())? {
            Some(v) => v
                .value()
                .chunks(self.suffix_bytes)
                .any(|frag| frag == suffix.as_slice()),
            None => false,
        })
    }

    pub fn size(&self) -> Result<u64> {
        self.store.table_len(schema::HASH_FILTER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Mode;
    use tempfile::tempdir;

    fn new_filter(dir: &std::path::Path) -> Result<HashFilterManager> {
        let store = Arc::new(Store::open(dir, Mode::RwNew)?);
        Ok(HashFilterManager::new(store, 28, 3))
    }

    #[test]
    fn inserted_hashes_are_reported_present() -> Result<()> {
        let dir = tempdir()?;
        let filter = new_filter(dir.path())?;

        let hashes: Vec<Vec<u8>> = (0u8..20).map(|i| vec![i; 16]).collect();
        for h in &hashes {
            assert!(filter.insert(h)?);
        }
        for h in &hashes {
            assert!(filter.maybe_contains(h)?);
        }
        Ok(())
    }

    #[test]
    fn absent_hash_is_reported_absent() -> Result<()> {
        let dir = tempdir()?;
        let filter = new_filter(dir.path())?;
        filter.insert(&[1u8; 16])?;
        assert!(!filter.maybe_contains(&[2u8; 16])?);
        Ok(())
    }

    #[test]
    fn insert_is_idempotent() -> Result<()> {
        let dir = tempdir()?;
        let filter = new_filter(dir.path())?;
        assert!(filter.insert(&[7u8; 16])?);
        assert!(!filter.insert(&[7u8; 16])?);
        assert_eq!(filter.size()?, 1);
        Ok(())
    }

    #[test]
    fn shared_prefix_hashes_share_one_bucket() -> Result<()> {
        let dir = tempdir()?;
        let filter = new_filter(dir.path())?;

        let mut a = vec![0xabu8; 16];
        let mut b = vec![0xabu8; 16];
        a[15] = 1;
        b[15] = 2;
        filter.insert(&a)?;
        filter.insert(&b)?;

        assert_eq!(filter.size()?, 1);
        assert!(filter.maybe_contains(&a)?);
        assert!(filter.maybe_contains(&b)?);
        Ok(())
    }

    #[test]
    fn empty_hash_is_never_present() -> Result<()> {
        let dir = tempdir()?;
        let filter = new_filter(dir.path())?;
        assert!(!filter.insert(&[])?);
        assert!(!filter.maybe_contains(&[])?);
        Ok(())
    }
}
