use serde::Serialize;

/// Counters recording the effect of each ingest operation.
///
/// Held in memory by the writing session and flushed to log.json when the
/// session closes. The hash-data counters distinguish real growth
/// (source_inserted, offset_inserted) from sightings the store already
/// knew about (duplicate_offset_detected) and from header rewrites
/// (data_changed).
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Changes {
    pub source_inserted: u64,
    pub offset_inserted: u64,
    pub data_changed: u64,
    pub duplicate_offset_detected: u64,
    pub mismatched_sub_count_detected: u64,
    pub source_id_inserted: u64,
    pub source_id_already_present: u64,
    pub source_data_inserted: u64,
    pub source_data_changed: u64,
    pub source_data_same: u64,
    pub source_name_inserted: u64,
    pub source_name_already_present: u64,
}
