use redb::TableDefinition;

// block hash -> Type 1/2 record; continuation rows under hash || be64(source_id)
pub const HASH_DATA: TableDefinition<&[u8], &[u8]> = TableDefinition::new("hash_data");

// hash prefix -> packed suffix fragments (presence filter)
pub const HASH_FILTER: TableDefinition<&[u8], &[u8]> = TableDefinition::new("hash_filter");

// file binary hash -> source_id
pub const SOURCE_ID: TableDefinition<&[u8], u64> = TableDefinition::new("source_id");

// source_id -> metadata blob (filesize, file hash, file type, low-entropy count)
pub const SOURCE_DATA: TableDefinition<u64, &[u8]> = TableDefinition::new("source_data");

// varint(source_id) || prefixed repository_name || prefixed filename -> ()
pub const SOURCE_NAME: TableDefinition<&[u8], ()> = TableDefinition::new("source_name");

// counters
pub const KV_U64: TableDefinition<&str, u64> = TableDefinition::new("kv_u64");
pub const KEY_NEXT_SOURCE_ID: &str = "next_source_id";
