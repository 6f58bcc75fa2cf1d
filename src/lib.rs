//! Content-addressed block-hash database.
//!
//! A persistent store for cryptographic block hashes observed during
//! forensic media scans: which sources each hash appeared in, how often,
//! and at which byte offsets. Writes go through an [`ImportSession`],
//! probes through a [`ScanSession`]; both operate on a database directory
//! created once with [`create_hashdb`].

pub mod changes;
pub mod codec;
pub mod db;
pub mod error;
pub mod filter;
pub mod hash_data;
pub mod logger;
pub mod logging;
pub mod schema;
pub mod settings;
pub mod source_data;
pub mod source_id;
pub mod source_name;
pub mod store;

pub use changes::Changes;
pub use db::{create_hashdb, hashdb_settings, is_valid_hashdb};
pub use db::{ImportSession, ScanSession, StoreSizes};
pub use error::{Error, Result};
pub use hash_data::{HashRecord, SourceEntry};
pub use settings::Settings;
pub use source_data::SourceData;
