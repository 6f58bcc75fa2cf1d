use thiserror::Error;

/// Errors surfaced by the database library.
///
/// Recoverable path and settings problems are `Invalid`; a write attempted
/// through a read-only session is `ReadOnly`; `Corrupt` means the store
/// itself cannot be decoded and the session should be abandoned.
#[derive(Debug, Error)]
pub enum Error {
    /// Path or settings problem: missing directory, not a database,
    /// unparseable settings file, directory already exists on create.
    #[error("{0}")]
    Invalid(String),

    /// The data store was written by a newer, incompatible format.
    #[error("data store version {found} is older than supported version {expected}")]
    Version { found: u32, expected: u32 },

    /// Write call on a session opened read-only.
    #[error("database is opened read-only")]
    ReadOnly,

    /// Undecodable record or inconsistent key/value pair. Fatal.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] redb::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Error::Storage(e.into())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Error::Storage(e.into())
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        Error::Storage(e.into())
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        Error::Storage(e.into())
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        Error::Storage(e.into())
    }
}
