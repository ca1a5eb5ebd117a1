use thiserror::Error;

/// Engine-wide error taxonomy.
///
/// Every fallible public operation in the crate returns [`Result`]. Errors
/// inside a transaction surface to the caller without aborting it, with one
/// exception: [`DbError::SerializationConflict`] transitions the transaction
/// to `Aborted` before the error is returned.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("serialization conflict")]
    SerializationConflict,

    #[error("transaction is not active: {0}")]
    TransactionState(String),

    #[error("buffer pool exhausted: all pages pinned")]
    PoolExhausted,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt page: {0}")]
    CorruptPage(String),

    #[error("database is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, DbError>;

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::InvalidArgument(format!("malformed document: {}", e))
    }
}
