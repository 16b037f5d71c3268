use std::io;

use thiserror::Error;

/// Crate-wide error type.
///
/// Callers distinguish failure classes by variant, the record manager
/// relies on this to decide between "abort the transaction" and "attempt
/// recovery".
#[derive(Error, Debug)]
pub enum MaviError {
    #[error("key not found")]
    NotFound,

    #[error("`{0}` already exists")]
    AlreadyExists(String),

    #[error("corrupt page at offset {offset}: {reason}")]
    CorruptPage { offset: u64, reason: String },

    #[error("io error")]
    Io(#[from] io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transaction aborted")]
    TransactionAborted,

    #[error("serializer error: {0}")]
    Serializer(String),
}

impl MaviError {
    pub fn corrupt(offset: u64, reason: &str) -> Self {
        MaviError::CorruptPage {
            offset,
            reason: reason.to_string(),
        }
    }

    pub fn invalid(reason: &str) -> Self {
        MaviError::InvalidArgument(reason.to_string())
    }
}
