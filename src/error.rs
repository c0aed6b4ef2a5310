use thiserror::Error;

use crate::parser::ParseError;
use crate::site::{DataError, LockError};
use crate::transaction::TransactionError;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, DbError>;

/// Top-level error type aggregating every subsystem's failures.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("data error: {0}")]
    Data(#[from] DataError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DbError {
    /// Parse and transaction errors are reported and survivable. Lock and
    /// data errors mean a broken engine invariant, and I/O errors an
    /// unusable input source; both terminate the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DbError::Lock(_) | DbError::Data(_) | DbError::Io(_))
    }
}
